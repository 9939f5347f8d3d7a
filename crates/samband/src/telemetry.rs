// samband/crates/samband/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset. Connection-level chatter from the HTTP and
/// pool crates is kept at `warn`.
const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,r2d2=warn,tower_http=info";

fn env_filter() -> EnvFilter {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into());
    EnvFilter::new(filter)
}

/// Logging for the long-running server: compact lines on stdout.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    // A second call (tests, CLI subcommands) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Logging for one-shot CLI commands, which print JSON on stdout.
pub fn init_cli_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
