// samband/crates/samband/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use samband::{config::Config, run_server, AppState};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "samband", version, about = "Police event ingestion and archive service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and HTTP API (default)
    Serve,
    /// Run one ingestion cycle and print its result
    Fetch,
    /// Take one verified backup and print its outcome
    Backup,
    /// Run an integrity check on the event database
    Verify,
    /// Print database statistics
    Stats,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(cfg).await,
        Command::Fetch => {
            samband::telemetry::init_cli_tracing();
            let state = AppState::initialize(cfg)?;
            let result = state.pipeline.run_fetch_cycle().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Backup => {
            samband::telemetry::init_cli_tracing();
            let state = AppState::initialize(cfg)?;
            let backups = state.backups.clone();
            let outcome = tokio::task::spawn_blocking(move || backups.create_backup()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Verify => {
            samband::telemetry::init_cli_tracing();
            let state = match AppState::initialize(cfg) {
                Ok(state) => state,
                Err(e) => {
                    eprintln!("Database verification failed: {:#}", e);
                    std::process::exit(1);
                }
            };
            let report = state.store.verify_integrity()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Stats => {
            samband::telemetry::init_cli_tracing();
            let state = AppState::initialize(cfg)?;
            let stats = state.store.statistics()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
