//! HTTP server
//!
//! Opens the event database, starts the scheduler and serves the API until
//! Ctrl-C. On shutdown the scheduler is cancelled and the WAL is folded back
//! into the main database file.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    api::{
        self, auth,
        rate_limit::{self, ClientRateLimiter},
    },
    config::Config,
    metrics,
    scheduler::Scheduler,
    shared_state::AppState,
};

/// Manual fetches allowed per client per minute.
const MANUAL_FETCHES_PER_MINUTE: u64 = 6;
/// Manual backups allowed per client per hour.
const MANUAL_BACKUPS_PER_HOUR: u64 = 2;

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins_list()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static(auth::API_KEY_HEADER), header::CONTENT_TYPE]);
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Public health/metrics routes plus the key-protected `/api` tree.
///
/// Limits are counted per client and per route. Only requests that pass the
/// key check count against a budget.
pub fn build_router(state: AppState) -> Router {
    let general = ClientRateLimiter::per_minute(state.config.rate_limit_per_minute);
    let fetches = ClientRateLimiter::per_minute(MANUAL_FETCHES_PER_MINUTE);
    let backups = ClientRateLimiter::per_hour(MANUAL_BACKUPS_PER_HOUR);

    let protected = Router::new()
        .route("/events", get(api::list_events))
        .route("/events/raw", get(api::list_events_raw))
        .route("/locations", get(api::list_locations))
        .route("/types", get(api::list_types))
        .route("/stats", get(api::statistics))
        .route("/database", get(api::database_info))
        .route(
            "/fetch",
            post(api::trigger_fetch).layer(middleware::from_fn_with_state(fetches, rate_limit::enforce)),
        )
        .route(
            "/backup",
            post(api::trigger_backup).layer(middleware::from_fn_with_state(backups, rate_limit::enforce)),
        )
        .route_layer(middleware::from_fn_with_state(general, rate_limit::enforce))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(metrics::get_metrics))
        .nest("/api", protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&state.config)),
        )
        .with_state(state)
}

/// Run the service until Ctrl-C.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let state = AppState::initialize(cfg).context("Failed to open event database")?;

    match state.store.statistics() {
        Ok(stats) => info!(
            "Database has {} events from {} locations ({} MB)",
            stats.total_events, stats.unique_locations, stats.database_size_mb
        ),
        Err(e) => warn!("Could not read database statistics: {}", e),
    }

    let scheduler = Scheduler::start(state.clone()).await;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let app = build_router(state.clone());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.checkpoint()).await {
        Ok(Ok(result)) => info!("Final WAL checkpoint: {:?}", result),
        Ok(Err(e)) => error!("Final WAL checkpoint failed: {}", e),
        Err(e) => error!("Final WAL checkpoint task failed: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::test_support::{test_state, upstream_event, CountingSource};
    use crate::workers::FetchFailure;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn seeded_state() -> (tempfile::TempDir, AppState) {
        let source = CountingSource::new(Ok(vec![
            upstream_event(1, "2024-05-01 08:00:00 +02:00", "Brand", "Uppsala"),
            upstream_event(2, "2024-05-02 09:00:00 +02:00", "Stöld", "Uppsala"),
            upstream_event(3, "2024-06-01 10:00:00 +02:00", "Brand", "Västerås"),
        ]));
        test_state(source)
    }

    async fn call(app: &Router, method: Method, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            request = request.header("X-API-Key", key);
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_dir, state) = seeded_state();
        let app = build_router(state);
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn api_requires_the_configured_key() {
        let (_dir, state) = seeded_state();
        let app = build_router(state);

        let (status, body) = call(&app, Method::GET, "/api/locations", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);

        let (status, _) = call(&app, Method::GET, "/api/locations", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, Method::GET, "/api/locations", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_fetch_then_query_events() {
        let (_dir, state) = seeded_state();
        let app = build_router(state);

        let (status, result) = call(&app, Method::POST, "/api/fetch", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["success"], true);
        assert_eq!(result["events_new"], 3);

        let (status, page) = call(&app, Method::GET, "/api/events?location=Uppsala&limit=1", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);
        assert_eq!(page["limit"], 1);
        assert_eq!(page["has_more"], true);
        assert_eq!(page["events"][0]["id"], 2);
        assert_eq!(page["events"][0]["location"]["name"], "Uppsala");

        let (status, raw) = call(&app, Method::GET, "/api/events/raw?date=2024-06&sort=asc", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(raw.as_array().map(Vec::len), Some(1));

        let (status, types) = call(&app, Method::GET, "/api/types", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(types[0], json!({"type": "Brand", "count": 2}));

        let (status, stats) = call(&app, Method::GET, "/api/stats?location=Uppsala", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 2);
    }

    #[tokio::test]
    async fn invalid_query_parameters_are_rejected() {
        let (_dir, state) = seeded_state();
        let app = build_router(state);

        for uri in [
            "/api/events?limit=0",
            "/api/events?limit=5000",
            "/api/events?offset=-1",
            "/api/events?date=May",
            "/api/events/raw?from=2024-13-01",
        ] {
            let (status, body) = call(&app, Method::GET, uri, Some(KEY)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["code"], 400, "{}", uri);
        }
    }

    #[tokio::test]
    async fn failed_manual_fetch_reports_reason() {
        let (_dir, state) = test_state(CountingSource::new(Err(FetchFailure::HttpStatus(503))));
        let app = build_router(state);

        let (status, result) = call(&app, Method::POST, "/api/fetch", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["success"], false);
        assert_eq!(result["failure_kind"], "http_status");
        assert_eq!(result["events_fetched"], 0);
    }

    #[tokio::test]
    async fn manual_backup_and_database_info() {
        let (_dir, state) = seeded_state();
        state.pipeline.run_fetch_cycle().await;
        let app = build_router(state);

        let (status, outcome) = call(&app, Method::POST, "/api/backup", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["events_count"], 3);

        let (status, info) = call(&app, Method::GET, "/api/database", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["total_events"], 3);
        assert_eq!(info["integrity"]["ok"], true);
        assert_eq!(info["backups"].as_array().map(Vec::len), Some(1));
        assert_eq!(info["last_backup"]["filename"], outcome["filename"]);
    }

    #[tokio::test]
    async fn requests_over_the_limit_get_429() {
        let (_dir, mut state) = seeded_state();
        let mut config = (*state.config).clone();
        config.rate_limit_per_minute = 2;
        state.config = std::sync::Arc::new(config);
        let app = build_router(state);

        let (first, _) = call(&app, Method::GET, "/api/types", Some(KEY)).await;
        let (second, _) = call(&app, Method::GET, "/api/types", Some(KEY)).await;
        let (third, body) = call(&app, Method::GET, "/api/types", Some(KEY)).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(third, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], 429);
    }

    #[tokio::test]
    async fn each_client_gets_its_own_backup_budget() {
        let (_dir, state) = seeded_state();
        state.pipeline.run_fetch_cycle().await;
        let app = build_router(state);

        let backup_from = |client: &'static str| {
            let app = app.clone();
            async move {
                let request = Request::builder()
                    .method(Method::POST)
                    .uri("/api/backup")
                    .header("X-API-Key", KEY)
                    .header("X-Forwarded-For", client)
                    .body(Body::empty())
                    .unwrap();
                app.oneshot(request).await.unwrap()
            }
        };

        assert_eq!(backup_from("198.51.100.1").await.status(), StatusCode::OK);
        assert_eq!(backup_from("198.51.100.1").await.status(), StatusCode::OK);
        let limited = backup_from("198.51.100.1").await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key(header::RETRY_AFTER));

        assert_eq!(backup_from("198.51.100.2").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_public() {
        metrics::init_metrics();
        let (_dir, state) = seeded_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
