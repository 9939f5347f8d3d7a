//! Health, database status and operator-triggered fetch/backup

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use super::{run_blocking, ApiError};
use crate::event_db::{DatabaseStats, FetchLogEntry, IntegrityReport};
use crate::metrics;
use crate::shared_state::AppState;
use crate::workers::backup_worker::BackupFileInfo;

const RECENT_FETCHES: u32 = 10;

#[derive(Debug, Serialize)]
pub struct DatabaseInfo {
    #[serde(flatten)]
    pub stats: DatabaseStats,
    pub integrity: IntegrityReport,
    pub recent_fetches: Vec<FetchLogEntry>,
    pub backups: Vec<BackupFileInfo>,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/database`: health snapshot of the store and its backups.
pub async fn database_info(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let backups = state.backups.clone();
    let info = run_blocking(move || {
        Ok(DatabaseInfo {
            stats: store.statistics()?,
            integrity: store.verify_integrity()?,
            recent_fetches: store.fetch_log_entries(RECENT_FETCHES)?,
            backups: backups.list_backups()?,
        })
    })
    .await?;
    metrics::inc_request("database", "ok");
    Ok((StatusCode::OK, Json(info)))
}

/// `POST /api/fetch`: run one ingestion cycle now and return its result.
pub async fn trigger_fetch(State(state): State<AppState>) -> impl IntoResponse {
    info!("Manual fetch requested");
    let result = state.pipeline.run_fetch_cycle().await;
    metrics::inc_request("fetch", if result.success { "ok" } else { "failed" });
    (StatusCode::OK, Json(result))
}

/// `POST /api/backup`: take a verified backup now and return its outcome.
pub async fn trigger_backup(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    info!("Manual backup requested");
    let backups = state.backups.clone();
    let outcome = tokio::task::spawn_blocking(move || backups.create_backup())
        .await
        .map_err(|e| {
            error!("Backup task failed: {}", e);
            ApiError::internal()
        })?;
    metrics::inc_request("backup", if outcome.is_success() { "ok" } else { "failed" });
    Ok((StatusCode::OK, Json(outcome)))
}
