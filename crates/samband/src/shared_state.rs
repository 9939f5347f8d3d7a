//! Shared application state
//!
//! Every long-lived component is built once at startup and handed to the
//! scheduler and the HTTP handlers behind an `Arc`.

use std::sync::Arc;
use tracing::info;

use crate::{
    config::Config,
    event_db::EventStore,
    workers::{BackupManager, EventSource, IngestionPipeline, RemoteFetcher},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<EventStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub backups: Arc<BackupManager>,
}

impl AppState {
    /// Open and verify the event database, then wire the pipeline and backup
    /// manager around it. Fails if the database is corrupt.
    pub fn initialize(config: Config) -> anyhow::Result<Self> {
        let store = EventStore::open(&config.database_path, config.db_busy_timeout())?;
        store.initialize()?;
        let fetcher = RemoteFetcher::new(config.police_api_url.clone(), config.police_api_timeout());
        Ok(Self::from_parts(config, Arc::new(store), Arc::new(fetcher)))
    }

    /// Assemble state around an already initialized store and any event source.
    pub fn from_parts(config: Config, store: Arc<EventStore>, source: Arc<dyn EventSource>) -> Self {
        let pipeline = Arc::new(IngestionPipeline::new(Arc::clone(&store), source));
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&store),
            config.backup_path.clone(),
            config.backup_retention_days,
        ));
        info!("Application state ready");
        Self {
            config: Arc::new(config),
            store,
            pipeline,
            backups,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_creates_database_and_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("nested").join("events.db"),
            backup_path: dir.path().join("backups"),
            ..Config::default()
        };
        let state = AppState::initialize(config).unwrap();
        assert!(state.store.path().exists());
        assert_eq!(state.backups.backup_dir(), dir.path().join("backups"));
    }

    #[test]
    fn initialize_refuses_corrupt_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        std::fs::write(&path, b"definitely not sqlite, just some bytes padded out to a page".repeat(100)).unwrap();
        let config = Config {
            database_path: path,
            db_busy_timeout_seconds: 1,
            ..Config::default()
        };
        assert!(AppState::initialize(config).is_err());
    }
}
