// samband/crates/samband/src/lib.rs

pub mod api;
pub mod config;
pub mod error;
pub mod event_db;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod workers;

// Public API exports
pub use config::Config;
pub use error::{Result, StoreError};
pub use event_db::{EventFilter, EventStore, Pagination, SortOrder};
pub use scheduler::Scheduler;
pub use server::{build_router, run_server};
pub use shared_state::AppState;
pub use workers::{
    BackupManager, BackupOutcome, EventSource, FetchCycleResult, FetchFailure, IngestionPipeline,
    RemoteFetcher,
};
