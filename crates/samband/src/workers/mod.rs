pub mod backup_worker;
pub mod fetch_worker;
pub mod ingest_worker;
pub use backup_worker::{BackupManager, BackupOutcome};
pub use fetch_worker::{EventSource, FetchFailure, RemoteFetcher};
pub use ingest_worker::{FetchCycleResult, IngestionPipeline};
