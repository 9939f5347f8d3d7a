//! Event database module - SQLite-based durable storage for police events,
//! fetch/backup audit logs, and the maintenance operations around them.
pub mod schema;
pub mod queries;
pub mod ops_log;
pub mod maintenance;
pub use schema::*;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{error, info};

use crate::error::{Result, StoreError};

/// Pragmas applied to every pooled connection.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
";

/// Fixed-width naive UTC ISO-8601, so stored timestamps compare lexicographically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Owner of the primary database file and every schema object in it.
pub struct EventStore {
    path: PathBuf,
    busy_timeout: Duration,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EventStore {
    /// Open (creating if needed) the database file. Call [`EventStore::initialize`]
    /// before serving anything from it.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("Opening event database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch(CONNECTION_PRAGMAS)
            });
        // Connections are opened lazily so a damaged file is reported by
        // `initialize` instead of failing pool construction.
        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(0))
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .build(manager)?;
        Ok(Self {
            path: db_path.to_path_buf(),
            busy_timeout,
            pool: Arc::new(pool),
        })
    }

    /// Enable durability settings, refuse to continue on a corrupt file, and
    /// create any missing schema objects.
    pub fn initialize(&self) -> Result<()> {
        info!("Initializing event database schema...");
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;

        let report = match maintenance::integrity_check(&conn) {
            Ok(report) => report,
            Err(e) if e.is_corruption() => IntegrityReport {
                ok: false,
                errors: Some(vec![e.to_string()]),
            },
            Err(e) => return Err(e),
        };
        if !report.ok {
            let errors = report.errors.unwrap_or_default();
            error!("Database integrity check failed: {:?}", errors);
            return Err(StoreError::Corrupt(errors));
        }

        // auto_vacuum only takes effect before the first table exists.
        conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;")?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("Event database initialized successfully");
        Ok(())
    }

    /// Path of the primary database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a single `BEGIN IMMEDIATE` transaction. The transaction
    /// commits only when `f` succeeds and rolls back otherwise.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let (_dir, store) = open_store();
        store.initialize().unwrap();
        store.initialize().unwrap();

        let conn = store.conn().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn initialize_rejects_a_file_that_is_not_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        std::fs::write(&path, vec![0xA5u8; 8192]).unwrap();

        let store = EventStore::open(&path, Duration::from_secs(1)).unwrap();
        let err = store.initialize().unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {}", err);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_dir, store) = open_store();
        let result: Result<()> = store.with_transaction(|tx| {
            queries::insert_if_absent(tx, &event(1, "2024-05-01 10:00:00 +02:00", "Brand", "Uppsala"), "now")?;
            Err(StoreError::Verification("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.count_events(&EventFilter::default()).unwrap(), 0);
    }
}
