//! Error types for the event store and its maintenance jobs.

use thiserror::Error;

/// Result type alias used by the storage layer.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the event store and the backup manager.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored payload could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `PRAGMA integrity_check` reported problems.
    #[error("Integrity check failed: {}", .0.join("; "))]
    Corrupt(Vec<String>),

    /// A backup artifact did not match its source.
    #[error("Backup verification failed: {0}")]
    Verification(String),
}

impl StoreError {
    /// True when the error means the database file itself is damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Corrupt(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_lists_every_problem() {
        let err = StoreError::Corrupt(vec!["page 3 bad".into(), "row 9 missing".into()]);
        assert_eq!(
            err.to_string(),
            "Integrity check failed: page 3 bad; row 9 missing"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn io_error_is_not_corruption() {
        let err = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(!err.is_corruption());
    }
}
