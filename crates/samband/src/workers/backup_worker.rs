//! Backup worker
//!
//! Produces verified point-in-time copies of the event database. A copy is
//! only kept after it passes an integrity check and holds exactly as many
//! events as the live store; anything else is deleted on the spot.
use chrono::{DateTime, Utc};
use rusqlite::{Connection, DatabaseName, OpenFlags, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::event_db::maintenance::{event_count, integrity_check};
use crate::event_db::{format_timestamp, EventStore};
use crate::metrics;

const BACKUP_PREFIX: &str = "events_backup_";
const BACKUP_SUFFIX: &str = ".db";

/// Artifact file name for a backup taken at `at`.
pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("{}{}{}", BACKUP_PREFIX, at.format("%Y%m%d_%H%M%S"), BACKUP_SUFFIX)
}

fn is_backup_file_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSuccess {
    pub success: bool,
    pub filename: String,
    pub path: String,
    pub size_bytes: u64,
    pub events_count: i64,
    pub verified: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupFailure {
    pub success: bool,
    pub error: String,
}

/// Structured result of one backup attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BackupOutcome {
    Success(BackupSuccess),
    Failure(BackupFailure),
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Success(_))
    }
}

/// One artifact found in the backup directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupFileInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub modified_at: String,
}

/// Open an artifact and confirm it is intact and holds `expected_events` rows.
pub fn verify_artifact(path: &Path, expected_events: i64) -> Result<i64> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let report = match integrity_check(&conn) {
        Ok(report) => report,
        Err(e) if e.is_corruption() => return Err(StoreError::Corrupt(vec![e.to_string()])),
        Err(e) => return Err(e),
    };
    if !report.ok {
        return Err(StoreError::Corrupt(report.errors.unwrap_or_default()));
    }

    let found = event_count(&conn)?;
    if found != expected_events {
        return Err(StoreError::Verification(format!(
            "event count mismatch: source has {}, backup has {}",
            expected_events, found
        )));
    }
    Ok(found)
}

pub struct BackupManager {
    store: Arc<EventStore>,
    backup_dir: PathBuf,
    retention_days: u32,
}

impl BackupManager {
    pub fn new(store: Arc<EventStore>, backup_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        let backup_dir = backup_dir.into();
        info!(
            "Backup manager initialized: {} (retention {} days)",
            backup_dir.display(),
            retention_days
        );
        Self {
            store,
            backup_dir,
            retention_days,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Checkpoint, copy, verify, prune and log. Never returns an error;
    /// failures come back as [`BackupOutcome::Failure`].
    pub fn create_backup(&self) -> BackupOutcome {
        self.run_backup(|_| Ok(()))
    }

    /// `before_verify` runs between the copy and its verification.
    fn run_backup<F>(&self, before_verify: F) -> BackupOutcome
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let now = Utc::now();
        let filename = backup_file_name(now);
        let path = self.backup_dir.join(&filename);
        info!("Creating backup: {}", filename);

        match self.write_verified_copy(&path, before_verify) {
            Ok((size_bytes, events_count)) => {
                if let Err(e) = self.prune_old_backups(self.retention_days) {
                    warn!("Pruning old backups failed: {}", e);
                }
                if let Err(e) = self.store.record_backup_log(&filename, Some(size_bytes), true, None) {
                    error!("Failed to record backup log entry: {}", e);
                }
                metrics::inc_backup("ok");
                info!(
                    "Backup created: {} ({} bytes, {} events verified)",
                    filename, size_bytes, events_count
                );
                BackupOutcome::Success(BackupSuccess {
                    success: true,
                    filename,
                    path: path.display().to_string(),
                    size_bytes,
                    events_count,
                    verified: true,
                    created_at: format_timestamp(now),
                })
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                self.discard_artifact(&path);
                let message = e.to_string();
                if let Err(log_err) = self.store.record_backup_log(&filename, None, false, Some(message.as_str())) {
                    error!("Failed to record backup log entry: {}", log_err);
                }
                metrics::inc_backup("failed");
                BackupOutcome::Failure(BackupFailure {
                    success: false,
                    error: message,
                })
            }
        }
    }

    fn write_verified_copy<F>(&self, path: &Path, before_verify: F) -> Result<(u64, i64)>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        fs::create_dir_all(&self.backup_dir)?;
        self.store.checkpoint()?;

        // Count and copy inside one read transaction so both see the same
        // snapshot while ingestion keeps committing.
        let source_events = {
            let mut source = self.store.conn()?;
            let snapshot = source.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let count = event_count(&snapshot)?;
            snapshot.backup(DatabaseName::Main, path, None)?;
            snapshot.finish()?;
            count
        };
        let size_bytes = fs::metadata(path)?.len();

        before_verify(path)?;
        let verified = verify_artifact(path, source_events)?;
        Ok((size_bytes, verified))
    }

    fn discard_artifact(&self, path: &Path) {
        for leftover in [path.to_path_buf(), path.with_extension("db-wal"), path.with_extension("db-shm")] {
            match fs::remove_file(&leftover) {
                Ok(()) => debug!("Removed failed backup file: {}", leftover.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove failed backup {}: {}", leftover.display(), e),
            }
        }
    }

    /// Delete artifacts whose modification time is older than `retention_days`.
    /// Files not named like a backup are left alone.
    pub fn prune_old_backups(&self, retention_days: u32) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut deleted = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_backup_file_name(&name) {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Could not read mtime of {}: {}", name, e);
                    continue;
                }
            };
            if modified < cutoff {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!("Deleted old backup: {}", name);
                        deleted += 1;
                    }
                    Err(e) => warn!("Could not delete old backup {}: {}", name, e),
                }
            }
        }
        if deleted > 0 {
            info!("Cleaned up {} old backups", deleted);
        }
        Ok(deleted)
    }

    /// Backup artifacts currently on disk, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupFileInfo>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !is_backup_file_name(&filename) {
                continue;
            }
            // The file may be pruned between read_dir and here.
            let path = entry.path();
            let (metadata, modified) = match fs::metadata(&path).and_then(|m| m.modified().map(|t| (m, t))) {
                Ok(found) => found,
                Err(e) => {
                    warn!("Skipping backup {}: {}", filename, e);
                    continue;
                }
            };
            let modified: DateTime<Utc> = modified.into();
            found.push((modified, BackupFileInfo {
                filename,
                size_bytes: metadata.len(),
                modified_at: format_timestamp(modified),
            }));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.filename.cmp(&a.1.filename)));
        Ok(found.into_iter().map(|(_, info)| info).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_db::test_support::{event, open_store};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn manager_with_events(count: i64) -> (TempDir, Arc<EventStore>, BackupManager) {
        let (dir, store) = open_store();
        for id in 1..=count {
            store
                .insert_if_absent(&event(id, "2024-05-01 10:00:00 +02:00", "Brand", "Gävle"))
                .unwrap();
        }
        let store = Arc::new(store);
        let manager = BackupManager::new(Arc::clone(&store), dir.path().join("backups"), 30);
        (dir, store, manager)
    }

    fn backup_files(manager: &BackupManager) -> Vec<String> {
        manager.list_backups().unwrap().into_iter().map(|b| b.filename).collect()
    }

    #[test]
    fn backup_name_uses_second_resolution_timestamp() {
        let at = DateTime::parse_from_rfc3339("2024-05-03T07:08:09Z").unwrap().with_timezone(&Utc);
        assert_eq!(backup_file_name(at), "events_backup_20240503_070809.db");
        assert!(is_backup_file_name("events_backup_20240503_070809.db"));
        assert!(!is_backup_file_name("events.db"));
    }

    #[test]
    fn backup_round_trip_verifies_event_count() {
        let (_dir, store, manager) = manager_with_events(7);

        let outcome = manager.create_backup();
        let success = match outcome {
            BackupOutcome::Success(success) => success,
            BackupOutcome::Failure(f) => panic!("backup failed: {}", f.error),
        };
        assert_eq!(success.events_count, 7);
        assert!(success.verified);
        assert!(success.size_bytes > 0);
        assert!(Path::new(&success.path).exists());
        assert_eq!(verify_artifact(Path::new(&success.path), 7).unwrap(), 7);

        let log = store.backup_log_entries(1).unwrap();
        assert!(log[0].success);
        assert_eq!(log[0].filename, success.filename);
        assert_eq!(
            store.statistics().unwrap().last_backup.filename.as_deref(),
            Some(success.filename.as_str())
        );
    }

    #[test]
    fn corrupted_artifact_is_deleted_and_reported() {
        let (_dir, store, manager) = manager_with_events(3);

        let outcome = manager.run_backup(|path| {
            let mut file = fs::OpenOptions::new().write(true).open(path)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0xFF; 100])
        });

        assert!(!outcome.is_success());
        assert!(backup_files(&manager).is_empty());

        let log = store.backup_log_entries(1).unwrap();
        assert!(!log[0].success);
        assert!(log[0].filename.starts_with("events_backup_"));
        assert_eq!(log[0].size_bytes, None);
        assert!(log[0].error_message.is_some());
        assert!(store.statistics().unwrap().last_backup.at.is_none());
    }

    #[test]
    fn truncated_copy_fails_count_check() {
        let (_dir, _store, manager) = manager_with_events(4);

        let outcome = manager.run_backup(|path| {
            let conn = Connection::open(path).map_err(io::Error::other)?;
            conn.execute("DELETE FROM events WHERE id = 1", [])
                .map_err(io::Error::other)?;
            Ok(())
        });

        match outcome {
            BackupOutcome::Failure(failure) => {
                assert!(!failure.success);
                assert!(failure.error.contains("mismatch"), "{}", failure.error);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(backup_files(&manager).is_empty());
    }

    #[test]
    fn failure_serializes_without_success_fields() {
        let outcome = BackupOutcome::Failure(BackupFailure {
            success: false,
            error: "disk full".into(),
        });
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"success": false, "error": "disk full"})
        );
    }

    #[test]
    fn prune_uses_mtime_and_ignores_other_files() {
        let (_dir, _store, manager) = manager_with_events(0);
        fs::create_dir_all(manager.backup_dir()).unwrap();

        let old = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);
        let recent = SystemTime::now() - Duration::from_secs(2 * 24 * 60 * 60);
        for (name, mtime) in [
            ("events_backup_20200101_000000.db", old),
            ("events_backup_20240101_000000.db", recent),
            ("notes.txt", old),
        ] {
            let file = fs::File::create(manager.backup_dir().join(name)).unwrap();
            file.set_modified(mtime).unwrap();
        }

        assert_eq!(manager.prune_old_backups(30).unwrap(), 1);
        assert_eq!(backup_files(&manager), vec!["events_backup_20240101_000000.db"]);
        assert!(manager.backup_dir().join("notes.txt").exists());
    }

    #[test]
    fn prune_on_missing_directory_is_a_no_op() {
        let (_dir, _store, manager) = manager_with_events(0);
        assert_eq!(manager.prune_old_backups(30).unwrap(), 0);
        assert!(manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn backup_during_ingestion_counts_a_consistent_snapshot() {
        let (_dir, store, manager) = manager_with_events(50);
        let writer_store = Arc::clone(&store);
        let writer = std::thread::spawn(move || {
            for id in 1000..1400 {
                writer_store
                    .insert_if_absent(&event(id, "2024-05-02 10:00:00 +02:00", "Rån", "Gävle"))
                    .unwrap();
            }
        });

        for _ in 0..3 {
            let outcome = manager.create_backup();
            match outcome {
                BackupOutcome::Success(ok) => {
                    assert!(ok.events_count >= 50);
                    // Next copy may land on the same second-resolution name.
                    fs::remove_file(&ok.path).unwrap();
                }
                BackupOutcome::Failure(failed) => panic!("backup failed: {}", failed.error),
            }
        }
        writer.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn listing_skips_entries_that_vanish() {
        let (_dir, _store, manager) = manager_with_events(1);
        assert!(manager.create_backup().is_success());
        std::os::unix::fs::symlink(
            manager.backup_dir().join("gone.db"),
            manager.backup_dir().join("events_backup_20200101_000000.db"),
        )
        .unwrap();

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_ne!(listed[0].filename, "events_backup_20200101_000000.db");
    }

    #[test]
    fn verify_rejects_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_artifact(&dir.path().join("absent.db"), 0).is_err());
    }
}
