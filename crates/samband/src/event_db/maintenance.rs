//! Checkpointing, integrity verification and health statistics

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::schema::*;
use super::EventStore;
use crate::error::Result;

/// Run a full `PRAGMA integrity_check` on `conn`.
pub fn integrity_check(conn: &Connection) -> Result<IntegrityReport> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(IntegrityReport::from_rows(rows))
}

/// Row count of the events table behind `conn`.
pub fn event_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
}

impl EventStore {
    /// Move the WAL contents into the main file and truncate the WAL.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        let conn = self.conn()?;
        let (busy, log_pages, checkpointed): (i64, i64, i64) = conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let result = CheckpointResult {
            blocked: busy != 0,
            pages_written: checkpointed,
            pages_remaining: (log_pages - checkpointed).max(0),
        };
        if result.blocked {
            warn!("WAL checkpoint was blocked by concurrent access: {:?}", result);
        } else {
            debug!("WAL checkpoint completed: {:?}", result);
        }
        Ok(result)
    }

    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let conn = self.conn()?;
        let report = integrity_check(&conn)?;
        if !report.ok {
            warn!("Integrity check reported problems: {:?}", report.errors);
        }
        Ok(report)
    }

    /// Reclaim up to `pages` free pages (all free pages when `None`).
    pub fn incremental_vacuum(&self, pages: Option<u32>) -> Result<()> {
        let conn = self.conn()?;
        let sql = match pages {
            Some(pages) => format!("PRAGMA incremental_vacuum({})", pages),
            None => "PRAGMA incremental_vacuum".to_string(),
        };
        conn.execute_batch(&sql)?;
        info!("Incremental vacuum completed");
        Ok(())
    }

    pub fn statistics(&self) -> Result<DatabaseStats> {
        let conn = self.conn()?;

        let total_events = event_count(&conn)?;
        let unique_locations: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT location_name) FROM events",
            [],
            |row| row.get(0),
        )?;
        let date_range = conn.query_row(
            "SELECT MIN(datetime), MAX(datetime) FROM events",
            [],
            |row| {
                Ok(EventDateRange {
                    oldest: row.get(0)?,
                    newest: row.get(1)?,
                })
            },
        )?;

        let database_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        let last_fetch = conn
            .query_row(
                "SELECT fetched_at, events_new FROM fetch_log
                 WHERE success = 1 ORDER BY fetched_at DESC LIMIT 1",
                [],
                |row| {
                    Ok(LastFetch {
                        at: row.get(0)?,
                        new_events: row.get(1)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default();

        let last_backup = conn
            .query_row(
                "SELECT backup_at, filename, size_bytes FROM backup_log
                 WHERE success = 1 ORDER BY backup_at DESC LIMIT 1",
                [],
                |row| {
                    let size_bytes: Option<i64> = row.get(2)?;
                    Ok(LastBackup {
                        at: row.get(0)?,
                        filename: row.get(1)?,
                        size_bytes,
                        size_mb: size_bytes.map(|b| bytes_to_mb(b.max(0) as u64)),
                    })
                },
            )
            .optional()?
            .unwrap_or_default();

        Ok(DatabaseStats {
            total_events,
            unique_locations,
            date_range,
            database_size_bytes,
            database_size_mb: bytes_to_mb(database_size_bytes),
            last_fetch,
            last_backup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn fresh_store_passes_integrity_check() {
        let (_dir, store) = open_store();
        let report = store.verify_integrity().unwrap();
        assert!(report.ok);
        assert!(report.errors.is_none());
    }

    #[test]
    fn checkpoint_flushes_wal() {
        let (_dir, store) = open_store();
        for id in 0..20 {
            store
                .insert_if_absent(&event(id, "2024-05-01 10:00:00 +02:00", "Brand", "Visby"))
                .unwrap();
        }
        let result = store.checkpoint().unwrap();
        assert!(!result.blocked);
        assert_eq!(result.pages_remaining, 0);
    }

    #[test]
    fn incremental_vacuum_runs_on_initialized_store() {
        let (_dir, store) = open_store();
        store.incremental_vacuum(Some(100)).unwrap();
        store.incremental_vacuum(None).unwrap();
    }

    #[test]
    fn statistics_report_last_successful_fetch_and_backup() {
        let (_dir, store) = open_store();
        store
            .insert_if_absent(&event(1, "2024-05-01 10:00:00 +02:00", "Brand", "Visby"))
            .unwrap();
        store
            .insert_if_absent(&event(2, "2024-05-03 10:00:00 +02:00", "Brand", "Kalmar"))
            .unwrap();
        store.record_fetch_log(2, 2, true, None).unwrap();
        store.record_fetch_log(0, 0, false, Some("timeout")).unwrap();
        store
            .record_backup_log("events_backup_20240503_100000.db", Some(2 * 1024 * 1024), true, None)
            .unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.unique_locations, 2);
        assert_eq!(stats.date_range.oldest.as_deref(), Some("2024-05-01 10:00:00 +02:00"));
        assert_eq!(stats.date_range.newest.as_deref(), Some("2024-05-03 10:00:00 +02:00"));
        assert!(stats.database_size_bytes > 0);
        assert_eq!(stats.last_fetch.new_events, Some(2));
        assert_eq!(
            stats.last_backup.filename.as_deref(),
            Some("events_backup_20240503_100000.db")
        );
        assert_eq!(stats.last_backup.size_mb, Some(2.0));
    }

    #[test]
    fn statistics_without_history() {
        let (_dir, store) = open_store();
        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.last_fetch, LastFetch::default());
        assert!(stats.last_backup.at.is_none());
    }
}
