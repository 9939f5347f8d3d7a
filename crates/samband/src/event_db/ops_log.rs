//! Fetch and backup audit logs
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::info;

use super::schema::{BackupLogEntry, FetchLogEntry};
use super::{format_timestamp, EventStore};
use crate::error::Result;

/// Append a fetch-log row stamped with `at`.
pub fn record_fetch_log_at(
    conn: &Connection,
    at: DateTime<Utc>,
    events_fetched: usize,
    events_new: usize,
    success: bool,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fetch_log (fetched_at, events_fetched, events_new, success, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            format_timestamp(at),
            events_fetched as i64,
            events_new as i64,
            success,
            error_message,
        ],
    )?;
    Ok(())
}

impl EventStore {
    pub fn record_fetch_log(
        &self,
        events_fetched: usize,
        events_new: usize,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        record_fetch_log_at(&conn, Utc::now(), events_fetched, events_new, success, error_message)
    }

    /// Delete fetch-log rows older than `older_than_days`. Events are never touched.
    pub fn prune_fetch_logs(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(older_than_days)));
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM fetch_log WHERE fetched_at < ?1", [&cutoff])?;
        info!("Cleaned up {} old fetch log entries", deleted);
        Ok(deleted)
    }

    pub fn record_backup_log(
        &self,
        filename: &str,
        size_bytes: Option<u64>,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backup_log (backup_at, filename, size_bytes, success, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                super::now_timestamp(),
                filename,
                size_bytes.map(|s| s as i64),
                success,
                error_message,
            ],
        )?;
        Ok(())
    }

    /// Most recent fetch-log rows first.
    pub fn fetch_log_entries(&self, limit: u32) -> Result<Vec<FetchLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, fetched_at, events_fetched, events_new, success, error_message
             FROM fetch_log ORDER BY fetched_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([i64::from(limit)], |row| {
                Ok(FetchLogEntry {
                    id: row.get(0)?,
                    fetched_at: row.get(1)?,
                    events_fetched: row.get(2)?,
                    events_new: row.get(3)?,
                    success: row.get(4)?,
                    error_message: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent backup-log rows first.
    pub fn backup_log_entries(&self, limit: u32) -> Result<Vec<BackupLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, backup_at, filename, size_bytes, success, error_message
             FROM backup_log ORDER BY backup_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([i64::from(limit)], |row| {
                Ok(BackupLogEntry {
                    id: row.get(0)?,
                    backup_at: row.get(1)?,
                    filename: row.get(2)?,
                    size_bytes: row.get(3)?,
                    success: row.get(4)?,
                    error_message: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
