//! Database schema and row types for the event store
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Hard upper bound on a single page of events.
pub const MAX_LIMIT: u32 = 1000;
/// Page size used when the caller does not ask for one.
pub const DEFAULT_LIMIT: u32 = 500;

/// A fully validated event ready to be written.
///
/// `raw_data` holds the upstream JSON object exactly as it appeared in the
/// response body.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: i64,
    pub datetime: String,
    pub name: String,
    pub summary: String,
    pub url: String,
    pub event_type: String,
    pub location_name: String,
    pub location_gps: String,
    pub raw_data: Box<RawValue>,
}

/// Conjunctive filters for event queries. Every `None` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub location: Option<String>,
    pub event_type: Option<String>,
    /// Left-anchored prefix of `datetime`: `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub date: Option<String>,
    /// Inclusive lower bound compared against `datetime`.
    pub from_date: Option<String>,
    /// Inclusive day, compared as `to_date + "T23:59:59"`.
    pub to_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

impl SortOrder {
    /// Anything other than `asc` (any case) sorts newest first.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.trim().eq_ignore_ascii_case("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Desc => "DESC",
            SortOrder::Asc => "ASC",
        }
    }
}

/// One page of events in the upstream wire shape plus pagination metadata.
#[derive(Debug, Serialize)]
pub struct EventPage {
    pub events: Vec<Box<RawValue>>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub event_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthCount {
    pub month: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub oldest: Option<String>,
    pub latest: Option<String>,
}

/// Aggregates over the events table, optionally scoped to one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub total: i64,
    pub by_type: Vec<TypeCount>,
    /// Most recent month first.
    pub by_month: Vec<MonthCount>,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    pub blocked: bool,
    pub pages_written: i64,
    pub pages_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub errors: Option<Vec<String>>,
}

impl IntegrityReport {
    pub(crate) fn from_rows(rows: Vec<String>) -> Self {
        let errors: Vec<String> = rows.into_iter().filter(|row| row != "ok").collect();
        Self {
            ok: errors.is_empty(),
            errors: if errors.is_empty() { None } else { Some(errors) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLogEntry {
    pub id: i64,
    pub fetched_at: String,
    pub events_fetched: i64,
    pub events_new: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupLogEntry {
    pub id: i64,
    pub backup_at: String,
    pub filename: String,
    pub size_bytes: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventDateRange {
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastFetch {
    pub at: Option<String>,
    pub new_events: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastBackup {
    pub at: Option<String>,
    pub filename: Option<String>,
    pub size_bytes: Option<i64>,
    pub size_mb: Option<f64>,
}

/// Health snapshot of the whole store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub total_events: i64,
    pub unique_locations: i64,
    pub date_range: EventDateRange,
    pub database_size_bytes: u64,
    pub database_size_mb: f64,
    pub last_fetch: LastFetch,
    pub last_backup: LastBackup,
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

pub const SCHEMA_SQL: &str = "
-- Events are written once and never updated or deleted
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    datetime TEXT NOT NULL,
    name TEXT NOT NULL,
    summary TEXT,
    url TEXT,
    type TEXT NOT NULL,
    location_name TEXT NOT NULL,
    location_gps TEXT,
    raw_data TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_events_datetime ON events (datetime DESC);
CREATE INDEX IF NOT EXISTS idx_events_location ON events (location_name);
CREATE INDEX IF NOT EXISTS idx_events_type ON events (type);
CREATE INDEX IF NOT EXISTS idx_events_location_datetime ON events (location_name, datetime DESC);
CREATE INDEX IF NOT EXISTS idx_events_type_datetime ON events (type, datetime DESC);
-- One row per ingestion attempt
CREATE TABLE IF NOT EXISTS fetch_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fetched_at TEXT NOT NULL,
    events_fetched INTEGER NOT NULL,
    events_new INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_fetch_log_fetched_at ON fetch_log (fetched_at);
-- One row per backup attempt
CREATE TABLE IF NOT EXISTS backup_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_at TEXT NOT NULL,
    filename TEXT NOT NULL,
    size_bytes INTEGER,
    success INTEGER NOT NULL,
    error_message TEXT
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_limit() {
        assert_eq!(Pagination::new(None, None), Pagination { limit: 500, offset: 0 });
        assert_eq!(Pagination::new(Some(0), Some(3)).limit, 1);
        assert_eq!(Pagination::new(Some(5000), None).limit, MAX_LIMIT);
    }

    #[test]
    fn sort_order_defaults_to_desc() {
        assert_eq!(SortOrder::parse_lenient(None), SortOrder::Desc);
        assert_eq!(SortOrder::parse_lenient(Some("ASC")), SortOrder::Asc);
        assert_eq!(SortOrder::parse_lenient(Some("sideways")), SortOrder::Desc);
    }

    #[test]
    fn integrity_report_keeps_only_problems() {
        let ok = IntegrityReport::from_rows(vec!["ok".into()]);
        assert!(ok.ok);
        assert_eq!(ok.errors, None);

        let bad = IntegrityReport::from_rows(vec!["row 4 missing from index".into()]);
        assert!(!bad.ok);
        assert_eq!(bad.errors.unwrap().len(), 1);
    }

    #[test]
    fn megabytes_round_to_two_decimals() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(1024 * 1024), 1.0);
        assert_eq!(bytes_to_mb(1_500_000), 1.43);
    }
}
