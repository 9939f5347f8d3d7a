//! Event writes and read queries
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::value::RawValue;
use tracing::debug;

use super::schema::*;
use super::EventStore;
use crate::error::Result;

/// Insert `event` unless a row with the same id already exists.
///
/// Returns `true` when a new row was written. A duplicate id is never an
/// error and never changes the stored row.
pub fn insert_if_absent(conn: &Connection, event: &NewEvent, fetched_at: &str) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO events
         (id, datetime, name, summary, url, type, location_name, location_gps, raw_data, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id,
            event.datetime,
            event.name,
            event.summary,
            event.url,
            event.event_type,
            event.location_name,
            event.location_gps,
            event.raw_data.get(),
            fetched_at,
        ],
    )?;
    Ok(changed > 0)
}

/// Escape `%`, `_` and `\` so user input is matched literally by `LIKE ... ESCAPE '\'`.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn push_filters(filter: &EventFilter, with_date_prefix: bool, sql: &mut String, values: &mut Vec<Value>) {
    if let Some(location) = filter.location.as_deref() {
        sql.push_str(" AND location_name = ?");
        values.push(Value::Text(location.to_string()));
    }
    if let Some(event_type) = filter.event_type.as_deref() {
        sql.push_str(" AND type = ?");
        values.push(Value::Text(event_type.to_string()));
    }
    if with_date_prefix {
        if let Some(date) = filter.date.as_deref() {
            sql.push_str(" AND datetime LIKE ? ESCAPE '\\'");
            values.push(Value::Text(format!("{}%", escape_like(date))));
        }
    }
    if let Some(from_date) = filter.from_date.as_deref() {
        sql.push_str(" AND datetime >= ?");
        values.push(Value::Text(from_date.to_string()));
    }
    if let Some(to_date) = filter.to_date.as_deref() {
        sql.push_str(" AND datetime <= ?");
        values.push(Value::Text(format!("{}T23:59:59", to_date)));
    }
}

impl EventStore {
    /// Convenience wrapper around [`insert_if_absent`] on a pooled connection.
    pub fn insert_if_absent(&self, event: &NewEvent) -> Result<bool> {
        let conn = self.conn()?;
        insert_if_absent(&conn, event, &super::now_timestamp())
    }

    /// Events matching `filter`, in the upstream wire shape.
    pub fn query_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: SortOrder,
    ) -> Result<Vec<Box<RawValue>>> {
        let mut sql = String::from("SELECT raw_data FROM events WHERE 1=1");
        let mut values = Vec::new();
        push_filters(filter, true, &mut sql, &mut values);
        sql.push_str(&format!(" ORDER BY datetime {}, id {}", sort.as_sql(), sort.as_sql()));
        sql.push_str(" LIMIT ? OFFSET ?");
        values.push(Value::Integer(i64::from(pagination.limit)));
        values.push(Value::Integer(i64::from(pagination.offset)));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw_rows = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut events = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            events.push(RawValue::from_string(raw)?);
        }
        debug!("Query returned {} events", events.len());
        Ok(events)
    }

    /// Number of events matching `filter`. The `date` prefix is not applied.
    pub fn count_events(&self, filter: &EventFilter) -> Result<i64> {
        let mut sql = String::from("SELECT COUNT(*) FROM events WHERE 1=1");
        let mut values = Vec::new();
        push_filters(filter, false, &mut sql, &mut values);

        let conn = self.conn()?;
        let count = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count)
    }

    /// One page of events plus the metadata the events endpoint returns.
    pub fn list_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: SortOrder,
    ) -> Result<EventPage> {
        let events = self.query_events(filter, pagination, sort)?;
        let total = self.count_events(filter)?;
        let has_more = i64::from(pagination.offset) + (events.len() as i64) < total;
        Ok(EventPage {
            events,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more,
        })
    }

    pub fn list_locations(&self) -> Result<Vec<LocationCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT location_name, COUNT(*) AS count
             FROM events
             GROUP BY location_name
             ORDER BY count DESC, location_name ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LocationCount {
                    name: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_types(&self) -> Result<Vec<TypeCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT type, COUNT(*) AS count
             FROM events
             GROUP BY type
             ORDER BY count DESC, type ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TypeCount {
                    event_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Totals, per-type and per-month counts, and the datetime span,
    /// optionally restricted to a single location.
    pub fn compute_stats(&self, location: Option<&str>) -> Result<EventStats> {
        let conn = self.conn()?;
        let (where_clause, values) = match location {
            Some(location) => ("WHERE location_name = ?1", vec![Value::Text(location.to_string())]),
            None => ("", Vec::new()),
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM events {}", where_clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT type, COUNT(*) AS count FROM events {}
             GROUP BY type ORDER BY count DESC, type ASC",
            where_clause
        ))?;
        let by_type = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(TypeCount {
                    event_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // strftime resolves the upstream offset, so buckets are UTC months.
        let mut stmt = conn.prepare(&format!(
            "SELECT strftime('%Y-%m', datetime) AS month, COUNT(*) AS count FROM events {}
             GROUP BY month HAVING month IS NOT NULL ORDER BY month DESC",
            where_clause
        ))?;
        let by_month = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(MonthCount {
                    month: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let date_range = conn
            .query_row(
                &format!("SELECT MIN(datetime), MAX(datetime) FROM events {}", where_clause),
                params_from_iter(values.iter()),
                |row| {
                    Ok(DateRange {
                        oldest: row.get(0)?,
                        latest: row.get(1)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default();

        Ok(EventStats {
            total,
            by_type,
            by_month,
            date_range,
        })
    }
}
