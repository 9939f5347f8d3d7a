//! Read endpoints: events, locations, types and per-location statistics

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;
use validator::{Validate, ValidationError};

use super::{run_blocking, ApiError};
use crate::event_db::{EventFilter, Pagination, SortOrder};
use crate::metrics;
use crate::shared_state::AppState;

lazy_static! {
    static ref DATE_PREFIX: Regex =
        Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").expect("valid date prefix pattern");
}

fn validate_day(value: &str) -> Result<(), ValidationError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| ValidationError::new("expected YYYY-MM-DD"))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct EventsQuery {
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[validate(regex = "DATE_PREFIX")]
    pub date: Option<String>,
    #[serde(rename = "from")]
    #[validate(custom = "validate_day")]
    pub from_date: Option<String>,
    #[serde(rename = "to")]
    #[validate(custom = "validate_day")]
    pub to_date: Option<String>,
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: Option<String>,
}

impl EventsQuery {
    fn into_parts(self) -> (EventFilter, Pagination, SortOrder) {
        let sort = SortOrder::parse_lenient(self.sort.as_deref());
        let pagination = Pagination::new(self.limit, self.offset);
        let filter = EventFilter {
            location: self.location,
            event_type: self.event_type,
            date: self.date,
            from_date: self.from_date,
            to_date: self.to_date,
        };
        (filter, pagination, sort)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub location: Option<String>,
}

fn checked_query(
    route: &str,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<EventsQuery, ApiError> {
    let Query(query) = query.map_err(|rejection| {
        metrics::inc_request(route, "bad_request");
        ApiError::bad_request(rejection.body_text())
    })?;
    if let Err(errors) = query.validate() {
        metrics::inc_request(route, "bad_request");
        return Err(ApiError::bad_request(format!("Invalid query parameters: {}", errors)));
    }
    Ok(query)
}

/// `GET /api/events`: one page of events plus paging metadata.
pub async fn list_events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let (filter, pagination, sort) = checked_query("events", query)?.into_parts();
    debug!("Listing events: {:?} {:?} {:?}", filter, pagination, sort);

    let store = state.store.clone();
    let page = run_blocking(move || store.list_events(&filter, pagination, sort)).await?;
    metrics::inc_request("events", "ok");
    Ok((StatusCode::OK, Json(page)))
}

/// `GET /api/events/raw`: the bare event array, in the upstream format.
pub async fn list_events_raw(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let (filter, pagination, sort) = checked_query("events_raw", query)?.into_parts();

    let store = state.store.clone();
    let events = run_blocking(move || store.query_events(&filter, pagination, sort)).await?;
    metrics::inc_request("events_raw", "ok");
    Ok((StatusCode::OK, Json(events)))
}

pub async fn list_locations(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let locations = run_blocking(move || store.list_locations()).await?;
    metrics::inc_request("locations", "ok");
    Ok((StatusCode::OK, Json(locations)))
}

pub async fn list_types(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let types = run_blocking(move || store.list_types()).await?;
    metrics::inc_request("types", "ok");
    Ok((StatusCode::OK, Json(types)))
}

/// `GET /api/stats?location=`: totals by type and month.
pub async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let stats = run_blocking(move || store.compute_stats(query.location.as_deref())).await?;
    metrics::inc_request("stats", "ok");
    Ok((StatusCode::OK, Json(stats)))
}
