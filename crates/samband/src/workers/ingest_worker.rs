//! Ingestion pipeline
//!
//! One cycle fetches a batch from the configured [`EventSource`], validates
//! each record, inserts the new ones inside a single transaction and writes a
//! fetch-log row describing the attempt. Running a cycle twice against an
//! unchanged source inserts nothing the second time.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::fetch_worker::EventSource;
use crate::error::Result;
use crate::event_db::{
    now_timestamp,
    ops_log::record_fetch_log_at,
    queries::insert_if_absent,
    EventStore, NewEvent,
};
use crate::metrics;

/// Structured outcome of one ingestion cycle, returned verbatim to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchCycleResult {
    pub success: bool,
    pub events_fetched: usize,
    pub events_new: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
}

impl FetchCycleResult {
    fn failed(kind: &str, error: String) -> Self {
        Self {
            success: false,
            events_fetched: 0,
            events_new: 0,
            elapsed_seconds: None,
            error: Some(error),
            failure_kind: Some(kind.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamLocation {
    name: Option<String>,
    gps: Option<String>,
}

/// The fields an upstream record must carry to be stored.
#[derive(Debug, Deserialize)]
struct UpstreamEvent {
    id: Option<i64>,
    datetime: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    summary: Option<String>,
    url: Option<String>,
    location: Option<UpstreamLocation>,
}

/// Turn one upstream record into a [`NewEvent`], or explain what is missing.
pub fn validate_event(raw: &RawValue) -> std::result::Result<NewEvent, String> {
    let parsed: UpstreamEvent =
        serde_json::from_str(raw.get()).map_err(|e| format!("not an event object: {}", e))?;

    let id = parsed.id.ok_or("missing id")?;
    let datetime = parsed.datetime.ok_or("missing datetime")?;
    let name = parsed.name.ok_or("missing name")?;
    let event_type = parsed.event_type.ok_or("missing type")?;
    let location = parsed.location.ok_or("missing location")?;
    let location_name = location.name.ok_or("missing location name")?;

    Ok(NewEvent {
        id,
        datetime,
        name,
        summary: parsed.summary.unwrap_or_default(),
        url: parsed.url.unwrap_or_default(),
        event_type,
        location_name,
        location_gps: location.gps.unwrap_or_default(),
        raw_data: raw.to_owned(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Validate and insert a whole batch, plus its fetch-log row, in one transaction.
pub(crate) fn ingest_batch(store: &EventStore, batch: &[Box<RawValue>]) -> Result<BatchOutcome> {
    let fetched_at = now_timestamp();
    store.with_transaction(|tx| {
        let mut inserted = 0;
        let mut skipped = 0;
        for raw in batch {
            match validate_event(raw) {
                Ok(event) => {
                    if insert_if_absent(tx, &event, &fetched_at)? {
                        inserted += 1;
                    }
                }
                Err(reason) => {
                    skipped += 1;
                    warn!("Skipping event with missing fields ({}): {:.120}", reason, raw.get());
                }
            }
        }
        record_fetch_log_at(tx, Utc::now(), batch.len(), inserted, true, None)?;
        Ok(BatchOutcome {
            fetched: batch.len(),
            inserted,
            skipped,
        })
    })
}

pub struct IngestionPipeline {
    store: Arc<EventStore>,
    source: Arc<dyn EventSource>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<EventStore>, source: Arc<dyn EventSource>) -> Self {
        Self { store, source }
    }

    /// Run one fetch-validate-insert-log pass. Never fails; every problem is
    /// reported through the returned result and the fetch log.
    pub async fn run_fetch_cycle(&self) -> FetchCycleResult {
        let started = Instant::now();

        let batch = match self.source.fetch_batch().await {
            Ok(batch) if batch.is_empty() => {
                return self
                    .record_failure("empty_batch", "no events returned".to_string())
                    .await;
            }
            Ok(batch) => batch,
            Err(failure) => {
                return self.record_failure(failure.kind(), failure.to_string()).await;
            }
        };

        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || ingest_batch(&store, &batch)).await;

        match outcome {
            Ok(Ok(outcome)) => {
                let elapsed = started.elapsed().as_secs_f64();
                metrics::inc_fetch_cycle("ok");
                metrics::add_events_ingested(outcome.inserted as u64);
                metrics::add_events_skipped(outcome.skipped as u64);
                info!(
                    "Stored {} new events out of {} in {:.2}s ({} skipped)",
                    outcome.inserted, outcome.fetched, elapsed, outcome.skipped
                );
                FetchCycleResult {
                    success: true,
                    events_fetched: outcome.fetched,
                    events_new: outcome.inserted,
                    elapsed_seconds: Some(elapsed),
                    error: None,
                    failure_kind: None,
                }
            }
            Ok(Err(e)) => {
                error!("Storing fetched events failed: {}", e);
                self.record_failure("store", format!("store error: {}", e)).await
            }
            Err(e) => {
                error!("Ingestion task failed: {}", e);
                self.record_failure("store", format!("ingestion task failed: {}", e))
                    .await
            }
        }
    }

    /// A failed cycle stores nothing, so it reports and logs zero fetched events.
    async fn record_failure(&self, kind: &str, reason: String) -> FetchCycleResult {
        warn!("Fetch cycle failed ({}): {}", kind, reason);
        metrics::inc_fetch_cycle(kind);

        let store = Arc::clone(&self.store);
        let message = reason.clone();
        let logged = tokio::task::spawn_blocking(move || {
            store.record_fetch_log(0, 0, false, Some(message.as_str()))
        })
        .await;
        match logged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to record fetch log entry: {}", e),
            Err(e) => error!("Fetch log task failed: {}", e),
        }

        FetchCycleResult::failed(kind, reason)
    }
}
