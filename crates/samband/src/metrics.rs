use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static FETCH_CYCLES: OnceLock<IntCounterVec> = OnceLock::new();
static EVENTS_INGESTED: OnceLock<IntCounter> = OnceLock::new();
static EVENTS_SKIPPED: OnceLock<IntCounter> = OnceLock::new();
static BACKUPS: OnceLock<IntCounterVec> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("static metric definition")
    });

    let fetch_cycles = FETCH_CYCLES.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("fetch_cycles_total", "Ingestion cycles by outcome"),
            &["outcome"],
        )
        .expect("static metric definition")
    });

    let events_ingested = EVENTS_INGESTED.get_or_init(|| {
        IntCounter::new("events_ingested_total", "Events newly written to the store")
            .expect("static metric definition")
    });

    let events_skipped = EVENTS_SKIPPED.get_or_init(|| {
        IntCounter::new("events_skipped_total", "Fetched events rejected by validation")
            .expect("static metric definition")
    });

    let backups = BACKUPS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("backups_total", "Backup attempts by outcome"),
            &["outcome"],
        )
        .expect("static metric definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(fetch_cycles.clone())).ok();
    REGISTRY.register(Box::new(events_ingested.clone())).ok();
    REGISTRY.register(Box::new(events_skipped.clone())).ok();
    REGISTRY.register(Box::new(backups.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_fetch_cycle(outcome: &str) {
    if let Some(counter) = FETCH_CYCLES.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn add_events_ingested(count: u64) {
    if let Some(counter) = EVENTS_INGESTED.get() {
        counter.inc_by(count);
    }
}

pub fn add_events_skipped(count: u64) {
    if let Some(counter) = EVENTS_SKIPPED.get() {
        counter.inc_by(count);
    }
}

pub fn inc_backup(outcome: &str) {
    if let Some(counter) = BACKUPS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
