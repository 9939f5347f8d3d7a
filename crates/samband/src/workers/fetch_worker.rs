//! Remote event fetcher
//!
//! Pulls the current event list from the upstream police API. Every failure
//! is classified into a [`FetchFailure`] instead of being raised, so the
//! ingestion pipeline can log and count each category separately.
use async_trait::async_trait;
use serde_json::value::RawValue;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Browser user agent; the upstream API rejects unknown clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) \
    Chrome/120.0.0.0 Safari/537.36";

/// Why a fetch produced no batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("timeout when fetching events")]
    Timeout,

    #[error("HTTP status {0} from events API")]
    HttpStatus(u16),

    #[error("unexpected response format: {0}")]
    MalformedPayload(String),

    #[error("transport error: {0}")]
    TransportError(String),
}

impl FetchFailure {
    /// Stable label for metrics and structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchFailure::Timeout => "timeout",
            FetchFailure::HttpStatus(_) => "http_status",
            FetchFailure::MalformedPayload(_) => "malformed_payload",
            FetchFailure::TransportError(_) => "transport",
        }
    }
}

/// A source of raw upstream event objects.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// One batch of events, each kept as the exact JSON bytes received.
    async fn fetch_batch(&self) -> Result<Vec<Box<RawValue>>, FetchFailure>;
}

pub struct RemoteFetcher {
    url: String,
    http_client: reqwest::Client,
}

impl RemoteFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        info!("Remote fetcher initialized for: {} (timeout {:?})", url, timeout);
        Self {
            url,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(err: reqwest::Error) -> FetchFailure {
        if err.is_timeout() {
            FetchFailure::Timeout
        } else if let Some(status) = err.status() {
            FetchFailure::HttpStatus(status.as_u16())
        } else {
            FetchFailure::TransportError(err.to_string())
        }
    }

    async fn try_fetch(&self) -> Result<Vec<Box<RawValue>>, FetchFailure> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await.map_err(Self::classify)?;
        parse_batch(&body)
    }
}

/// Split a response body into its array elements without re-encoding them.
pub fn parse_batch(body: &[u8]) -> Result<Vec<Box<RawValue>>, FetchFailure> {
    serde_json::from_slice::<Vec<Box<RawValue>>>(body).map_err(|e| {
        let shape = match serde_json::from_slice::<serde_json::Value>(body) {
            // An array whose elements failed to split is still unusable.
            Ok(value) => json_kind(&value).to_string(),
            Err(_) => format!("invalid JSON ({})", e),
        };
        FetchFailure::MalformedPayload(format!("expected a JSON array, got {}", shape))
    })
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[async_trait]
impl EventSource for RemoteFetcher {
    async fn fetch_batch(&self) -> Result<Vec<Box<RawValue>>, FetchFailure> {
        match self.try_fetch().await {
            Ok(events) => {
                info!("Fetched {} events from {}", events.len(), self.url);
                Ok(events)
            }
            Err(failure) => {
                error!("Fetching events from {} failed: {}", self.url, failure);
                Err(failure)
            }
        }
    }
}
