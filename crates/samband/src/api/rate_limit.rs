//! Per-client request limits for the protected routes
//!
//! Each limiter keeps a sliding window of request instants per
//! `(client, route)` key, so one caller exhausting a budget never blocks
//! another caller or another route.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use super::{auth, ApiError};
use crate::metrics;

/// Idle keys are swept once the table grows past this many entries.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug)]
pub struct ClientRateLimiter {
    max_requests: usize,
    window: Duration,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl ClientRateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_requests: max_requests.max(1) as usize,
            window,
            hits: DashMap::new(),
        })
    }

    pub fn per_minute(max_requests: u64) -> Arc<Self> {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u64) -> Arc<Self> {
        Self::new(max_requests, Duration::from_secs(60 * 60))
    }

    /// Count one request against `key` if its window has room.
    pub fn acquire(&self, key: &str) -> Decision {
        self.acquire_at(key, Instant::now())
    }

    fn acquire_at(&self, key: &str, now: Instant) -> Decision {
        if self.hits.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut window = self.hits.entry(key.to_string()).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return Decision::Limited { retry_after };
        }
        window.push_back(now);
        Decision::Allowed
    }

    fn sweep(&self, now: Instant) {
        self.hits.retain(|_, window| {
            window
                .back()
                .is_some_and(|&latest| now.duration_since(latest) < self.window)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}

/// Proxy headers first, then the peer address of the connection.
pub fn client_key(request: &Request) -> String {
    let from_headers = auth::client_ip(request.headers());
    if from_headers != auth::UNKNOWN_CLIENT {
        return from_headers;
    }
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => from_headers,
    }
}

pub async fn enforce(
    State(limiter): State<Arc<ClientRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_key(&request);
    let key = format!("{} {}", client, request.uri().path());

    match limiter.acquire(&key) {
        Decision::Allowed => next.run(request).await,
        Decision::Limited { retry_after } => {
            let seconds = retry_after.as_secs().max(1);
            warn!(
                "Rate limit exceeded for {} on {} (retry in {}s)",
                client,
                request.uri().path(),
                seconds
            );
            metrics::inc_request("rate_limit", "rejected");
            let mut response = ApiError::too_many_requests().into_response();
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    #[test]
    fn budget_is_tracked_per_key() {
        let limiter = ClientRateLimiter::per_minute(2);
        let now = Instant::now();
        assert_eq!(limiter.acquire_at("a /fetch", now), Decision::Allowed);
        assert_eq!(limiter.acquire_at("a /fetch", now), Decision::Allowed);
        assert!(matches!(limiter.acquire_at("a /fetch", now), Decision::Limited { .. }));

        assert_eq!(limiter.acquire_at("b /fetch", now), Decision::Allowed);
        assert_eq!(limiter.acquire_at("a /events", now), Decision::Allowed);
    }

    #[test]
    fn window_slides_open_again() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(limiter.acquire_at("a", start), Decision::Allowed);
        match limiter.acquire_at("a", start + Duration::from_secs(4)) {
            Decision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(6)),
            other => panic!("expected limit, got {:?}", other),
        }
        assert_eq!(limiter.acquire_at("a", start + Duration::from_secs(10)), Decision::Allowed);
    }

    #[test]
    fn sweep_drops_idle_keys() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire_at("old", start);
        limiter.acquire_at("fresh", start + Duration::from_secs(8));
        limiter.sweep(start + Duration::from_secs(12));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn client_key_prefers_forwarded_header_over_peer() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();

        let mut request = HttpRequest::builder().uri("/x").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_key(&request), "10.0.0.9");

        let mut forwarded = HttpRequest::builder()
            .uri("/x")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        forwarded.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_key(&forwarded), "203.0.113.7");
    }
}
