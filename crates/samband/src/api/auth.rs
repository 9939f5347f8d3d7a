//! `X-API-Key` check for the protected routes

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::ApiError;
use crate::metrics;
use crate::shared_state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Compare keys through their digests so the comparison time does not
/// depend on where the inputs differ.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    blake3::hash(provided.as_bytes()) == blake3::hash(expected.as_bytes())
}

/// Short, non-reversible tag for a key, safe to log.
pub fn key_fingerprint(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex()[..16].to_string()
}

/// Caller address as reported by a fronting proxy, if any.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    UNKNOWN_CLIENT.to_string()
}

pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match provided {
        None => {
            warn!("Missing API key from {}", client_ip(request.headers()));
            metrics::inc_request("auth", "missing_key");
            ApiError::unauthorized("Missing API key. Send it in the X-API-Key header.").into_response()
        }
        Some(key) if keys_match(&key, &state.config.api_key) => {
            debug!("Authorized request to {}", request.uri().path());
            next.run(request).await
        }
        Some(key) => {
            warn!(
                "Invalid API key {} from {}",
                key_fingerprint(&key),
                client_ip(request.headers())
            );
            metrics::inc_request("auth", "invalid_key");
            ApiError::unauthorized("Invalid API key.").into_response()
        }
    }
}
