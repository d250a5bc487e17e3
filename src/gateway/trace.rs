//! Request correlation and log scrubbing.
//!
//! Every request carries a call id (generated when the caller sent none) and,
//! when the caller identifies itself, a consumer id. Both are attached to the
//! pipeline's structured log entries.

use std::sync::OnceLock;

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use regex::Regex;
use tracing::warn;
use uuid::Uuid;

/// Correlation id header. Generated per request when absent.
pub const CALL_ID_HEADER: &str = "x-call-id";

/// Header identifying the calling application.
pub const CONSUMER_ID_HEADER: &str = "x-consumer-id";

/// Ensure every request carries a call id before any other processing.
pub async fn call_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    if !request.headers().contains_key(CALL_ID_HEADER) {
        let call_id = Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&call_id) {
            request.headers_mut().insert(CALL_ID_HEADER, value);
        }
    }
    next.run(request).await
}

/// Warn about callers that do not identify themselves. The request proceeds.
pub async fn consumer_id_warning_middleware(request: Request<Body>, next: Next) -> Response {
    if !request.headers().contains_key(CONSUMER_ID_HEADER) {
        let call_id = request
            .headers()
            .get(CALL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        warn!(
            call_id = %call_id,
            path = %mask_national_ids(request.uri().path()),
            "Request missing consumer id"
        );
    }
    next.run(request).await
}

/// Mask digit sequences resembling national identity numbers before a value
/// reaches a log entry.
#[must_use]
pub fn mask_national_ids(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\d{11}").unwrap());
    pattern.replace_all(text, "[masked]").into_owned()
}
