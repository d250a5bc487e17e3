//! Proxy dispatcher - forwards rewritten requests to the configured
//! downstream target.
//!
//! Path handling follows the route's `preserve_from_path` flag: when true the
//! matched from-path stays on the forwarded path, when false the prefix is
//! stripped so the downstream sees a path relative to its own root. The query
//! string is always preserved. A fixed consumer-identifier header names this
//! gateway on every forwarded request.
//!
//! Transport failures are logged with a PII-masked path and mapped to 502;
//! there is no retry.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use super::trace::{CALL_ID_HEADER, CONSUMER_ID_HEADER, mask_national_ids};

/// Consumer id this gateway announces to downstream services.
pub const GATEWAY_CONSUMER_ID: &str = "spa-gateway";

/// Per-route forwarding state, built once at router construction.
pub struct RouteContext {
    /// Full inbound prefix (context path + from-path) this route is mounted on
    pub mounted_prefix: String,
    /// The route's from-path, relative to the context path
    pub from_path: String,
    /// Downstream base URL
    pub to_url: String,
    /// Keep the from-path on the forwarded request path
    pub preserve_from_path: bool,
    /// Outbound HTTP client
    pub http: reqwest::Client,
}

impl RouteContext {
    /// Compute the downstream URL for an inbound request path and query.
    #[must_use]
    pub fn forward_url(&self, path: &str, query: Option<&str>) -> String {
        let rest = path.strip_prefix(self.mounted_prefix.as_str()).unwrap_or("");
        let base = self.to_url.trim_end_matches('/');

        let mut url = if self.preserve_from_path {
            format!("{base}{}{rest}", self.from_path)
        } else {
            format!("{base}{rest}")
        };
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Headers that must not travel across the proxy hop.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out.insert(
        CONSUMER_ID_HEADER,
        header::HeaderValue::from_static(GATEWAY_CONSUMER_ID),
    );
    out
}

/// Forward the (already re-headered) request downstream and relay the
/// response.
pub async fn dispatch(
    State(ctx): State<Arc<RouteContext>>,
    request: Request<Body>,
) -> Response {
    let call_id = request
        .headers()
        .get(CALL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let url = ctx.forward_url(request.uri().path(), request.uri().query());
    let method = request.method().clone();
    let headers = forwardable_headers(request.headers());
    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

    debug!(call_id = %call_id, url = %mask_national_ids(&url), "Forwarding request");

    let result = ctx
        .http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(response) => response,
        Err(e) => {
            error!(
                call_id = %call_id,
                to_url = %ctx.to_url,
                path = %mask_national_ids(&url),
                error = %e,
                "Downstream request failed"
            );
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    *response.headers_mut() = response_headers;
    response
}
