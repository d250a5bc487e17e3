//! On-behalf-of middleware - the per-request token pipeline.
//!
//! Per request: extract bearer token, validate it, look up the delegated
//! token in the cache, exchange on miss, and hand the proxy layer an explicit
//! [`ForwardingDirective`] describing the headers to rewrite. The directive
//! is a typed value rather than in-place request mutation so the contract can
//! be tested in isolation.
//!
//! Concurrent misses for the same (user, scope) may each perform an exchange;
//! both results are valid and the cache keeps whichever write lands last.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use telemetry_metrics::counter;
use tracing::{debug, error, info, warn};

use super::exchange::ExchangeToken;
use super::store::{OboTokenStore, obo_token_key, ttl_with_clock_skew};
use super::validator::ValidateToken;
use crate::config::OboProvider;
use crate::gateway::trace::{CALL_ID_HEADER, CONSUMER_ID_HEADER};
use crate::Error;

/// Header the upstream session proxy forwards the user's ID token in.
/// Always cleared before dispatch; the delegated token fully replaces it.
pub const IDENTITY_TOKEN_HEADER: &str = "x-identity-token";

/// Per-route OBO pipeline state, built once at router construction.
pub struct OboContext {
    /// Inbound token verification seam
    pub validator: Arc<dyn ValidateToken>,
    /// Exchange seam
    pub exchanger: Arc<dyn ExchangeToken>,
    /// Delegated token cache
    pub store: Arc<dyn OboTokenStore>,
    /// Exchange scope, fixed per route. `None` means pass through without
    /// exchange and strip identity headers.
    pub scope: Option<String>,
    /// Provider family, for logs and metrics
    pub provider: OboProvider,
}

/// Outcome of the token pipeline: the auth headers to set on the forwarded
/// request. An empty string clears the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingDirective {
    /// Value for the `Authorization` header
    pub authorization: String,
    /// Value for the identity-token header
    pub identity_token: String,
}

impl ForwardingDirective {
    /// Pass the request through with both auth headers stripped.
    #[must_use]
    pub fn pass_through() -> Self {
        Self {
            authorization: String::new(),
            identity_token: String::new(),
        }
    }

    /// Forward with the delegated token; the identity token is never
    /// forwarded downstream.
    #[must_use]
    pub fn delegated(obo_token: &str) -> Self {
        Self {
            authorization: format!("Bearer {obo_token}"),
            identity_token: String::new(),
        }
    }

    /// Apply the directive to a request header map.
    pub fn apply(&self, headers: &mut HeaderMap) {
        let authorization = HeaderValue::from_str(&self.authorization)
            .unwrap_or_else(|_| HeaderValue::from_static(""));
        let identity = HeaderValue::from_str(&self.identity_token)
            .unwrap_or_else(|_| HeaderValue::from_static(""));
        headers.insert(header::AUTHORIZATION, authorization);
        headers.insert(IDENTITY_TOKEN_HEADER, identity);
    }
}

/// Why the pipeline refused to forward a request.
#[derive(Debug, thiserror::Error)]
pub enum OboError {
    /// Missing, malformed, or invalid credential. Terminates with 401.
    #[error("Unauthorized")]
    Unauthorized,

    /// The on-behalf-of exchange failed. Propagates to the top-level error
    /// handler, which responds 500.
    #[error(transparent)]
    Exchange(#[from] Error),
}

/// Correlation fields attached to every pipeline log entry.
#[derive(Debug, Default, Clone)]
pub struct RequestIds {
    /// Correlation id, generated when the caller sent none
    pub call_id: String,
    /// Calling application, when it identified itself
    pub consumer_id: Option<String>,
}

impl RequestIds {
    /// Extract correlation fields from request headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        Self {
            call_id: get(CALL_ID_HEADER).unwrap_or_default(),
            consumer_id: get(CONSUMER_ID_HEADER),
        }
    }

    fn consumer(&self) -> &str {
        self.consumer_id.as_deref().unwrap_or("unknown")
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
/// Any other shape is treated as "token absent".
#[must_use]
pub fn bearer_token(header_value: Option<&str>) -> Option<&str> {
    let value = header_value?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

/// Run the token pipeline for one request and produce the forwarding
/// directive.
///
/// # Errors
///
/// [`OboError::Unauthorized`] for missing or invalid credentials,
/// [`OboError::Exchange`] when the identity provider rejects or is
/// unreachable during the exchange.
pub async fn resolve_forwarding(
    ctx: &OboContext,
    authorization: Option<&str>,
    ids: &RequestIds,
) -> Result<ForwardingDirective, OboError> {
    let Some(access_token) = bearer_token(authorization) else {
        warn!(
            call_id = %ids.call_id,
            consumer_id = %ids.consumer(),
            "Access token is missing from proxy request"
        );
        return Err(OboError::Unauthorized);
    };

    if !ctx.validator.is_valid(Some(access_token)).await {
        error!(
            call_id = %ids.call_id,
            consumer_id = %ids.consumer(),
            "Access token is not valid"
        );
        return Err(OboError::Unauthorized);
    }

    // Route is not configured with token exchange
    let Some(scope) = ctx.scope.as_deref() else {
        debug!(
            call_id = %ids.call_id,
            consumer_id = %ids.consumer(),
            "Route has no target app, passing through with stripped auth headers"
        );
        return Ok(ForwardingDirective::pass_through());
    };

    let key = obo_token_key(access_token, scope);

    if let Some(cached) = ctx.store.get(&key).await {
        counter!("obo_cache_hits_total", "backend" => ctx.store.backend_kind()).increment(1);
        debug!(
            scope = %scope,
            call_id = %ids.call_id,
            consumer_id = %ids.consumer(),
            "Using cached on-behalf-of token"
        );
        return Ok(ForwardingDirective::delegated(&cached));
    }
    counter!("obo_cache_misses_total", "backend" => ctx.store.backend_kind()).increment(1);

    let started = Instant::now();
    let obo_token = ctx.exchanger.exchange(access_token, scope).await?;

    info!(
        scope = %scope,
        issuer = %ctx.provider,
        time_taken_ms = started.elapsed().as_millis() as u64,
        call_id = %ids.call_id,
        consumer_id = %ids.consumer(),
        "On-behalf-of token created"
    );

    let ttl = ttl_with_clock_skew(obo_token.expires_in_seconds);
    ctx.store.set(&key, ttl, &obo_token.access_token).await;

    Ok(ForwardingDirective::delegated(&obo_token.access_token))
}

/// Axum middleware wrapping [`resolve_forwarding`] for one route.
///
/// On success the directive is applied to the request headers and control
/// passes to the proxy handler. A 401 terminates without mutating headers; an
/// exchange failure becomes a 500 and increments the error counter.
pub async fn obo_middleware(
    State(ctx): State<Arc<OboContext>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ids = RequestIds::from_headers(request.headers());
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    match resolve_forwarding(&ctx, authorization.as_deref(), &ids).await {
        Ok(directive) => {
            directive.apply(request.headers_mut());
            next.run(request).await
        }
        Err(OboError::Unauthorized) => StatusCode::UNAUTHORIZED.into_response(),
        Err(OboError::Exchange(e)) => {
            let kind = e.classify();
            error!(
                call_id = %ids.call_id,
                consumer_id = %ids.consumer(),
                error_type = kind,
                error = %e,
                "On-behalf-of token exchange failed"
            );
            counter!(
                "obo_exchange_errors_total",
                "type" => kind,
                "consumer" => ids.consumer().to_string()
            )
            .increment(1);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::exchange::OboToken;
    use crate::auth::store::InMemoryTokenStore;

    // ── Test doubles ───────────────────────────────────────────────────

    struct StubValidator {
        valid: bool,
        calls: AtomicUsize,
    }

    impl StubValidator {
        fn new(valid: bool) -> Arc<Self> {
            Arc::new(Self {
                valid,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ValidateToken for StubValidator {
        async fn is_valid(&self, _token: Option<&str>) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.valid
        }
    }

    struct StubExchanger {
        token: String,
        expires_in_seconds: u64,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubExchanger {
        fn succeeding(token: &str, expires_in_seconds: u64) -> Arc<Self> {
            Arc::new(Self {
                token: token.to_string(),
                expires_in_seconds,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                token: String::new(),
                expires_in_seconds: 0,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExchangeToken for StubExchanger {
        async fn exchange(&self, _access_token: &str, _scope: &str) -> crate::Result<OboToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Exchange {
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(OboToken {
                access_token: self.token.clone(),
                expires_in_seconds: self.expires_in_seconds,
            })
        }
    }

    /// Records every `set` so tests can assert keys and TTLs.
    struct RecordingStore {
        inner: InMemoryTokenStore,
        sets: Mutex<Vec<(String, u64, String)>>,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryTokenStore::new(),
                sets: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OboTokenStore for RecordingStore {
        async fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, ttl_seconds: u64, token: &str) {
            self.sets
                .lock()
                .unwrap()
                .push((key.to_string(), ttl_seconds, token.to_string()));
            self.inner.set(key, ttl_seconds, token).await;
        }

        async fn delete(&self, key: &str) {
            self.inner.delete(key).await;
        }

        async fn close(&self) {}

        fn backend_kind(&self) -> &'static str {
            "in-process"
        }
    }

    /// Simulates a remote backend whose reads and writes always fail
    /// internally; per the store contract those surface as miss/no-op.
    struct ErroringStore;

    #[async_trait]
    impl OboTokenStore for ErroringStore {
        async fn get(&self, _key: &str) -> Option<String> {
            None
        }
        async fn set(&self, _key: &str, _ttl_seconds: u64, _token: &str) {}
        async fn delete(&self, _key: &str) {}
        async fn close(&self) {}
        fn backend_kind(&self) -> &'static str {
            "valkey"
        }
    }

    fn ctx(
        validator: Arc<StubValidator>,
        exchanger: Arc<StubExchanger>,
        store: Arc<dyn OboTokenStore>,
        scope: Option<&str>,
    ) -> OboContext {
        OboContext {
            validator,
            exchanger,
            store,
            scope: scope.map(ToString::to_string),
            provider: OboProvider::AzureAd,
        }
    }

    fn ids() -> RequestIds {
        RequestIds {
            call_id: "call-1".to_string(),
            consumer_id: Some("consumer-app".to_string()),
        }
    }

    // ── Bearer extraction ──────────────────────────────────────────────

    #[test]
    fn bearer_token_requires_the_bearer_scheme() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("BEARER abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("token-without-scheme")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }

    // ── Credential handling ────────────────────────────────────────────

    #[tokio::test]
    async fn missing_header_is_unauthorized_without_invoking_the_validator() {
        let validator = StubValidator::new(true);
        let exchanger = StubExchanger::succeeding("obo", 3600);
        let ctx = ctx(
            Arc::clone(&validator),
            exchanger,
            RecordingStore::new(),
            Some("some-scope"),
        );

        let result = resolve_forwarding(&ctx, None, &ids()).await;

        assert!(matches!(result, Err(OboError::Unauthorized)));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_header_is_unauthorized_without_invoking_the_validator() {
        let validator = StubValidator::new(true);
        let exchanger = StubExchanger::succeeding("obo", 3600);
        let ctx = ctx(
            Arc::clone(&validator),
            exchanger,
            RecordingStore::new(),
            Some("some-scope"),
        );

        let result =
            resolve_forwarding(&ctx, Some("invalid-token-without-bearer"), &ids()).await;

        assert!(matches!(result, Err(OboError::Unauthorized)));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_token_is_unauthorized() {
        let validator = StubValidator::new(false);
        let exchanger = StubExchanger::succeeding("obo", 3600);
        let ctx = ctx(
            Arc::clone(&validator),
            Arc::clone(&exchanger),
            RecordingStore::new(),
            Some("some-scope"),
        );

        let result = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids()).await;

        assert!(matches!(result, Err(OboError::Unauthorized)));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    // ── Scope handling ─────────────────────────────────────────────────

    #[tokio::test]
    async fn routes_without_a_scope_pass_through_with_stripped_headers() {
        let exchanger = StubExchanger::succeeding("obo", 3600);
        let ctx = ctx(
            StubValidator::new(true),
            Arc::clone(&exchanger),
            RecordingStore::new(),
            None,
        );

        let directive = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(directive, ForwardingDirective::pass_through());
        assert_eq!(directive.authorization, "");
        assert_eq!(directive.identity_token, "");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    // ── Cache behavior ─────────────────────────────────────────────────

    #[tokio::test]
    async fn cache_hit_skips_the_exchange() {
        let store = RecordingStore::new();
        let key = obo_token_key("user-token", "some-scope");
        store.set(&key, 60, "cached-obo-token").await;

        let exchanger = StubExchanger::succeeding("fresh", 3600);
        let ctx = ctx(
            StubValidator::new(true),
            Arc::clone(&exchanger),
            store,
            Some("some-scope"),
        );

        let directive = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(directive.authorization, "Bearer cached-obo-token");
        assert_eq!(directive.identity_token, "");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_miss_exchanges_once_and_stores_with_clock_skew() {
        let store = RecordingStore::new();
        let exchanger = StubExchanger::succeeding("new-obo-token", 3600);
        let ctx = ctx(
            StubValidator::new(true),
            Arc::clone(&exchanger),
            Arc::clone(&store) as Arc<dyn OboTokenStore>,
            Some("some-scope"),
        );

        let directive = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(directive.authorization, "Bearer new-obo-token");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);

        let sets = store.sets.lock().unwrap();
        assert_eq!(sets.len(), 1);
        let (key, ttl, token) = &sets[0];
        assert_eq!(*key, obo_token_key("user-token", "some-scope"));
        assert_eq!(*ttl, 3570);
        assert_eq!(token, "new-obo-token");
    }

    #[tokio::test]
    async fn replaying_within_the_ttl_never_exchanges_twice() {
        let store = RecordingStore::new();
        let exchanger = StubExchanger::succeeding("new-obo-token", 3600);
        let ctx = ctx(
            StubValidator::new(true),
            Arc::clone(&exchanger),
            store,
            Some("some-scope"),
        );

        let first = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();
        let second = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_lived_tokens_are_stored_with_the_floor_ttl() {
        let store = RecordingStore::new();
        let exchanger = StubExchanger::succeeding("new-obo-token", 10);
        let ctx = ctx(
            StubValidator::new(true),
            exchanger,
            Arc::clone(&store) as Arc<dyn OboTokenStore>,
            Some("some-scope"),
        );

        resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(store.sets.lock().unwrap()[0].1, 1);
    }

    #[tokio::test]
    async fn failing_store_reads_behave_like_a_miss() {
        let exchanger = StubExchanger::succeeding("new-obo-token", 3600);
        let ctx = ctx(
            StubValidator::new(true),
            Arc::clone(&exchanger),
            Arc::new(ErroringStore),
            Some("some-scope"),
        );

        let directive = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids())
            .await
            .unwrap();

        assert_eq!(directive.authorization, "Bearer new-obo-token");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    // ── Exchange failure ───────────────────────────────────────────────

    #[tokio::test]
    async fn exchange_failure_propagates_and_stores_nothing() {
        let store = RecordingStore::new();
        let exchanger = StubExchanger::failing();
        let ctx = ctx(
            StubValidator::new(true),
            exchanger,
            Arc::clone(&store) as Arc<dyn OboTokenStore>,
            Some("some-scope"),
        );

        let result = resolve_forwarding(&ctx, Some("Bearer user-token"), &ids()).await;

        assert!(matches!(result, Err(OboError::Exchange(_))));
        assert!(store.sets.lock().unwrap().is_empty());
    }

    // ── Directive application ──────────────────────────────────────────

    #[test]
    fn delegated_directive_overwrites_auth_and_clears_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer user-token"),
        );
        headers.insert(IDENTITY_TOKEN_HEADER, HeaderValue::from_static("id-token"));

        ForwardingDirective::delegated("obo-token").apply(&mut headers);

        assert_eq!(headers[header::AUTHORIZATION], "Bearer obo-token");
        assert_eq!(headers[IDENTITY_TOKEN_HEADER], "");
    }

    #[test]
    fn pass_through_directive_clears_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer user-token"),
        );

        ForwardingDirective::pass_through().apply(&mut headers);

        assert_eq!(headers[header::AUTHORIZATION], "");
        assert_eq!(headers[IDENTITY_TOKEN_HEADER], "");
    }
}
