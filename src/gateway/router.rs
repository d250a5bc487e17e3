//! HTTP router construction.
//!
//! The route table is turned into an axum router once at startup: one
//! sub-router per configured proxy route, with the OBO middleware layered in
//! front of the dispatcher and the per-route scope fixed at build time.

use std::sync::Arc;

use axum::{
    Router,
    middleware,
    routing::{any, get},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::proxy::{RouteContext, dispatch};
use super::trace::{call_id_middleware, consumer_id_warning_middleware};
use crate::auth::obo::{OboContext, obo_middleware};
use crate::auth::scope::resolve_scope;
use crate::auth::{ExchangeToken, OboTokenStore, ValidateToken};
use crate::config::Config;

/// Shared collaborators the router wires into every route.
///
/// Injected as trait objects so tests can drive the full pipeline with stub
/// validators, exchangers, and stores.
pub struct GatewayDeps {
    /// Inbound token verification seam
    pub validator: Arc<dyn ValidateToken>,
    /// On-behalf-of exchange seam
    pub exchanger: Arc<dyn ExchangeToken>,
    /// Delegated token cache
    pub store: Arc<dyn OboTokenStore>,
    /// Outbound HTTP client for the dispatcher
    pub http: reqwest::Client,
}

fn join_context(context_path: &str, path: &str) -> String {
    format!("{context_path}{path}")
}

/// Build the gateway router from the validated configuration.
#[must_use]
pub fn create_router(config: &Config, deps: &GatewayDeps) -> Router {
    let context_path = &config.server.context_path;
    let provider = config.auth.resolved_obo_provider();

    let mut router = Router::new()
        .route(&join_context(context_path, "/internal/isAlive"), get(|| async { "" }))
        .route(&join_context(context_path, "/internal/isReady"), get(|| async { "" }));

    for route in &config.proxies {
        let mounted = join_context(context_path, &route.from_path);

        let obo = Arc::new(OboContext {
            validator: Arc::clone(&deps.validator),
            exchanger: Arc::clone(&deps.exchanger),
            store: Arc::clone(&deps.store),
            scope: resolve_scope(provider, route.to_app.as_ref()),
            provider,
        });

        let route_ctx = Arc::new(RouteContext {
            mounted_prefix: mounted.clone(),
            from_path: route.from_path.clone(),
            to_url: route.to_url.clone(),
            preserve_from_path: route.preserve_from_path,
            http: deps.http.clone(),
        });

        let proxied = Router::new()
            .route(&mounted, any(dispatch))
            .route(&format!("{mounted}/{{*rest}}"), any(dispatch))
            .route_layer(middleware::from_fn_with_state(obo, obo_middleware))
            .with_state(route_ctx);

        router = router.merge(proxied);
    }

    router
        .layer(middleware::from_fn(consumer_id_warning_middleware))
        .layer(middleware::from_fn(call_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}
