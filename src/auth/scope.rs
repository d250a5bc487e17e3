//! Exchange scope derivation
//!
//! Maps a downstream application identity to the scope string the
//! on-behalf-of exchange requests, per provider family:
//!
//! - Azure AD: `api://{cluster}.{namespace}.{name}/.default`
//! - Token exchange: `{cluster}:{namespace}:{name}`

use crate::config::{OboProvider, TargetApp};

/// Scope requested when exchanging towards an application behind Azure AD.
#[must_use]
pub fn azure_ad_scope(app: &TargetApp) -> String {
    format!(
        "api://{}.{}.{}/.default",
        app.cluster, app.namespace, app.name
    )
}

/// Audience requested when exchanging towards an application behind
/// token exchange.
#[must_use]
pub fn token_x_scope(app: &TargetApp) -> String {
    format!("{}:{}:{}", app.cluster, app.namespace, app.name)
}

/// Resolve the exchange scope for a route's target application.
///
/// Returns `None` when the route has no target application configured, which
/// means the request passes through without token exchange and with identity
/// headers stripped.
#[must_use]
pub fn resolve_scope(provider: OboProvider, app: Option<&TargetApp>) -> Option<String> {
    let app = app?;
    Some(match provider {
        OboProvider::AzureAd => azure_ad_scope(app),
        OboProvider::TokenX => token_x_scope(app),
    })
}
