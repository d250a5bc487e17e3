//! SPA Gateway Library
//!
//! Backend-for-frontend gateway for a single-page application: reverse-proxies
//! configured paths to internal services and, per proxied call, exchanges the
//! end user's login token for a delegated on-behalf-of token scoped to the
//! target service.
//!
//! # Pipeline
//!
//! Per request: extract bearer token -> validate signature/issuer/audience ->
//! resolve the route's fixed exchange scope -> cache lookup -> exchange on
//! miss -> rewrite auth headers -> dispatch downstream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
