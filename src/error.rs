//! Error types for the SPA gateway

use std::io;

use thiserror::Error;

/// Result type alias for the SPA gateway
pub type Result<T> = std::result::Result<T, Error>;

/// SPA gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OIDC discovery document could not be resolved
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The identity provider rejected an on-behalf-of exchange
    #[error("Token exchange rejected: HTTP {status} - {body}")]
    Exchange {
        /// HTTP status returned by the token endpoint
        status: u16,
        /// Response body excerpt (never contains the subject token)
        body: String,
    },

    /// JWT signing or verification error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an error for the `obo_exchange_errors_total` metric label.
    ///
    /// Buckets transport-level failures into a small fixed set so the label
    /// cardinality stays bounded.
    #[must_use]
    pub fn classify(&self) -> &'static str {
        match self {
            Self::Exchange { .. } => "rejected",
            Self::Http(e) => classify_transport(e),
            _ => "other",
        }
    }
}

fn classify_transport(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        return "timeout";
    }
    let chain = format!("{e:?}").to_ascii_lowercase();
    if chain.contains("tls") || chain.contains("certificate") || chain.contains("handshake") {
        "tls"
    } else if e.is_connect() {
        "connect"
    } else {
        "other"
    }
}
