//! Inbound token verification - JWT signature validation and JWKS caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid`.
//! 2. Resolve the signing key from the provider's JWKS (cached for 1 hour;
//!    refreshed once on unknown `kid`).
//! 3. Verify the RS256 signature and standard claims (`exp`, `iss`, and for
//!    Azure AD `aud`).
//! 4. For ID-porten, assert the `client_id` claim equals the expected client
//!    id; ID-porten encodes the client there instead of in `aud`.
//!
//! The discovery document is fetched once per validator lifetime, never per
//! request. Verification failures are logged and reported as `false`; they
//! never propagate as errors to the request pipeline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::LoginProvider;
use crate::{Error, Result};

/// How long a fetched JWKS is served from cache.
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Verification seam used by the OBO middleware.
///
/// The contract never fails outward: an absent token, a bad signature, and an
/// unreachable key endpoint all read as "not valid".
#[async_trait]
pub trait ValidateToken: Send + Sync {
    /// Whether the inbound bearer token is valid for this gateway.
    async fn is_valid(&self, token: Option<&str>) -> bool;
}

/// Error variants for token verification failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The `client_id` claim does not match the expected client id.
    #[error("Expected 'client_id' claim to equal {expected}")]
    ClientIdMismatch {
        /// The client id this gateway is registered as.
        expected: String,
    },

    /// Network or HTTP error while fetching the JWKS.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Claims extracted from a verified user token.
#[derive(Debug, Deserialize)]
struct UserClaims {
    /// ID-porten puts the authenticated client here instead of in `aud`.
    #[serde(default)]
    client_id: Option<String>,
}

/// OIDC discovery document fields this validator needs.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
    issuer: String,
}

/// Fetch the provider's discovery document.
pub(crate) async fn fetch_discovery(
    http: &reqwest::Client,
    discovery_url: &str,
) -> Result<(String, String)> {
    let doc: DiscoveryDocument = http
        .get(discovery_url)
        .send()
        .await
        .map_err(|e| Error::Discovery(format!("{discovery_url}: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Discovery(format!("{discovery_url}: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Discovery(format!("{discovery_url}: {e}")))?;

    Ok((doc.issuer, doc.jwks_uri))
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// Token validator for one login provider.
pub struct TokenValidator {
    provider: LoginProvider,
    issuer: String,
    jwks_uri: String,
    client_id: String,
    secure_log: bool,
    http: reqwest::Client,
    jwks: DashMap<String, CachedJwks>,
}

impl TokenValidator {
    /// Build a validator from the provider's discovery document.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery document cannot be fetched or lacks
    /// `issuer`/`jwks_uri`.
    pub async fn discover(
        http: reqwest::Client,
        provider: LoginProvider,
        discovery_url: &str,
        client_id: &str,
        secure_log: bool,
    ) -> Result<Self> {
        let (issuer, jwks_uri) = fetch_discovery(&http, discovery_url).await?;
        debug!(issuer = %issuer, jwks_uri = %jwks_uri, "Resolved login provider discovery document");
        Ok(Self::new(http, provider, issuer, jwks_uri, client_id, secure_log))
    }

    /// Build a validator from already-resolved issuer and JWKS endpoint.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        provider: LoginProvider,
        issuer: String,
        jwks_uri: String,
        client_id: &str,
        secure_log: bool,
    ) -> Self {
        Self {
            provider,
            issuer,
            jwks_uri,
            client_id: client_id.to_string(),
            secure_log,
            http,
            jwks: DashMap::new(),
        }
    }

    async fn verify(&self, token: &str) -> std::result::Result<(), ValidationError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(ValidationError::MissingKeyId)?;

        let decoding_key = self.find_decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        match self.provider {
            LoginProvider::AzureAd => validation.set_audience(&[&self.client_id]),
            // ID-porten encodes the client as a claim, not an audience
            LoginProvider::IdPorten => validation.validate_aud = false,
        }

        let data = jsonwebtoken::decode::<UserClaims>(token, &decoding_key, &validation)?;

        if self.provider == LoginProvider::IdPorten
            && data.claims.client_id.as_deref() != Some(self.client_id.as_str())
        {
            return Err(ValidationError::ClientIdMismatch {
                expected: self.client_id.clone(),
            });
        }

        Ok(())
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache once if not
    /// found. The single forced refresh bounds re-fetching when the key truly
    /// does not exist.
    async fn find_decoding_key(
        &self,
        kid: &str,
    ) -> std::result::Result<DecodingKey, ValidationError> {
        let jwks = self.get_or_fetch_jwks(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch_jwks(true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| ValidationError::UnknownKeyId(kid.to_string()))
    }

    async fn get_or_fetch_jwks(
        &self,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, ValidationError> {
        if !force_refresh {
            if let Some(cached) = self.jwks.get(&self.jwks_uri) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.jwks.insert(
            self.jwks_uri.clone(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(jwks)
    }
}

#[async_trait]
impl ValidateToken for TokenValidator {
    async fn is_valid(&self, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };

        match self.verify(token).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, provider = ?self.provider, "Failed to verify token");
                if self.secure_log {
                    error!(target: "secure", token = %token, error = %e, "Token verification failure detail");
                }
                false
            }
        }
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
/// Only RSA keys are considered; RS256 is the sole allowed algorithm.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rsa_jwks(kid: &str) -> JwkSet {
        // 2048-bit modulus captured from a throwaway key pair
        serde_json::from_value(json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": "6s7QS8Y5i_V_ecHmQ-H3OHTPAKf5EoIY7AvN6T7T2emhop9hnxvyyDLrCDppISoWnpudLg4OROEs0WxTKXFAwq70qnqdau1Nt5ohl57eTrABI86wbWMP_PgS1kL9XZlF6DwGZyc70MaCTrxow1110l3h3E9DSqEOyV-vyPAzVJiPeDDoNFFH9Y624A-6GWAFqYcXCZ3RNM0CfmzkT0vIVXAge4GFmnHkREzc6soGm145CnBl2gKaMCrhNtSJpfXTThI7mvy-QV0-L_bSm6Afm1dTxai8ZKYLFxziRjr8xohF6NdmDECiD-jrha15AFra5RuPuPGfTO8Mjko7JrU0xQ",
                "e": "AQAB"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn find_key_matches_on_kid() {
        let jwks = rsa_jwks("key-1");
        assert!(find_key_in_jwks(&jwks, "key-1").is_some());
    }

    #[test]
    fn find_key_rejects_unknown_kid() {
        let jwks = rsa_jwks("key-1");
        assert!(find_key_in_jwks(&jwks, "key-2").is_none());
    }

    fn validator(provider: LoginProvider) -> TokenValidator {
        TokenValidator::new(
            reqwest::Client::new(),
            provider,
            "https://issuer.example".to_string(),
            "https://issuer.example/jwks".to_string(),
            "gateway-client",
            false,
        )
    }

    #[tokio::test]
    async fn absent_token_is_invalid_without_any_network_work() {
        // The JWKS endpoint does not exist; an absent token must short-circuit
        // before any fetch is attempted.
        let v = validator(LoginProvider::AzureAd);
        assert!(!v.is_valid(None).await);
    }

    #[tokio::test]
    async fn malformed_token_is_invalid() {
        // Header decode fails before any key resolution.
        let v = validator(LoginProvider::AzureAd);
        assert!(!v.is_valid(Some("not-a-jwt")).await);
    }

    #[tokio::test]
    async fn token_without_kid_is_invalid() {
        // Valid JWT shape, RS256 header without kid; rejected before key fetch.
        let header = "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9"; // {"alg":"RS256","typ":"JWT"}
        let token = format!("{header}.e30.c2ln");
        let v = validator(LoginProvider::IdPorten);
        assert!(!v.is_valid(Some(&token)).await);
    }
}
