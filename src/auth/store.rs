//! OBO token cache
//!
//! Delegated tokens are cached under `sha256(access_token) + "_" + scope` so
//! the raw user token never reaches the store. Two interchangeable backends:
//! an in-process TTL map, and a Redis-protocol store over TLS for deployments
//! with more than one replica. The cache is a performance optimization, not a
//! correctness dependency: every backend failure degrades to a miss on read
//! and a no-op on write, costing at worst an extra exchange call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheStoreConfig;
use crate::Result;

/// Tokens are considered expired a bit before their actual expiration, to
/// prevent problems with clock skew and tokens expiring in-flight.
pub const CLOCK_SKEW_SECONDS: u64 = 30;

/// Cache TTL for a token the provider reported as living `expires_in_seconds`.
///
/// Floored at one second so a short-lived token is still momentarily
/// cacheable instead of producing a non-positive expiry.
#[must_use]
pub fn ttl_with_clock_skew(expires_in_seconds: u64) -> u64 {
    expires_in_seconds.saturating_sub(CLOCK_SKEW_SECONDS).max(1)
}

/// Cache key for a (user token, scope) pair.
///
/// Only the SHA-256 digest of the access token is used, never the token
/// itself.
#[must_use]
pub fn obo_token_key(access_token: &str, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{hex}_{scope}")
}

/// Backend-agnostic OBO token cache.
///
/// Implementations must be safe for unsynchronized concurrent use; the store
/// is shared read/write across all request-handling tasks.
#[async_trait]
pub trait OboTokenStore: Send + Sync {
    /// Look up a cached delegated token. Backend failures read as a miss.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a delegated token for `ttl_seconds`. Backend failures drop the
    /// write silently.
    async fn set(&self, key: &str, ttl_seconds: u64, token: &str);

    /// Remove a cached token.
    async fn delete(&self, key: &str);

    /// Release any backend connection. Called once at shutdown.
    async fn close(&self);

    /// Backend label for logs and metrics.
    fn backend_kind(&self) -> &'static str;
}

/// Select the cache backend from the resolved configuration.
///
/// Presence of remote-cache connection settings selects the remote backend
/// for this process's lifetime; otherwise the in-process backend is used.
///
/// # Errors
///
/// Returns an error if the remote store is configured but unreachable at
/// startup. Failures after startup degrade per-operation instead.
pub async fn create_token_store(
    cache: Option<&CacheStoreConfig>,
) -> Result<Arc<dyn OboTokenStore>> {
    match cache {
        Some(config) => {
            let store = ValkeyTokenStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryTokenStore::new())),
    }
}

// ============================================================================
// In-process backend
// ============================================================================

struct CachedToken {
    token: String,
    stored_at: Instant,
    ttl: Duration,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Thread-safe in-process token cache with per-entry TTL eviction.
pub struct InMemoryTokenStore {
    entries: DashMap<String, CachedToken>,
}

impl InMemoryTokenStore {
    /// Create a new empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn insert(&self, key: &str, ttl: Duration, token: &str) {
        self.entries.insert(
            key.to_string(),
            CachedToken {
                token: token.to_string(),
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OboTokenStore for InMemoryTokenStore {
    async fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.token.clone())
    }

    async fn set(&self, key: &str, ttl_seconds: u64, token: &str) {
        self.insert(key, Duration::from_secs(ttl_seconds), token);
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn close(&self) {}

    fn backend_kind(&self) -> &'static str {
        "in-process"
    }
}

// ============================================================================
// Remote backend
// ============================================================================

/// Token cache backed by a Redis-protocol store over TLS.
///
/// Uses only `GET`/`SETEX`/`DEL`. The multiplexed connection is cheap to
/// clone and safe for concurrent use.
pub struct ValkeyTokenStore {
    conn: redis::aio::MultiplexedConnection,
}

impl ValkeyTokenStore {
    /// Connect to the store, authenticating with username/password over TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(config: &CacheStoreConfig) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::TcpTls {
                host: config.host.clone(),
                port: config.port,
                insecure: false,
                tls_params: None,
            },
            redis: redis::RedisConnectionInfo {
                username: Some(config.username.clone()),
                password: Some(config.password.clone()),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info)
            .map_err(|e| crate::Error::Config(format!("Invalid cache store config: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                crate::Error::Config(format!(
                    "Failed to connect to cache store {}:{}: {e}",
                    config.host, config.port
                ))
            })?;

        debug!(host = %config.host, port = config.port, "Connected to remote token cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl OboTokenStore for ValkeyTokenStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        match result {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to get OBO token from remote cache");
                None
            }
        }
    }

    async fn set(&self, key: &str, ttl_seconds: u64, token: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.set_ex(key, token, ttl_seconds).await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to set OBO token in remote cache");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.del(key).await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to delete OBO token from remote cache");
        }
    }

    async fn close(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
        if let Err(e) = result {
            debug!(error = %e, "Error closing remote cache connection");
        }
    }

    fn backend_kind(&self) -> &'static str {
        "valkey"
    }
}
