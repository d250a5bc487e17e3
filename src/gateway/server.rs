//! Gateway server - collaborator construction, listener lifecycle, and
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use super::router::{GatewayDeps, create_router};
use crate::auth::exchange::OauthExchangeClient;
use crate::auth::store::create_token_store;
use crate::auth::validator::TokenValidator;
use crate::config::{Config, OboProvider};
use crate::{Error, Result};

/// SPA gateway server
pub struct Gateway {
    config: Config,
    deps: GatewayDeps,
}

impl Gateway {
    /// Construct the gateway's collaborators from the validated
    /// configuration.
    ///
    /// Discovery documents for the login and exchange providers are fetched
    /// here, once per process; a provider that cannot be resolved fails
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns an error when discovery fails, the client private key is
    /// invalid, or the remote cache store is unreachable.
    pub async fn new(config: Config) -> Result<Self> {
        // Identity traffic goes over the public internet; keep it strict.
        let identity_http = reqwest::Client::builder()
            .https_only(true)
            .timeout(Duration::from_secs(10))
            .build()?;

        // Downstream services are cluster-local and may be plain HTTP.
        // No global timeout so long-lived streamed responses keep flowing.
        let proxy_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let auth = &config.auth;
        let validator = TokenValidator::discover(
            identity_http.clone(),
            auth.login_provider,
            &auth.discovery_url,
            &auth.client_id,
            auth.secure_log,
        )
        .await?;

        let obo_provider = auth.resolved_obo_provider();
        let exchanger = match obo_provider {
            OboProvider::AzureAd => {
                OauthExchangeClient::discover(
                    identity_http.clone(),
                    obo_provider,
                    &auth.discovery_url,
                    &auth.client_id,
                    &auth.private_key_pem,
                )
                .await?
            }
            OboProvider::TokenX => {
                let token_x = auth.token_exchange.as_ref().ok_or_else(|| {
                    Error::Config("auth 'token_exchange' is required for ID_PORTEN logins".to_string())
                })?;
                OauthExchangeClient::discover(
                    identity_http.clone(),
                    obo_provider,
                    &token_x.discovery_url,
                    &token_x.client_id,
                    &token_x.private_key_pem,
                )
                .await?
            }
        };

        let store = create_token_store(auth.cache.as_ref()).await?;
        info!(backend = store.backend_kind(), "OBO token cache ready");

        let deps = GatewayDeps {
            validator: Arc::new(validator),
            exchanger: Arc::new(exchanger),
            store,
            http: proxy_http,
        };

        Ok(Self { config, deps })
    }

    /// Run the gateway until a shutdown signal arrives.
    ///
    /// In-flight requests are allowed to finish before the cache backend is
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let store = Arc::clone(&self.deps.store);
        let app = create_router(&self.config, &self.deps);

        let listener = TcpListener::bind(addr).await?;
        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            routes = self.config.proxies.len(),
            login_provider = ?self.config.auth.login_provider,
            "Listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Closing OBO token cache");
        store.close().await;

        Ok(())
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
