//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::collaborators::{InMemorySessionStore, InMemoryUserDirectory};
use super::composite::CompositeRouter;
use super::router::{AppState, create_router};
use crate::cache::AuthenticationCache;
use crate::config::Config;
use crate::oidc::HttpKeySetFetcher;
use crate::provider::{AuthenticatorDeps, ProviderRegistry};
use crate::{Error, Result};

/// OIDC gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Composite router over the registered providers
    router: Arc<CompositeRouter>,
}

impl Gateway {
    /// Create a new gateway.
    ///
    /// Providers are built (including discovery) here; a provider that fails
    /// is logged and left out.
    pub async fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.server.http_timeout)
            .user_agent(concat!("oidc-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let cache = Arc::new(AuthenticationCache::from_config(&config.auth_cache));
        let deps = AuthenticatorDeps {
            key_fetcher: Arc::new(HttpKeySetFetcher::with_client(http.clone())),
            http,
            cache: Arc::clone(&cache),
        };

        let registry = ProviderRegistry::build(&config.providers, &deps).await;
        if registry.is_empty() {
            warn!("No identity providers registered - every request passes through unauthenticated");
        }

        let sessions = Arc::new(InMemorySessionStore::with_ttl(config.server.session_ttl));
        let router = CompositeRouter::new(Arc::new(registry), cache, sessions)
            .with_user_directory(Arc::new(InMemoryUserDirectory::new()));

        Ok(Self {
            config,
            router: Arc::new(router),
        })
    }

    /// The composite router.
    #[must_use]
    pub fn composite(&self) -> &Arc<CompositeRouter> {
        &self.router
    }

    /// The HTTP application, without binding a listener.
    #[must_use]
    pub fn app(&self) -> Router {
        let state = Arc::new(AppState {
            router: Arc::clone(&self.router),
            request_timeout: self.config.server.request_timeout,
        });
        create_router(state, self.config.server.public_paths.clone())
    }

    /// Run the gateway until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// In-flight requests get `server.shutdown_timeout` to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.app();

        info!("============================================================");
        info!("OIDC GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %listener.local_addr()?, "Listening");
        for name in self.router.registry().names() {
            info!("  provider {name}: /openid/{name}/login, /openid/{name}/callback");
        }
        info!(
            enabled = self.router.cache().is_enabled(),
            ttl = ?self.config.auth_cache.ttl,
            "Authentication cache"
        );

        let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.await;
            let _ = drain_tx.send(());
        });
        let server = tokio::spawn(async move { server.await });

        let grace = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server => {
                result
                    .map_err(|e| Error::Internal(e.to_string()))?
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
            () = async {
                let _ = drain_rx.await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(timeout = ?grace, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
