//! Provider registry, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::authenticator::{AuthenticatorDeps, OidcAuthenticator, ProviderAuthenticator};
use super::ProviderConfig;
use crate::config::ProviderDescriptor;
use crate::oidc::discovery;
use crate::{Error, Result};

/// Registered providers by name, in configuration order.
///
/// Order matters: bearer tokens are offered to providers in this order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ProviderAuthenticator>>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from descriptors.
    ///
    /// Disabled descriptors are skipped. A descriptor that fails discovery or
    /// validation is logged and skipped; the rest still register.
    pub async fn build(descriptors: &[ProviderDescriptor], deps: &AuthenticatorDeps) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            if !descriptor.enabled {
                info!(provider = %descriptor.name, "Provider disabled, skipping");
                continue;
            }
            let registered = match prepare(descriptor, deps).await {
                Ok(authenticator) => registry.register(Arc::new(authenticator)),
                Err(e) => Err(e),
            };
            if let Err(e) = registered {
                error!(provider = %descriptor.name, error = %e, "Provider not registered");
            }
        }
        info!(providers = registry.len(), "Provider registry built");
        registry
    }

    /// Add a provider. Names are unique; the first registration wins.
    pub fn register(&mut self, provider: Arc<dyn ProviderAuthenticator>) -> Result<()> {
        let name = provider.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::provider_config(&name, "duplicate provider name"));
        }
        info!(provider = %name, "Provider registered");
        self.index.insert(name, self.providers.len());
        self.providers.push(provider);
        Ok(())
    }

    /// Provider by exact (case-sensitive) name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ProviderAuthenticator>> {
        self.index.get(name).map(|&i| &self.providers[i])
    }

    /// Providers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProviderAuthenticator>> {
        self.providers.iter()
    }

    /// Provider names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    /// First registered provider.
    #[must_use]
    pub fn first(&self) -> Option<&Arc<dyn ProviderAuthenticator>> {
        self.providers.first()
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

async fn prepare(descriptor: &ProviderDescriptor, deps: &AuthenticatorDeps) -> Result<OidcAuthenticator> {
    let mut descriptor = descriptor.clone();
    if let Some(uri) = descriptor.discovery_uri.clone() {
        let document = discovery::fetch(&deps.http, &uri)
            .await
            .map_err(|e| Error::provider_config(&descriptor.name, format!("discovery failed: {e}")))?;
        document.apply_to(&mut descriptor);
    }
    let config = ProviderConfig::from_descriptor(&descriptor)?;
    OidcAuthenticator::new(config, deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AuthenticationCache;
    use crate::oidc::HttpKeySetFetcher;
    use axum::{Json, Router, routing::get};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn deps() -> AuthenticatorDeps {
        AuthenticatorDeps {
            http: reqwest::Client::new(),
            cache: Arc::new(AuthenticationCache::disabled()),
            key_fetcher: Arc::new(HttpKeySetFetcher::new(Duration::from_secs(1))),
        }
    }

    fn descriptor(name: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.into(),
            client_id: format!("{name}-client"),
            authorization_uri: Some("https://idp/authorize".into()),
            token_uri: Some("https://idp/token".into()),
            jwks_uri: Some("https://idp/keys".into()),
            ..ProviderDescriptor::default()
        }
    }

    #[tokio::test]
    async fn build_preserves_order_and_skips_bad_entries() {
        let descriptors = vec![
            descriptor("zeta"),
            ProviderDescriptor {
                jwks_uri: None,
                ..descriptor("broken")
            },
            ProviderDescriptor {
                enabled: false,
                ..descriptor("off")
            },
            descriptor("alpha"),
            ProviderDescriptor {
                client_id: "second".into(),
                ..descriptor("zeta")
            },
        ];
        let registry = ProviderRegistry::build(&descriptors, &deps()).await;

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(
            registry.get("zeta").map(|p| p.config().client_id.clone()),
            Some("zeta-client".to_string())
        );
        assert!(registry.get("Zeta").is_none());
        assert!(registry.get("broken").is_none());
    }

    #[tokio::test]
    async fn unreadable_decryption_key_skips_provider() {
        let descriptors = vec![ProviderDescriptor {
            decryption_key: Some("/nonexistent/key.pem".into()),
            ..descriptor("enc")
        }];
        assert!(ProviderRegistry::build(&descriptors, &deps()).await.is_empty());
    }

    #[tokio::test]
    async fn discovery_fills_missing_endpoints() {
        let app = Router::new().route(
            "/.well-known/openid-configuration",
            get(|| async {
                Json(json!({
                    "issuer": "https://idp.example.com",
                    "authorization_endpoint": "https://idp.example.com/authorize",
                    "token_endpoint": "https://idp.example.com/token",
                    "jwks_uri": "https://idp.example.com/keys",
                    "revocation_endpoint": "https://idp.example.com/revoke"
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let descriptors = vec![ProviderDescriptor {
            name: "disc".into(),
            client_id: "c".into(),
            discovery_uri: Some(format!("http://{addr}")),
            token_uri: Some("https://override/token".into()),
            ..ProviderDescriptor::default()
        }];
        let registry = ProviderRegistry::build(&descriptors, &deps()).await;
        let config = registry.get("disc").unwrap().config();

        assert_eq!(config.token_uri, "https://override/token");
        assert_eq!(config.jwks_uri, "https://idp.example.com/keys");
        assert_eq!(config.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(config.revoke_uri.as_deref(), Some("https://idp.example.com/revoke"));
    }

    #[tokio::test]
    async fn failed_discovery_skips_provider() {
        let descriptors = vec![ProviderDescriptor {
            discovery_uri: Some("http://127.0.0.1:9".into()),
            ..descriptor("down")
        }];
        assert!(ProviderRegistry::build(&descriptors, &deps()).await.is_empty());
    }
}
