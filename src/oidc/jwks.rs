//! Key-set (JWKS) retrieval and caching, one cache per provider.
//!
//! # Refresh policy
//!
//! - Lookups read an immutable snapshot; a hit never touches the network.
//! - A miss takes the per-cache refresh lock, re-checks, and performs at most
//!   one fetch. Callers that waited on the lock while another caller refreshed
//!   reuse that refresh instead of fetching again.
//! - A refresh replaces the whole key map. Failed fetches keep the old map.
//! - Only `kty: RSA` entries with `use: sig` are kept; malformed entries are
//!   skipped individually.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::AuthError;

/// Source of key-set documents.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetch the raw key-set document from `jwks_uri`.
    async fn fetch(&self, jwks_uri: &str) -> Result<Value, AuthError>;
}

/// Fetches key sets over HTTP.
pub struct HttpKeySetFetcher {
    http: reqwest::Client,
}

impl HttpKeySetFetcher {
    /// Create a fetcher with its own client and the given timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Create a fetcher sharing an existing client.
    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, jwks_uri: &str) -> Result<Value, AuthError> {
        let response = self.http.get(jwks_uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Remote(format!(
                "key set fetch from {jwks_uri} failed: HTTP {status}"
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AuthError::Remote(format!("key set response is not JSON: {e}")))
    }
}

/// A public signing key taken from a provider's key set.
#[derive(Clone)]
pub struct CachedKey {
    /// Key id (`kid`), empty when the provider publishes none.
    pub kid: String,
    /// Declared algorithm, if any.
    pub alg: Option<String>,
    /// Verification key.
    pub key: DecodingKey,
}

impl std::fmt::Debug for CachedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedKey")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

/// One entry of the `keys` array, all fields optional so bad entries can be skipped.
#[derive(Debug, Deserialize)]
struct RawJwk {
    kty: Option<String>,
    #[serde(rename = "use")]
    usage: Option<String>,
    kid: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

type KeyMap = HashMap<String, CachedKey>;

/// Resolves key ids to public keys for one provider.
pub struct KeySetCache {
    provider: String,
    jwks_uri: String,
    fetcher: Arc<dyn KeySetFetcher>,
    /// Current snapshot; replaced wholesale on refresh
    keys: RwLock<Arc<KeyMap>>,
    /// Serializes refreshes for this provider only
    refresh_lock: Mutex<()>,
    /// Completed refresh attempts, used to collapse waiting callers
    generation: AtomicU64,
    fetches: AtomicU64,
}

impl KeySetCache {
    /// Create an empty cache for `provider`'s key-set endpoint.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        jwks_uri: impl Into<String>,
        fetcher: Arc<dyn KeySetFetcher>,
    ) -> Self {
        Self {
            provider: provider.into(),
            jwks_uri: jwks_uri.into(),
            fetcher,
            keys: RwLock::new(Arc::new(HashMap::new())),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Look up a key, refreshing the key set once on a miss.
    ///
    /// `None` means authentication cannot be completed with this key id:
    /// either the key set does not contain it or the refresh failed.
    pub async fn get_key(&self, kid: Option<&str>) -> Option<CachedKey> {
        let kid = kid.unwrap_or("");
        if let Some(key) = self.lookup(kid) {
            return Some(key);
        }

        let seen = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if let Some(key) = self.lookup(kid) {
            return Some(key);
        }
        if self.generation.load(Ordering::Acquire) != seen {
            debug!(provider = %self.provider, kid = %kid, "Key set refreshed while waiting, key still unknown");
            return None;
        }

        self.refresh().await;
        self.lookup(kid)
    }

    /// Fetch and replace the key set. Failures keep the current snapshot.
    async fn refresh(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(provider = %self.provider, uri = %self.jwks_uri, "Fetching key set");

        let result = self.fetcher.fetch(&self.jwks_uri).await.and_then(|doc| parse_key_set(&doc));
        match result {
            Ok(keys) => {
                info!(provider = %self.provider, keys = keys.len(), "Key set refreshed");
                *self.keys.write() = Arc::new(keys);
            }
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "Key set refresh failed, keeping cached keys");
            }
        }
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn lookup(&self, kid: &str) -> Option<CachedKey> {
        let snapshot: Arc<KeyMap> = self.keys.read().clone();
        if let Some(key) = snapshot.get(kid) {
            return Some(key.clone());
        }
        // Tokens without a kid are accepted when the provider publishes a single key
        if kid.is_empty() && snapshot.len() == 1 {
            return snapshot.values().next().cloned();
        }
        None
    }

    /// Number of keys currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether no keys are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches issued so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Key-set endpoint this cache reads from.
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }
}

/// Parse a key-set document into RSA signature keys.
fn parse_key_set(doc: &Value) -> Result<KeyMap, AuthError> {
    let entries = doc
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| AuthError::Remote("key set document has no 'keys' array".to_string()))?;

    let mut keys = HashMap::with_capacity(entries.len());
    for entry in entries {
        let raw: RawJwk = match serde_json::from_value(entry.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable key set entry");
                continue;
            }
        };
        if raw.kty.as_deref() != Some("RSA") || raw.usage.as_deref() != Some("sig") {
            continue;
        }
        let (Some(n), Some(e)) = (raw.n.as_deref(), raw.e.as_deref()) else {
            debug!(kid = ?raw.kid, "Skipping RSA key without modulus/exponent");
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                let kid = raw.kid.unwrap_or_default();
                keys.insert(
                    kid.clone(),
                    CachedKey {
                        kid,
                        alg: raw.alg,
                        key,
                    },
                );
            }
            Err(err) => debug!(kid = ?raw.kid, error = %err, "Skipping invalid RSA key"),
        }
    }
    Ok(keys)
}
