//! Contracts the router calls after authentication, plus in-memory versions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::context::AuthenticationResult;
use crate::oidc::AuthError;
use crate::provider::{ProviderAuthenticator, TokenResponse};
use crate::Result;

/// A local account linked to an external principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalUser {
    /// Local identifier
    pub id: String,
    /// Principal name
    pub name: String,
    /// Provider that vouched for the principal
    pub provider: String,
}

/// Looks up or provisions the local user for an authenticated principal.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve the local user, creating it on first sight.
    async fn resolve_or_create(&self, result: &AuthenticationResult) -> Result<LocalUser>;
}

/// Persists login results under generated session ids.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store and return the new session id.
    async fn store(&self, result: AuthenticationResult) -> Result<String>;

    /// Load a session.
    async fn load(&self, session_id: &str) -> Option<AuthenticationResult>;

    /// Replace the stored result of an existing session.
    async fn update(&self, session_id: &str, result: AuthenticationResult) -> Result<()>;

    /// Delete a session. Returns whether it existed.
    async fn remove(&self, session_id: &str) -> bool;
}

/// User directory keeping users in memory, keyed by provider and name.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<(String, String), LocalUser>,
}

impl InMemoryUserDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no user is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn resolve_or_create(&self, result: &AuthenticationResult) -> Result<LocalUser> {
        let key = (result.provider.clone(), result.principal.name.clone());
        let user = self
            .users
            .entry(key)
            .or_insert_with(|| {
                debug!(provider = %result.provider, principal = %result.principal.name, "Provisioning local user");
                LocalUser {
                    id: Uuid::new_v4().to_string(),
                    name: result.principal.name.clone(),
                    provider: result.provider.clone(),
                }
            })
            .clone();
        Ok(user)
    }
}

/// Session lifetime used by [`InMemorySessionStore::new`].
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 3600);

/// Session store keeping sessions in memory.
///
/// A session lives for the TTL or until its access token expires, whichever
/// comes first. Updating a session restarts both.
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, StoredSession>,
    ttl: Duration,
}

#[derive(Debug)]
struct StoredSession {
    result: AuthenticationResult,
    expires_at: Instant,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    /// Empty store with [`DEFAULT_SESSION_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    /// Empty store whose sessions last at most `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    fn entry(&self, result: AuthenticationResult) -> StoredSession {
        let lifetime = result
            .principal
            .claims
            .remaining_lifetime()
            .map_or(self.ttl, |left| left.min(self.ttl));
        StoredSession {
            result,
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn store(&self, result: AuthenticationResult) -> Result<String> {
        self.sessions.retain(|_, session| !session.is_expired());
        let id = Uuid::new_v4().to_string();
        let session = self.entry(result);
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    async fn load(&self, session_id: &str) -> Option<AuthenticationResult> {
        let session = self.sessions.get(session_id)?;
        if session.is_expired() {
            drop(session);
            self.sessions.remove(session_id);
            debug!("Expired session discarded");
            return None;
        }
        Some(session.result.clone())
    }

    async fn update(&self, session_id: &str, result: AuthenticationResult) -> Result<()> {
        let session = self.entry(result);
        match self.sessions.get_mut(session_id) {
            Some(mut slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(crate::Error::Internal(format!("unknown session {session_id}"))),
        }
    }

    async fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }
}

/// Refreshes the tokens behind a session for one provider.
#[async_trait]
pub trait SessionRefresh: Send + Sync {
    /// Exchange a refresh token.
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenResponse, AuthError>;
}

/// Tells clients where to start a login for one provider.
pub trait LoginRedirect: Send + Sync {
    /// Gateway-local login entry point.
    fn entry_point(&self) -> String;
}

/// Per-provider delegates, registered lazily by the router.
#[derive(Clone, Default)]
pub struct ProviderDelegates {
    /// Session refresh, when the provider issues refresh tokens
    pub session_refresh: Option<Arc<dyn SessionRefresh>>,
    /// Login entry point, when the provider supports browser login
    pub login_redirect: Option<Arc<dyn LoginRedirect>>,
}

/// Creates the delegates for a provider. Either may be absent.
pub trait DelegateFactory: Send + Sync {
    /// Delegates for `provider`.
    fn create(&self, provider: &Arc<dyn ProviderAuthenticator>) -> ProviderDelegates;
}

/// Delegates backed directly by the provider's authenticator.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthenticatorDelegates;

struct AuthenticatorRefresh(Arc<dyn ProviderAuthenticator>);

#[async_trait]
impl SessionRefresh for AuthenticatorRefresh {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenResponse, AuthError> {
        self.0.refresh(refresh_token).await
    }
}

struct LoginPath(String);

impl LoginRedirect for LoginPath {
    fn entry_point(&self) -> String {
        format!("/openid/{}/login", self.0)
    }
}

impl DelegateFactory for AuthenticatorDelegates {
    fn create(&self, provider: &Arc<dyn ProviderAuthenticator>) -> ProviderDelegates {
        let config = provider.config();
        ProviderDelegates {
            session_refresh: Some(Arc::new(AuthenticatorRefresh(Arc::clone(provider))) as Arc<dyn SessionRefresh>),
            login_redirect: config
                .authorization_uri
                .is_some()
                .then(|| Arc::new(LoginPath(config.name.clone())) as Arc<dyn LoginRedirect>),
        }
    }
}
