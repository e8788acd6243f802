//! Per-request dispatch across providers.
//!
//! Evaluated in order, first match wins:
//!
//! 1. already authenticated: pass through
//! 2. no providers: pass through
//! 3. `/openid/{provider}/callback`: complete that provider's login
//! 4. `/openid/{provider}/login`: start that provider's login
//! 5. bearer token present: offer it to each provider in registry order
//! 6. otherwise: the first provider's default entry, if it has one

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, info, warn};

use super::collaborators::{
    AuthenticatorDelegates, DelegateFactory, ProviderDelegates, SessionStore, UserDirectory,
};
use super::context::{AuthRequest, AuthenticationResult, INTERNAL_TOKEN_ATTRIBUTE};
use crate::cache::AuthenticationCache;
use crate::oidc::AuthError;
use crate::provider::{ProviderAuthenticator, ProviderRegistry, TokenResponse};

static FLOW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/openid/([^/]+)/(callback|login)(?:/|$)").expect("static regex")
});

/// What the caller should do with the request.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Continue unchanged (possibly unauthenticated).
    PassThrough,
    /// A bearer token was accepted; the principal is set.
    Authenticated {
        /// Accepting provider
        provider: String,
    },
    /// Send the browser elsewhere.
    Redirect {
        /// Target URL
        location: String,
    },
    /// A login callback succeeded and a session was created.
    LoggedIn {
        /// Provider that completed the login
        provider: String,
        /// New session id
        session_id: String,
        /// Where to send the browser
        location: String,
    },
    /// A login flow failed.
    Failed {
        /// Provider whose flow failed
        provider: String,
        /// Why
        error: AuthError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowStep {
    Callback,
    Login,
}

/// Single entry point deciding how each request is authenticated.
pub struct CompositeRouter {
    registry: Arc<ProviderRegistry>,
    cache: Arc<AuthenticationCache>,
    sessions: Arc<dyn SessionStore>,
    users: Option<Arc<dyn UserDirectory>>,
    delegate_factory: Arc<dyn DelegateFactory>,
    delegates: DashMap<String, ProviderDelegates>,
}

impl CompositeRouter {
    /// Router over `registry`, storing sessions in `sessions`.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<AuthenticationCache>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            registry,
            cache,
            sessions,
            users: None,
            delegate_factory: Arc::new(AuthenticatorDelegates),
            delegates: DashMap::new(),
        }
    }

    /// Resolve local users after each successful authentication.
    #[must_use]
    pub fn with_user_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    /// Replace the per-provider delegate factory.
    #[must_use]
    pub fn with_delegate_factory(mut self, factory: Arc<dyn DelegateFactory>) -> Self {
        self.delegate_factory = factory;
        self
    }

    /// The provider registry.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The shared authentication cache.
    #[must_use]
    pub fn cache(&self) -> &AuthenticationCache {
        &self.cache
    }

    /// The session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Delegates registered for `provider`, once it has authenticated a request.
    #[must_use]
    pub fn delegates(&self, provider: &str) -> Option<ProviderDelegates> {
        self.delegates.get(provider).map(|d| d.clone())
    }

    /// Decide and perform authentication for one request.
    pub async fn route(&self, request: &mut AuthRequest) -> RouteOutcome {
        if request.security.is_authenticated() {
            return RouteOutcome::PassThrough;
        }
        if self.registry.is_empty() {
            return RouteOutcome::PassThrough;
        }

        if let Some((name, step)) = parse_flow(&request.path) {
            let Some(provider) = self.registry.get(&name) else {
                warn!(provider = %name, path = %request.path, "Login flow for unknown provider");
                return RouteOutcome::PassThrough;
            };
            return match step {
                FlowStep::Callback => self.callback(provider, request).await,
                FlowStep::Login => login(provider, request),
            };
        }

        if request.resolve_token().is_some() || request.presented_bearer().is_some() {
            return self.bearer(request).await;
        }

        let Some(provider) = self.registry.first() else {
            return RouteOutcome::PassThrough;
        };
        match provider.default_entry(request) {
            Ok(Some(location)) => RouteOutcome::Redirect { location },
            Ok(None) => RouteOutcome::PassThrough,
            Err(e) => {
                warn!(provider = %provider.name(), error = %e, "Default entry failed");
                RouteOutcome::PassThrough
            }
        }
    }

    /// Invalidate a token and revoke it at the provider (best effort).
    ///
    /// Returns whether a cache entry was removed.
    pub async fn logout(&self, provider: &str, token: &str) -> Result<bool, AuthError> {
        let authenticator = self
            .registry
            .get(provider)
            .ok_or_else(|| AuthError::UnknownProvider(provider.to_string()))?;
        let invalidated = self.cache.invalidate(token);
        if authenticator.config().revoke_uri.is_some() {
            if let Err(e) = authenticator.revoke(token).await {
                warn!(provider, error = %e, "Token revocation failed");
            }
        }
        info!(provider, invalidated, "Logged out");
        Ok(invalidated)
    }

    /// Login entry points of every provider supporting browser login.
    #[must_use]
    pub fn login_entry_points(&self) -> Vec<String> {
        self.registry
            .iter()
            .filter_map(|p| match self.delegates(p.name()) {
                Some(delegates) => delegates.login_redirect,
                None => self.delegate_factory.create(p).login_redirect,
            })
            .map(|redirect| redirect.entry_point())
            .collect()
    }

    /// Refresh the tokens of a stored session through its provider's delegate.
    ///
    /// The old access token is evicted from the cache and the session is
    /// updated in place.
    pub async fn refresh_session(&self, session_id: &str) -> Result<TokenResponse, AuthError> {
        let mut session = self
            .sessions
            .load(session_id)
            .await
            .ok_or_else(|| AuthError::Session("unknown session".to_string()))?;
        let refresh_token = session.refresh_token.clone().ok_or(AuthError::MissingToken)?;
        let refresher = self
            .delegates(&session.provider)
            .and_then(|d| d.session_refresh)
            .ok_or_else(|| AuthError::Config(format!("provider '{}' cannot refresh sessions", session.provider)))?;

        let tokens = refresher.refresh(&refresh_token).await?;
        self.cache.invalidate(&session.access_token);
        session.access_token.clone_from(&tokens.access_token);
        if let Some(refresh) = &tokens.refresh_token {
            session.refresh_token = Some(refresh.clone());
        }
        if let Some(id_token) = &tokens.id_token {
            session.id_token = Some(id_token.clone());
        }
        let provider = session.provider.clone();
        self.sessions
            .update(session_id, session)
            .await
            .map_err(|e| AuthError::Session(e.to_string()))?;
        info!(provider = %provider, "Session refreshed");
        Ok(tokens)
    }

    async fn bearer(&self, request: &mut AuthRequest) -> RouteOutcome {
        if request.resolve_token().is_none() {
            if let Some(token) = request.presented_bearer().map(str::to_string) {
                request.set_attribute(INTERNAL_TOKEN_ATTRIBUTE, token);
            }
        }

        for provider in self.registry.iter() {
            match provider.authenticate_bearer(request).await {
                Ok(result) => {
                    self.register_delegates(provider);
                    self.resolve_user(&result).await;
                    return RouteOutcome::Authenticated {
                        provider: provider.name().to_string(),
                    };
                }
                Err(e) => {
                    request.security.clear();
                    match e {
                        AuthError::BearerNotAllowed(_) => {
                            debug!(provider = %provider.name(), "Provider does not take bearer tokens");
                        }
                        e => warn!(provider = %provider.name(), error = %e, "Bearer token rejected"),
                    }
                }
            }
        }
        debug!(path = %request.path, "No provider accepted the bearer token");
        RouteOutcome::PassThrough
    }

    async fn callback(
        &self,
        provider: &Arc<dyn ProviderAuthenticator>,
        request: &mut AuthRequest,
    ) -> RouteOutcome {
        let name = provider.name().to_string();
        let completion = match provider.complete_login(request).await {
            Ok(completion) => completion,
            Err(error) => {
                request.security.clear();
                warn!(provider = %name, error = %error, "Login callback failed");
                return RouteOutcome::Failed {
                    provider: name,
                    error,
                };
            }
        };

        self.register_delegates(provider);
        self.resolve_user(&completion.result).await;
        match self.sessions.store(completion.result).await {
            Ok(session_id) => RouteOutcome::LoggedIn {
                provider: name,
                session_id,
                location: completion.return_to.unwrap_or_else(|| "/".to_string()),
            },
            Err(e) => {
                request.security.clear();
                RouteOutcome::Failed {
                    provider: name,
                    error: AuthError::Session(e.to_string()),
                }
            }
        }
    }

    fn register_delegates(&self, provider: &Arc<dyn ProviderAuthenticator>) {
        if self.delegates.contains_key(provider.name()) {
            return;
        }
        self.delegates
            .entry(provider.name().to_string())
            .or_insert_with(|| {
                let delegates = self.delegate_factory.create(provider);
                debug!(
                    provider = %provider.name(),
                    session_refresh = delegates.session_refresh.is_some(),
                    login_redirect = delegates.login_redirect.is_some(),
                    "Provider delegates registered"
                );
                delegates
            });
    }

    async fn resolve_user(&self, result: &AuthenticationResult) {
        let Some(users) = &self.users else {
            return;
        };
        match users.resolve_or_create(result).await {
            Ok(user) => debug!(provider = %result.provider, user_id = %user.id, "Local user resolved"),
            Err(e) => warn!(provider = %result.provider, error = %e, "Local user resolution failed"),
        }
    }
}

fn login(provider: &Arc<dyn ProviderAuthenticator>, request: &AuthRequest) -> RouteOutcome {
    let return_to = request
        .param("return_to")
        .filter(|p| p.starts_with('/') && !p.starts_with("//"));
    match provider.begin_login(return_to) {
        Ok(location) => RouteOutcome::Redirect { location },
        Err(error) => {
            warn!(provider = %provider.name(), error = %error, "Login initiation failed");
            RouteOutcome::Failed {
                provider: provider.name().to_string(),
                error,
            }
        }
    }
}

fn parse_flow(path: &str) -> Option<(String, FlowStep)> {
    let caps = FLOW_PATTERN.captures(path)?;
    let step = match &caps[2] {
        "callback" => FlowStep::Callback,
        _ => FlowStep::Login,
    };
    Some((caps[1].to_string(), step))
}
