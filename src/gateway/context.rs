//! Framework-independent request view and the per-request security context.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use serde::Serialize;

use crate::oidc::TokenClaims;

/// Request attribute a framework integration may populate with an access token.
pub const FRAMEWORK_TOKEN_ATTRIBUTE: &str = "oauth2.access_token";

/// Request attribute the router uses to carry a token it found on the request.
pub const INTERNAL_TOKEN_ATTRIBUTE: &str = "oidc.bearer_token";

/// Query/form parameter accepted as an alternative to the `Authorization` header.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    /// Principal name, from the provider's configured principal claim.
    pub name: String,
    /// Roles taken from the roles claim.
    pub roles: Vec<String>,
    /// Groups from the groups claim and the groups endpoint.
    pub groups: Vec<String>,
    /// The validated access-token claims.
    pub claims: TokenClaims,
}

/// Outcome of a successful authentication against one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticationResult {
    /// Who was authenticated.
    pub principal: Principal,
    /// Name of the provider that vouched for the principal.
    pub provider: String,
    /// The raw access token.
    #[serde(skip_serializing)]
    pub access_token: String,
    /// ID token from an authorization-code login.
    #[serde(skip_serializing)]
    pub id_token: Option<String>,
    /// Refresh token from an authorization-code login.
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
}

/// Security state attached to one request.
///
/// An attempt marks which provider is working on the request; it is either
/// promoted to an authentication or cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityContext {
    authentication: Option<AuthenticationResult>,
    attempt: Option<String>,
}

impl SecurityContext {
    /// Whether a principal is set.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authentication.is_some()
    }

    /// The established authentication, if any.
    #[must_use]
    pub fn authentication(&self) -> Option<&AuthenticationResult> {
        self.authentication.as_ref()
    }

    /// Take the authentication out of the context.
    pub fn take_authentication(&mut self) -> Option<AuthenticationResult> {
        self.authentication.take()
    }

    /// Provider currently attempting authentication.
    #[must_use]
    pub fn attempt(&self) -> Option<&str> {
        self.attempt.as_deref()
    }

    /// Record that `provider` is attempting authentication.
    pub fn begin_attempt(&mut self, provider: &str) {
        self.attempt = Some(provider.to_string());
    }

    /// Set the principal, ending any attempt.
    pub fn set_authenticated(&mut self, result: AuthenticationResult) {
        self.attempt = None;
        self.authentication = Some(result);
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.attempt = None;
        self.authentication = None;
    }
}

/// What the router needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    /// Request path, without query string.
    pub path: String,
    /// Decoded query (and form) parameters; the first value of a name wins.
    pub params: HashMap<String, String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Per-request attributes shared between the router and authenticators.
    pub attributes: HashMap<String, String>,
    /// Access token handed over explicitly by an integration.
    pub access_token: Option<String>,
    /// Security state, mutated by the router.
    pub security: SecurityContext,
}

impl AuthRequest {
    /// Request for `path` with nothing else set.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Parse `query` (`a=1&b=2`) into the parameters.
    #[must_use]
    pub fn with_query(self, query: &str) -> Self {
        self.with_form(query.as_bytes())
    }

    /// Parse an `application/x-www-form-urlencoded` body into the parameters.
    /// Names already present keep their value.
    #[must_use]
    pub fn with_form(mut self, body: &[u8]) -> Self {
        for (k, v) in url::form_urlencoded::parse(body) {
            self.params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
        self
    }

    /// Add a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Convenience for `Authorization: Bearer {token}`.
    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header(header::AUTHORIZATION.as_str(), &format!("Bearer {token}"))
    }

    /// A query or form parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// A request attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Set a request attribute.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Token from `Authorization: Bearer` or the `access_token` parameter.
    #[must_use]
    pub fn presented_bearer(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let (scheme, token) = v.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
            })
            .filter(|t| !t.is_empty())
            .or_else(|| self.param(ACCESS_TOKEN_PARAM).filter(|t| !t.is_empty()))
    }

    /// Resolve the token to authenticate with.
    ///
    /// Priority: explicit token, then the framework attribute, then the
    /// internal attribute.
    #[must_use]
    pub fn resolve_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .or_else(|| self.attribute(FRAMEWORK_TOKEN_ATTRIBUTE))
            .or_else(|| self.attribute(INTERNAL_TOKEN_ATTRIBUTE))
            .filter(|t| !t.is_empty())
    }
}
