//! Validated, immutable per-provider configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ClientAuthStrategy, GrantKind, ProviderDescriptor, ValidatorKind};
use crate::{Error, Result};

/// One identity provider after discovery and validation.
///
/// Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Unique, case-sensitive name
    pub name: String,
    /// OAuth2 client id
    pub client_id: String,
    /// Resolved client secret
    pub client_secret: Option<String>,
    /// Expected issuer
    pub issuer: Option<String>,
    /// Authorization endpoint
    pub authorization_uri: Option<String>,
    /// Token endpoint
    pub token_uri: String,
    /// Revocation endpoint
    pub revoke_uri: Option<String>,
    /// User-info endpoint
    pub user_info_uri: Option<String>,
    /// Key-set endpoint
    pub jwks_uri: String,
    /// Group membership endpoint
    pub groups_uri: Option<String>,
    /// Redirect URI sent at login
    pub redirect_uri: Option<String>,
    /// Scopes requested at login
    pub scopes: Vec<String>,
    /// Accept directly attached bearer tokens
    pub allow_bearer_tokens: bool,
    /// Token request shaping
    pub client_auth: ClientAuthStrategy,
    /// Grant chain
    pub grants: Vec<GrantKind>,
    /// Principal name claim
    pub principal_claim: String,
    /// Roles claim
    pub roles_claim: Option<String>,
    /// Groups claim
    pub groups_claim: Option<String>,
    /// Subject container claim
    pub subject_container_claim: Option<String>,
    /// Fetch user-info during bearer validation
    pub fetch_user_info: bool,
    /// Decryption key path
    pub decryption_key: Option<PathBuf>,
    /// Accept plain claims from encrypted envelopes
    pub trust_encrypted_claims: bool,
    /// Validator chain
    pub validators: Vec<ValidatorKind>,
    /// Redirect unauthenticated requests to login
    pub auto_redirect: bool,
    /// Clock skew tolerance
    pub leeway: Duration,
}

impl ProviderConfig {
    /// Validate a descriptor whose endpoints have already been discovered.
    pub fn from_descriptor(d: &ProviderDescriptor) -> Result<Self> {
        let name = d.name.trim();
        if name.is_empty() {
            return Err(Error::Config("provider name must not be empty".to_string()));
        }
        if name.contains('/') {
            return Err(Error::provider_config(name, "name must not contain '/'"));
        }
        if d.client_id.trim().is_empty() {
            return Err(Error::provider_config(name, "client_id is required"));
        }
        let token_uri = required(name, "token_uri", d.token_uri.as_ref())?;
        let jwks_uri = required(name, "jwks_uri", d.jwks_uri.as_ref())?;

        let authorization_uri = non_empty(d.authorization_uri.as_ref());
        if d.grants.contains(&GrantKind::AuthorizationCode) && authorization_uri.is_none() {
            return Err(Error::provider_config(
                name,
                "authorization_uri is required for the authorization_code grant",
            ));
        }

        let client_secret = d.resolve_client_secret().filter(|s| !s.is_empty());
        if d.client_auth == ClientAuthStrategy::ClientSecret && client_secret.is_none() {
            return Err(Error::provider_config(
                name,
                "client_secret is required for client_secret authentication",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            client_id: d.client_id.trim().to_string(),
            client_secret,
            issuer: non_empty(d.issuer.as_ref()),
            authorization_uri,
            token_uri,
            revoke_uri: non_empty(d.revoke_uri.as_ref()),
            user_info_uri: non_empty(d.user_info_uri.as_ref()),
            jwks_uri,
            groups_uri: non_empty(d.groups_uri.as_ref()),
            redirect_uri: non_empty(d.redirect_uri.as_ref()),
            scopes: d.scopes.clone(),
            allow_bearer_tokens: d.allow_bearer_tokens,
            client_auth: d.client_auth,
            grants: d.grants.clone(),
            principal_claim: if d.principal_claim.is_empty() {
                "sub".to_string()
            } else {
                d.principal_claim.clone()
            },
            roles_claim: non_empty(d.roles_claim.as_ref()),
            groups_claim: non_empty(d.groups_claim.as_ref()),
            subject_container_claim: non_empty(d.subject_container_claim.as_ref()),
            fetch_user_info: d.fetch_user_info,
            decryption_key: d.decryption_key.clone(),
            trust_encrypted_claims: d.trust_encrypted_claims,
            validators: d.validators.clone(),
            auto_redirect: d.auto_redirect,
            leeway: d.leeway,
        })
    }

    /// Whether a grant is part of the chain.
    #[must_use]
    pub fn has_grant(&self, grant: GrantKind) -> bool {
        self.grants.contains(&grant)
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn required(provider: &str, field: &str, value: Option<&String>) -> Result<String> {
    non_empty(value).ok_or_else(|| Error::provider_config(provider, format!("{field} is required")))
}
