//! OpenID Connect discovery (`/.well-known/openid-configuration`).

use serde::Deserialize;
use tracing::{debug, info};

use super::AuthError;
use crate::config::ProviderDescriptor;

const WELL_KNOWN: &str = ".well-known/openid-configuration";

/// Provider metadata, limited to the fields the gateway consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier.
    pub issuer: Option<String>,
    /// Authorization endpoint.
    pub authorization_endpoint: Option<String>,
    /// Token endpoint.
    pub token_endpoint: Option<String>,
    /// User-info endpoint.
    pub userinfo_endpoint: Option<String>,
    /// Key set URI.
    pub jwks_uri: Option<String>,
    /// RFC 7009 revocation endpoint.
    pub revocation_endpoint: Option<String>,
}

impl DiscoveryDocument {
    /// Fill endpoints the descriptor leaves unset. Explicit values win.
    pub fn apply_to(&self, descriptor: &mut ProviderDescriptor) {
        fill(&mut descriptor.issuer, &self.issuer);
        fill(&mut descriptor.authorization_uri, &self.authorization_endpoint);
        fill(&mut descriptor.token_uri, &self.token_endpoint);
        fill(&mut descriptor.user_info_uri, &self.userinfo_endpoint);
        fill(&mut descriptor.jwks_uri, &self.jwks_uri);
        fill(&mut descriptor.revoke_uri, &self.revocation_endpoint);
    }
}

fn fill(slot: &mut Option<String>, discovered: &Option<String>) {
    if slot.as_deref().is_none_or(str::is_empty) {
        slot.clone_from(discovered);
    }
}

/// Resolve a configured discovery location to the metadata URL.
///
/// Accepts either the full well-known URL or the issuer base URL.
#[must_use]
pub fn metadata_url(discovery_uri: &str) -> String {
    if discovery_uri.trim_end_matches('/').ends_with(WELL_KNOWN) {
        discovery_uri.to_string()
    } else {
        format!("{}/{WELL_KNOWN}", discovery_uri.trim_end_matches('/'))
    }
}

/// Fetch and parse a discovery document.
pub async fn fetch(client: &reqwest::Client, discovery_uri: &str) -> Result<DiscoveryDocument, AuthError> {
    let url = metadata_url(discovery_uri);
    info!(url = %url, "Fetching OIDC discovery document");

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(AuthError::Remote(format!(
            "discovery at {url} returned HTTP {}",
            response.status()
        )));
    }
    let document: DiscoveryDocument = response
        .json()
        .await
        .map_err(|e| AuthError::Remote(format!("invalid discovery document at {url}: {e}")))?;
    debug!(issuer = ?document.issuer, jwks_uri = ?document.jwks_uri, "Discovery document loaded");
    Ok(document)
}
