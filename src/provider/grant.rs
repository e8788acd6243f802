//! Token endpoint client: request shaping and the grant chain.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::ProviderConfig;
use crate::config::{ClientAuthStrategy, GrantKind};
use crate::oidc::AuthError;

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type, usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// OIDC ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Read an implicit-grant response from callback parameters.
    fn from_params(params: &HashMap<String, String>) -> Option<Self> {
        let access_token = params.get("access_token").filter(|t| !t.is_empty())?;
        Some(Self {
            access_token: access_token.clone(),
            token_type: params.get("token_type").cloned(),
            expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
            refresh_token: None,
            id_token: params.get("id_token").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Issues token endpoint requests for one provider.
///
/// Grants are tried in configured order; the first one whose inputs are
/// present on the callback is used.
#[derive(Debug, Clone)]
pub struct GrantChain {
    config: Arc<ProviderConfig>,
    http: reqwest::Client,
}

impl GrantChain {
    /// Create a chain for `config`.
    #[must_use]
    pub fn new(config: Arc<ProviderConfig>, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// Obtain tokens from callback parameters using the first applicable grant.
    pub async fn complete(
        &self,
        params: &HashMap<String, String>,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, AuthError> {
        for grant in &self.config.grants {
            match grant {
                GrantKind::AuthorizationCode => {
                    if let Some(code) = params.get("code") {
                        return self.exchange_code(code, code_verifier).await;
                    }
                }
                GrantKind::Implicit => {
                    if let Some(response) = TokenResponse::from_params(params) {
                        debug!(provider = %self.config.name, "Using implicit grant token");
                        return Ok(response);
                    }
                }
                GrantKind::Password => {
                    if let (Some(user), Some(pass)) = (params.get("username"), params.get("password")) {
                        return self.password(user, pass).await;
                    }
                }
                GrantKind::ClientCredentials => return self.client_credentials().await,
            }
        }
        Err(AuthError::Provider {
            error: "invalid_request".to_string(),
            description: "callback carries no input for any configured grant".to_string(),
        })
    }

    /// Authorization code exchange.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, AuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
        ];
        if let Some(redirect_uri) = &self.config.redirect_uri {
            params.push(("redirect_uri", redirect_uri.clone()));
        }
        if self.config.client_auth == ClientAuthStrategy::Pkce {
            let verifier = code_verifier.ok_or(AuthError::InvalidState)?;
            params.push(("code_verifier", verifier.to_string()));
        }
        self.post_token(params).await
    }

    /// Resource owner password credentials grant.
    pub async fn password(&self, username: &str, password: &str) -> Result<TokenResponse, AuthError> {
        let params = vec![
            ("grant_type", "password".to_string()),
            ("username", username.to_string()),
            ("password", password.to_string()),
            ("scope", self.config.scopes.join(" ")),
        ];
        self.post_token(params).await
    }

    /// Client credentials grant.
    pub async fn client_credentials(&self) -> Result<TokenResponse, AuthError> {
        let params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("scope", self.config.scopes.join(" ")),
        ];
        self.post_token(params).await
    }

    /// Refresh token grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        let response = self.post_token(params).await?;
        info!(provider = %self.config.name, "Token refreshed");
        Ok(response)
    }

    /// RFC 7009 revocation.
    pub async fn revoke(&self, token: &str, token_type_hint: &str) -> Result<(), AuthError> {
        let Some(revoke_uri) = &self.config.revoke_uri else {
            return Err(AuthError::Config(format!(
                "provider '{}' has no revoke_uri",
                self.config.name
            )));
        };
        let mut params = vec![
            ("token", token.to_string()),
            ("token_type_hint", token_type_hint.to_string()),
        ];
        self.shape(&mut params);

        let response = self.http.post(revoke_uri).form(&params).send().await?;
        if response.status().is_success() {
            info!(provider = %self.config.name, "Token revoked");
            Ok(())
        } else {
            Err(error_from(response).await)
        }
    }

    /// Client authentication fields, per the configured strategy.
    fn shape(&self, params: &mut Vec<(&'static str, String)>) {
        params.push(("client_id", self.config.client_id.clone()));
        if self.config.client_auth == ClientAuthStrategy::ClientSecret {
            if let Some(secret) = &self.config.client_secret {
                params.push(("client_secret", secret.clone()));
            }
        }
    }

    async fn post_token(&self, mut params: Vec<(&'static str, String)>) -> Result<TokenResponse, AuthError> {
        self.shape(&mut params);
        let grant = params.first().map(|(_, v)| v.clone()).unwrap_or_default();
        debug!(provider = %self.config.name, grant = %grant, "Token request");

        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let err = error_from(response).await;
            warn!(provider = %self.config.name, grant = %grant, error = %err, "Token request failed");
            return Err(err);
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Remote(format!("invalid token response: {e}")))
    }
}

async fn error_from(response: reqwest::Response) -> AuthError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(e) => AuthError::Provider {
            error: e.error,
            description: e.error_description.unwrap_or_default(),
        },
        Err(_) => AuthError::Remote(format!("HTTP {status}")),
    }
}
