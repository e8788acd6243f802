//! Configuration management

use std::{env, path::Path, path::PathBuf, sync::LazyLock, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication cache configuration
    pub auth_cache: AuthCacheConfig,
    /// Identity provider descriptors, in trial order for bearer tokens
    pub providers: Vec<ProviderDescriptor>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Timeout for outbound calls to identity providers
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Paths served without consulting the router
    pub public_paths: Vec<String>,
    /// Longest a browser session lives; it also ends when its access token expires
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            public_paths: vec!["/health".to_string()],
            session_ttl: Duration::from_secs(8 * 3600),
        }
    }
}

/// Authentication cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    /// Enable the authentication cache
    pub enabled: bool,
    /// Maximum number of cached tokens before LRU eviction
    pub max_entries: usize,
    /// Time-to-live of a cached authentication
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// How token endpoint requests authenticate the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthStrategy {
    /// Proof Key for Code Exchange (RFC 7636)
    #[default]
    Pkce,
    /// `client_id` and `client_secret` in the form body
    ClientSecret,
    /// Public client: `client_id` only
    Public,
}

/// OAuth2 grant types a provider may use, tried in configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Authorization code exchange
    AuthorizationCode,
    /// Implicit grant (token delivered on the callback)
    Implicit,
    /// Resource owner password credentials
    Password,
    /// Client credentials
    ClientCredentials,
}

/// Bearer token validators, run in configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    /// `aud` / `appid` / `azp` must name the client id
    Audience,
    /// token `sub` must match the user-info `sub`
    Subject,
}

/// One identity provider as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderDescriptor {
    /// Unique, case-sensitive provider name (used in `/openid/{name}/...`)
    pub name: String,
    /// Whether the provider is registered at startup
    pub enabled: bool,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret (supports `env:VAR_NAME` and `${VAR}`)
    pub client_secret: Option<String>,
    /// Discovery document URL; fills endpoints not set explicitly
    pub discovery_uri: Option<String>,
    /// Expected `iss` claim
    pub issuer: Option<String>,
    /// Authorization endpoint
    pub authorization_uri: Option<String>,
    /// Token endpoint
    pub token_uri: Option<String>,
    /// Revocation endpoint (RFC 7009)
    pub revoke_uri: Option<String>,
    /// User-info endpoint
    pub user_info_uri: Option<String>,
    /// Key-set endpoint
    pub jwks_uri: Option<String>,
    /// Paginated group membership endpoint (Graph-style `@odata.nextLink`)
    pub groups_uri: Option<String>,
    /// Redirect URI registered with the provider
    pub redirect_uri: Option<String>,
    /// Scopes requested at login
    pub scopes: Vec<String>,
    /// Accept directly attached bearer tokens
    pub allow_bearer_tokens: bool,
    /// Token endpoint request shaping
    pub client_auth: ClientAuthStrategy,
    /// Grant chain, in fallback order
    pub grants: Vec<GrantKind>,
    /// Claim holding the principal name
    pub principal_claim: String,
    /// Claim holding role names
    pub roles_claim: Option<String>,
    /// Claim holding group names
    pub groups_claim: Option<String>,
    /// Container claim nesting the subject (e.g. `ext` for `ext.sub`)
    pub subject_container_claim: Option<String>,
    /// Fetch user-info claims for the subject check
    pub fetch_user_info: bool,
    /// Private key (PKCS#8 PEM) used to decrypt encrypted tokens
    pub decryption_key: Option<PathBuf>,
    /// Accept plain claims recovered from an encrypted envelope
    pub trust_encrypted_claims: bool,
    /// Validator chain
    pub validators: Vec<ValidatorKind>,
    /// Send unauthenticated requests to this provider's login
    pub auto_redirect: bool,
    /// Clock skew tolerance for `exp` / `nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for ProviderDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            client_id: String::new(),
            client_secret: None,
            discovery_uri: None,
            issuer: None,
            authorization_uri: None,
            token_uri: None,
            revoke_uri: None,
            user_info_uri: None,
            jwks_uri: None,
            groups_uri: None,
            redirect_uri: None,
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ],
            allow_bearer_tokens: true,
            client_auth: ClientAuthStrategy::default(),
            grants: vec![GrantKind::AuthorizationCode],
            principal_claim: "sub".to_string(),
            roles_claim: None,
            groups_claim: None,
            subject_container_claim: None,
            fetch_user_info: false,
            decryption_key: None,
            trust_encrypted_claims: false,
            validators: vec![ValidatorKind::Audience, ValidatorKind::Subject],
            auto_redirect: false,
            leeway: Duration::from_secs(60),
        }
    }
}

impl ProviderDescriptor {
    /// Resolve the client secret (expand `env:VAR_NAME` and `${VAR}`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_deref().map(resolve_secret)
    }
}

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static regex")
});

/// Resolve a secret value: `env:VAR_NAME`, `${VAR}` patterns, or a literal.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        expand_string(value)
    }
}

/// Expand environment variables in a string
fn expand_string(value: &str) -> String {
    ENV_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OIDC_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be in the process environment before secrets are expanded
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} patterns in endpoint URLs
    fn expand_env_vars(&mut self) {
        for provider in &mut self.providers {
            for uri in [
                &mut provider.discovery_uri,
                &mut provider.authorization_uri,
                &mut provider.token_uri,
                &mut provider.revoke_uri,
                &mut provider.user_info_uri,
                &mut provider.jwks_uri,
                &mut provider.groups_uri,
                &mut provider.redirect_uri,
            ]
            .into_iter()
            .flatten()
            {
                *uri = expand_string(uri);
            }
            provider.client_id = expand_string(&provider.client_id);
        }
    }

    /// Get enabled provider descriptors only, in configured order
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Humantime-style serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a string in seconds (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a duration string (e.g., "30s", "5m", "100ms", "15")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m" or bare seconds.
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
