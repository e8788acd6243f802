//! Error types for the OIDC gateway

use std::io;

use thiserror::Error;

/// Result type alias for the OIDC gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors raised by startup, configuration and server plumbing.
///
/// Per-request authentication failures use [`crate::oidc::AuthError`] instead;
/// they never escape the router.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a configuration error scoped to one provider.
    pub fn provider_config(provider: &str, message: impl AsRef<str>) -> Self {
        Self::Config(format!("provider '{provider}': {}", message.as_ref()))
    }
}
