//! OIDC Gateway Library
//!
//! Multi-tenant OpenID Connect gateway: many identity providers behind one
//! composite router.
//!
//! # Features
//!
//! - **Bearer tokens**: signed JWTs verified against cached JWKS, optionally
//!   wrapped in JWE
//! - **Browser login**: authorization code with PKCE, implicit, password and
//!   client-credentials grants
//! - **Validation**: audience and subject checks, issuer pinning, nonce binding
//! - **Authentication cache**: LRU with TTL keyed by raw token
//! - **Discovery**: endpoints filled in from `.well-known/openid-configuration`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oidc;
pub mod provider;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
