//! Identity providers: configuration, token endpoint calls and authenticators.
//!
//! ```text
//! ProviderDescriptor ──discovery──▶ ProviderConfig ──▶ OidcAuthenticator
//!                                                      ├─ KeySetCache
//!                                                      ├─ ValidatorChain
//!                                                      ├─ EncryptedTokenUnwrapper
//!                                                      └─ GrantChain
//! ```
//!
//! The [`ProviderRegistry`] holds one authenticator per enabled provider.

pub mod authenticator;
pub mod config;
pub mod grant;
pub mod registry;
pub mod userinfo;

pub use authenticator::{
    AuthenticatorDeps, LoginCompletion, OidcAuthenticator, PENDING_LOGIN_TTL, ProviderAuthenticator,
};
pub use config::ProviderConfig;
pub use grant::{GrantChain, TokenResponse};
pub use registry::ProviderRegistry;
