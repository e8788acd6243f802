//! Token-level OIDC machinery: claims, key sets, validators, JWE and discovery.
//!
//! Nothing here knows about HTTP routing; the provider layer composes these
//! pieces into per-provider authenticators.

pub mod claims;
pub mod discovery;
pub mod error;
pub mod jwe;
pub mod jwks;
pub mod validator;

pub use claims::{TokenClaims, TokenShape};
pub use discovery::DiscoveryDocument;
pub use error::AuthError;
pub use jwe::{EncryptedTokenUnwrapper, Unwrapped};
pub use jwks::{CachedKey, HttpKeySetFetcher, KeySetCache, KeySetFetcher};
pub use validator::{AudienceValidator, SubjectValidator, TokenValidator, ValidatorChain};
