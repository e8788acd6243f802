//! Authentication failure taxonomy.

/// Why one authentication attempt against one provider failed.
///
/// These never escape the router: bearer failures move on to the next
/// provider, callback failures become a 401 response.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The provider does not accept directly attached bearer tokens.
    #[error("Provider '{0}' does not accept bearer tokens")]
    BearerNotAllowed(String),

    /// No token value could be resolved from the request.
    #[error("No bearer token found on the request")]
    MissingToken,

    /// The token is not a well-formed JWT / JWE.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// None of `aud`, `appid`, `azp` names this client.
    #[error("Audience mismatch: token is not issued for client '{expected}'")]
    AudienceMismatch {
        /// The configured client id.
        expected: String,
    },

    /// Access-token subject differs from the user-info subject.
    #[error("Subject mismatch: token subject '{token}' does not match user-info subject '{user_info}'")]
    SubjectMismatch {
        /// Subject found in the access token (or its container claim).
        token: String,
        /// Subject returned by the user-info endpoint.
        user_info: String,
    },

    /// The key set has no key with this id.
    #[error("Unknown signing key: '{0}'")]
    KeyNotFound(String),

    /// Signature or standard-claim (`exp`, `nbf`) verification failed.
    #[error("JWT verification failed: {0}")]
    Signature(#[from] jsonwebtoken::errors::Error),

    /// `iss` differs from the configured issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// Encrypted envelope could not be opened.
    #[error("Token decryption failed: {0}")]
    Decryption(String),

    /// Network or HTTP failure talking to the provider.
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// The provider returned an OAuth2 error response.
    #[error("Provider error '{error}': {description}")]
    Provider {
        /// OAuth2 `error` code.
        error: String,
        /// OAuth2 `error_description`.
        description: String,
    },

    /// Callback `state` does not match a pending login.
    #[error("Invalid or expired login state")]
    InvalidState,

    /// ID token `nonce` does not match the pending login.
    #[error("ID token nonce mismatch")]
    NonceMismatch,

    /// The request names a provider that is not registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider lacks configuration this operation needs.
    #[error("Provider misconfigured: {0}")]
    Config(String),

    /// A validated login could not be persisted.
    #[error("Session storage failed: {0}")]
    Session(String),
}

impl AuthError {
    /// Whether the failure came from the network rather than the token.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote(e.to_string())
    }
}
