//! Per-provider authentication: bearer validation and the login flow.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use super::grant::{GrantChain, TokenResponse};
use super::userinfo;
use super::ProviderConfig;
use crate::cache::AuthenticationCache;
use crate::config::{ClientAuthStrategy, GrantKind};
use crate::gateway::context::{AuthRequest, AuthenticationResult, Principal};
use crate::oidc::{
    AuthError, EncryptedTokenUnwrapper, KeySetCache, KeySetFetcher, TokenClaims, TokenShape,
    TokenValidator, Unwrapped, ValidatorChain,
};
use crate::Error;

/// How long a login started with [`ProviderAuthenticator::begin_login`] stays valid.
pub const PENDING_LOGIN_TTL: Duration = Duration::from_secs(600);

/// Logins awaiting their callback, per provider. The oldest is dropped first.
pub const MAX_PENDING_LOGINS: NonZeroUsize = NonZeroUsize::new(4096).unwrap();

/// Signature algorithms accepted on provider-issued tokens.
const RSA_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// A finished authorization-code login.
#[derive(Debug, Clone)]
pub struct LoginCompletion {
    /// The validated result
    pub result: AuthenticationResult,
    /// Where the browser wanted to go before login
    pub return_to: Option<String>,
}

/// Authentication against one identity provider.
///
/// Implementations are stateless across requests apart from pending logins;
/// per-request state lives in the [`AuthRequest`].
#[async_trait]
pub trait ProviderAuthenticator: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Provider configuration.
    fn config(&self) -> &ProviderConfig;

    /// Validate the request's bearer token and, on success, set the principal.
    async fn authenticate_bearer(&self, request: &mut AuthRequest) -> Result<AuthenticationResult, AuthError>;

    /// Build the authorize URL and remember the pending login.
    fn begin_login(&self, return_to: Option<&str>) -> Result<String, AuthError>;

    /// Handle the provider's callback and set the principal.
    async fn complete_login(&self, request: &mut AuthRequest) -> Result<LoginCompletion, AuthError>;

    /// Exchange a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;

    /// Revoke a token at the provider.
    async fn revoke(&self, token: &str) -> Result<(), AuthError>;

    /// Default handling for an unauthenticated request: a redirect location, if any.
    fn default_entry(&self, request: &AuthRequest) -> Result<Option<String>, AuthError> {
        let config = self.config();
        if config.auto_redirect && config.has_grant(GrantKind::AuthorizationCode) {
            self.begin_login(Some(&request.path)).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Shared collaborators handed to every authenticator.
#[derive(Clone)]
pub struct AuthenticatorDeps {
    /// HTTP client for token, user-info and group calls
    pub http: reqwest::Client,
    /// Shared authentication cache
    pub cache: Arc<AuthenticationCache>,
    /// Key-set fetcher
    pub key_fetcher: Arc<dyn KeySetFetcher>,
}

struct PendingLogin {
    code_verifier: Option<String>,
    nonce: String,
    return_to: Option<String>,
    created: Instant,
}

/// Standard OIDC authenticator.
pub struct OidcAuthenticator {
    config: Arc<ProviderConfig>,
    keys: KeySetCache,
    validators: ValidatorChain,
    unwrapper: Option<EncryptedTokenUnwrapper>,
    cache: Arc<AuthenticationCache>,
    grants: GrantChain,
    http: reqwest::Client,
    pending: Mutex<LruCache<String, PendingLogin>>,
}

impl OidcAuthenticator {
    /// Build the authenticator; fails if the decryption key cannot be loaded.
    pub fn new(config: ProviderConfig, deps: &AuthenticatorDeps) -> crate::Result<Self> {
        let unwrapper = match &config.decryption_key {
            Some(path) => Some(
                EncryptedTokenUnwrapper::from_pem_file(path)
                    .map_err(|e| Error::provider_config(&config.name, e.to_string()))?,
            ),
            None => None,
        };
        let validators = ValidatorChain::from_kinds(
            &config.validators,
            &config.client_id,
            config.subject_container_claim.as_deref(),
        );
        let keys = KeySetCache::new(&config.name, &config.jwks_uri, Arc::clone(&deps.key_fetcher));
        let config = Arc::new(config);

        Ok(Self {
            grants: GrantChain::new(Arc::clone(&config), deps.http.clone()),
            config,
            keys,
            validators,
            unwrapper,
            cache: Arc::clone(&deps.cache),
            http: deps.http.clone(),
            pending: Mutex::new(LruCache::new(MAX_PENDING_LOGINS)),
        })
    }

    /// The provider's key-set cache.
    #[must_use]
    pub fn key_set(&self) -> &KeySetCache {
        &self.keys
    }

    /// Number of logins awaiting their callback.
    #[must_use]
    pub fn pending_logins(&self) -> usize {
        self.pending.lock().len()
    }

    /// Decrypt (if needed) and verify a token, returning its trusted claims.
    async fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        match TokenShape::of(token) {
            TokenShape::Signed => self.verify_signed(token).await,
            TokenShape::Encrypted => {
                let unwrapper = self.unwrapper.as_ref().ok_or_else(|| {
                    AuthError::Decryption("encrypted token but no decryption key configured".to_string())
                })?;
                match unwrapper.unwrap_token(token)? {
                    Unwrapped::Signed(inner) => self.verify_signed(&inner).await,
                    Unwrapped::Claims(claims) if self.config.trust_encrypted_claims => {
                        self.check_lifetime(&claims)?;
                        self.check_issuer(&claims)?;
                        Ok(claims)
                    }
                    Unwrapped::Claims(_) => Err(AuthError::Decryption(
                        "encrypted token carries unsigned claims".to_string(),
                    )),
                }
            }
            TokenShape::Opaque => Err(AuthError::MalformedToken("token is not a JWT".to_string())),
        }
    }

    async fn verify_signed(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::MalformedToken(format!("invalid JWT header: {e}")))?;
        if !RSA_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::MalformedToken(format!(
                "unsupported signature algorithm {:?}",
                header.alg
            )));
        }

        let kid = header.kid.as_deref();
        let key = self
            .keys
            .get_key(kid)
            .await
            .ok_or_else(|| AuthError::KeyNotFound(kid.unwrap_or_default().to_string()))?;
        if let Some(declared) = key.alg.as_deref() {
            if declared.parse::<Algorithm>().ok() != Some(header.alg) {
                return Err(AuthError::MalformedToken(format!(
                    "token algorithm {:?} does not match key '{}' ({declared})",
                    header.alg, key.kid
                )));
            }
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.leeway.as_secs();
        validation.validate_aud = false;
        validation.validate_nbf = true;

        let data = jsonwebtoken::decode::<TokenClaims>(token, &key.key, &validation)?;
        self.check_issuer(&data.claims)?;
        debug!(provider = %self.config.name, kid = %key.kid, "Token signature verified");
        Ok(data.claims)
    }

    /// `exp` and `nbf` for claims that never went through a JWS check.
    fn check_lifetime(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        let now = jsonwebtoken::get_current_timestamp();
        let leeway = self.config.leeway.as_secs();
        let exp = claims
            .expires_at()
            .ok_or_else(|| AuthError::Signature(ErrorKind::MissingRequiredClaim("exp".to_string()).into()))?;
        if exp.saturating_add(leeway) < now {
            return Err(AuthError::Signature(ErrorKind::ExpiredSignature.into()));
        }
        if claims.not_before().is_some_and(|nbf| nbf > now.saturating_add(leeway)) {
            return Err(AuthError::Signature(ErrorKind::ImmatureSignature.into()));
        }
        Ok(())
    }

    fn check_issuer(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        let Some(expected) = self.config.issuer.as_deref() else {
            return Ok(());
        };
        let actual = claims.issuer().unwrap_or_default();
        if actual.trim_end_matches('/') == expected.trim_end_matches('/') {
            Ok(())
        } else {
            Err(AuthError::IssuerMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// User-info, groups, validator chain and principal for verified claims.
    async fn establish(
        &self,
        access_token: &str,
        claims: TokenClaims,
        tokens: Option<&TokenResponse>,
    ) -> Result<AuthenticationResult, AuthError> {
        let user_info = match (&self.config.user_info_uri, self.config.fetch_user_info) {
            (Some(uri), true) => Some(userinfo::fetch_user_info(&self.http, uri, access_token).await?),
            _ => None,
        };

        self.validators.verify(&claims, user_info.as_ref())?;

        let mut groups = self
            .config
            .groups_claim
            .as_deref()
            .map(|c| claims.string_or_list(c))
            .unwrap_or_default();
        if let Some(groups_uri) = &self.config.groups_uri {
            for group in userinfo::fetch_groups(&self.http, groups_uri, access_token).await? {
                if !groups.contains(&group) {
                    groups.push(group);
                }
            }
        }
        let roles = self
            .config
            .roles_claim
            .as_deref()
            .map(|c| claims.string_or_list(c))
            .unwrap_or_default();

        let name = claims
            .get_str(&self.config.principal_claim)
            .or_else(|| user_info.as_ref().and_then(|u| u.get_str(&self.config.principal_claim)))
            .or_else(|| claims.subject())
            .ok_or_else(|| {
                AuthError::MalformedToken(format!(
                    "token has neither '{}' nor 'sub'",
                    self.config.principal_claim
                ))
            })?
            .to_string();

        Ok(AuthenticationResult {
            principal: Principal {
                name,
                roles,
                groups,
                claims,
            },
            provider: self.config.name.clone(),
            access_token: access_token.to_string(),
            id_token: tokens.and_then(|t| t.id_token.clone()),
            refresh_token: tokens.and_then(|t| t.refresh_token.clone()),
        })
    }

    /// Remove and return the pending login for `state`.
    fn take_pending(&self, state: &str) -> Result<PendingLogin, AuthError> {
        let mut logins = self.pending.lock();
        let key = logins
            .iter()
            .find(|(key, _)| bool::from(key.as_bytes().ct_eq(state.as_bytes())))
            .map(|(key, _)| key.clone())
            .ok_or(AuthError::InvalidState)?;
        let pending = logins.pop(&key).ok_or(AuthError::InvalidState)?;
        drop(logins);
        if pending.created.elapsed() > PENDING_LOGIN_TTL {
            return Err(AuthError::InvalidState);
        }
        Ok(pending)
    }
}

#[async_trait]
impl ProviderAuthenticator for OidcAuthenticator {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn authenticate_bearer(&self, request: &mut AuthRequest) -> Result<AuthenticationResult, AuthError> {
        let provider = self.config.name.as_str();
        if !self.config.allow_bearer_tokens {
            return Err(AuthError::BearerNotAllowed(provider.to_string()));
        }
        let token = request.resolve_token().ok_or(AuthError::MissingToken)?.to_string();
        request.security.begin_attempt(provider);

        if let Some(cached) = self.cache.get(&token).filter(|r| r.provider == provider) {
            debug!(provider, principal = %cached.principal.name, "Bearer token served from cache");
            request.security.set_authenticated(cached.clone());
            return Ok(cached);
        }

        let claims = self.verify_token(&token).await?;
        let result = self.establish(&token, claims, None).await?;

        self.cache.put(&token, result.clone());
        info!(provider, principal = %result.principal.name, "Bearer token accepted");
        request.security.set_authenticated(result.clone());
        Ok(result)
    }

    fn begin_login(&self, return_to: Option<&str>) -> Result<String, AuthError> {
        let authorize = self.config.authorization_uri.as_deref().ok_or_else(|| {
            AuthError::Config(format!("provider '{}' has no authorization_uri", self.config.name))
        })?;
        let mut url = Url::parse(authorize)
            .map_err(|e| AuthError::Config(format!("invalid authorization_uri: {e}")))?;

        let state = random_token();
        let nonce = random_token();
        let pkce = (self.config.client_auth == ClientAuthStrategy::Pkce).then(generate_pkce);
        let response_type = if self.config.has_grant(GrantKind::AuthorizationCode) {
            "code"
        } else {
            "token"
        };

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", response_type)
                .append_pair("client_id", &self.config.client_id)
                .append_pair("scope", &self.config.scopes.join(" "))
                .append_pair("state", &state)
                .append_pair("nonce", &nonce);
            if let Some(redirect_uri) = &self.config.redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
            if let Some((_, challenge)) = &pkce {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }

        let displaced = self.pending.lock().push(
            state,
            PendingLogin {
                code_verifier: pkce.map(|(verifier, _)| verifier),
                nonce,
                return_to: return_to.map(str::to_string),
                created: Instant::now(),
            },
        );
        if displaced.is_some() {
            debug!(provider = %self.config.name, "Pending logins full, oldest dropped");
        }
        debug!(provider = %self.config.name, "Login started");
        Ok(url.into())
    }

    async fn complete_login(&self, request: &mut AuthRequest) -> Result<LoginCompletion, AuthError> {
        if let Some(error) = request.param("error") {
            return Err(AuthError::Provider {
                error: error.to_string(),
                description: request.param("error_description").unwrap_or_default().to_string(),
            });
        }
        let state = request.param("state").ok_or(AuthError::InvalidState)?;
        let pending = self.take_pending(state)?;
        request.security.begin_attempt(&self.config.name);

        let tokens = self
            .grants
            .complete(&request.params, pending.code_verifier.as_deref())
            .await?;

        if let Some(id_token) = &tokens.id_token {
            let id_claims = self.verify_token(id_token).await?;
            if let Some(nonce) = id_claims.get_str("nonce") {
                if !bool::from(nonce.as_bytes().ct_eq(pending.nonce.as_bytes())) {
                    warn!(provider = %self.config.name, "ID token nonce does not match login");
                    return Err(AuthError::NonceMismatch);
                }
            }
        }

        let claims = self.verify_token(&tokens.access_token).await?;
        let result = self.establish(&tokens.access_token, claims, Some(&tokens)).await?;

        self.cache.put(&tokens.access_token, result.clone());
        info!(provider = %self.config.name, principal = %result.principal.name, "Login completed");
        request.security.set_authenticated(result.clone());
        Ok(LoginCompletion {
            result,
            return_to: pending.return_to,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        self.grants.refresh(refresh_token).await
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        self.grants.revoke(token, "access_token").await
    }
}

/// Generate PKCE code verifier and challenge
fn generate_pkce() -> (String, String) {
    let verifier = random_token();
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderDescriptor;
    use crate::gateway::context::FRAMEWORK_TOKEN_ATTRIBUTE;
    use jsonwebtoken::{EncodingKey, Header};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SIGNING_KEY: &[u8] = include_bytes!("../../tests/fixtures/rsa_signing.pem");
    const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");
    const SIGNED: &str = include_str!("../../tests/fixtures/signed_token.txt");
    const EC_JWE: &str = include_str!("../../tests/fixtures/ecdh_es_jwe.txt");
    const EC_JWE_EXPIRED: &str = include_str!("../../tests/fixtures/ecdh_es_expired_jwe.txt");

    struct FixtureFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KeySetFetcher for FixtureFetcher {
        async fn fetch(&self, _jwks_uri: &str) -> Result<Value, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_str(JWKS).unwrap())
        }
    }

    fn sign(claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-key-1".to_string());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap()).unwrap()
    }

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            name: "corp".into(),
            client_id: "my-client-id".into(),
            issuer: Some("https://idp.example.com".into()),
            authorization_uri: Some("https://idp.example.com/authorize".into()),
            token_uri: Some("http://127.0.0.1:9/token".into()),
            jwks_uri: Some("https://idp.example.com/keys".into()),
            redirect_uri: Some("https://app/openid/corp/callback".into()),
            roles_claim: Some("roles".into()),
            groups_claim: Some("groups".into()),
            ..ProviderDescriptor::default()
        }
    }

    fn authenticator(d: ProviderDescriptor) -> (OidcAuthenticator, Arc<AuthenticationCache>) {
        let cache = Arc::new(AuthenticationCache::new(
            NonZeroUsize::new(16).unwrap(),
            Duration::from_secs(60),
        ));
        let deps = AuthenticatorDeps {
            http: reqwest::Client::new(),
            cache: Arc::clone(&cache),
            key_fetcher: Arc::new(FixtureFetcher { calls: AtomicUsize::new(0) }),
        };
        let config = ProviderConfig::from_descriptor(&d).unwrap();
        (OidcAuthenticator::new(config, &deps).unwrap(), cache)
    }

    fn bearer_request(token: &str) -> AuthRequest {
        let mut request = AuthRequest::new("/api");
        request.set_attribute(FRAMEWORK_TOKEN_ATTRIBUTE, token);
        request
    }

    #[tokio::test]
    async fn bearer_fixture_token_is_accepted() {
        let (auth, cache) = authenticator(descriptor());
        let mut request = bearer_request(SIGNED.trim());

        let result = auth.authenticate_bearer(&mut request).await.unwrap();
        assert_eq!(result.principal.name, "alice");
        assert_eq!(result.principal.roles, vec!["admin", "reader"]);
        assert_eq!(result.principal.groups, vec!["engineering"]);
        assert_eq!(result.provider, "corp");
        assert!(request.security.is_authenticated());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (auth, cache) = authenticator(descriptor());
        auth.authenticate_bearer(&mut bearer_request(SIGNED.trim())).await.unwrap();
        auth.authenticate_bearer(&mut bearer_request(SIGNED.trim())).await.unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(auth.key_set().fetch_count(), 1);
    }

    #[tokio::test]
    async fn bearer_disallowed_is_rejected() {
        let (auth, _) = authenticator(ProviderDescriptor {
            allow_bearer_tokens: false,
            ..descriptor()
        });
        let err = auth.authenticate_bearer(&mut bearer_request(SIGNED.trim())).await.unwrap_err();
        assert!(matches!(err, AuthError::BearerNotAllowed(p) if p == "corp"));
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let (auth, _) = authenticator(descriptor());
        let err = auth.authenticate_bearer(&mut AuthRequest::new("/")).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
    }

    #[tokio::test]
    async fn audience_failure_fails_attempt_and_is_not_cached() {
        let (auth, cache) = authenticator(descriptor());
        let token = sign(&json!({
            "iss": "https://idp.example.com", "sub": "alice",
            "aud": ["other-app"], "exp": 4_102_444_800u64
        }));
        let err = auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap_err();
        assert!(matches!(err, AuthError::AudienceMismatch { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn azp_match_is_accepted() {
        let (auth, _) = authenticator(descriptor());
        let token = sign(&json!({
            "iss": "https://idp.example.com", "sub": "svc",
            "aud": ["other-app"], "azp": "my-client-id", "exp": 4_102_444_800u64
        }));
        let result = auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap();
        assert_eq!(result.principal.name, "svc");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (auth, _) = authenticator(descriptor());
        let token = sign(&json!({
            "iss": "https://idp.example.com", "sub": "alice",
            "aud": "my-client-id", "exp": 1_000_000_000u64
        }));
        let err = auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap_err();
        assert!(matches!(err, AuthError::Signature(_)));
    }

    #[tokio::test]
    async fn cached_result_ends_at_token_expiry() {
        let (auth, cache) = authenticator(ProviderDescriptor {
            leeway: Duration::ZERO,
            ..descriptor()
        });
        let exp = jsonwebtoken::get_current_timestamp() + 2;
        let token = sign(&json!({
            "iss": "https://idp.example.com", "sub": "alice",
            "aud": "my-client-id", "exp": exp
        }));
        auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut request = bearer_request(&token);
        let err = auth.authenticate_bearer(&mut request).await.unwrap_err();
        assert!(matches!(err, AuthError::Signature(_)));
        assert!(!request.security.is_authenticated());
        assert_eq!(cache.stats().hits, 0);
    }

    fn encrypted_claims_descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            decryption_key: Some(
                std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ec_decryption.pem"),
            ),
            trust_encrypted_claims: true,
            ..descriptor()
        }
    }

    #[tokio::test]
    async fn encrypted_claims_are_accepted_when_trusted() {
        let (auth, cache) = authenticator(encrypted_claims_descriptor());
        let result = auth
            .authenticate_bearer(&mut bearer_request(EC_JWE.trim()))
            .await
            .unwrap();
        assert_eq!(result.principal.name, "bob");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn expired_encrypted_claims_are_rejected() {
        let (auth, cache) = authenticator(encrypted_claims_descriptor());
        let err = auth
            .authenticate_bearer(&mut bearer_request(EC_JWE_EXPIRED.trim()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Signature(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn encrypted_claims_without_trust_are_rejected() {
        let (auth, _) = authenticator(ProviderDescriptor {
            trust_encrypted_claims: false,
            ..encrypted_claims_descriptor()
        });
        let err = auth
            .authenticate_bearer(&mut bearer_request(EC_JWE.trim()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Decryption(_)));
    }

    #[tokio::test]
    async fn issuer_mismatch_is_rejected() {
        let (auth, _) = authenticator(descriptor());
        let token = sign(&json!({
            "iss": "https://evil.example.com", "sub": "alice",
            "aud": "my-client-id", "exp": 4_102_444_800u64
        }));
        let err = auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap_err();
        assert!(matches!(err, AuthError::IssuerMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_kid_is_key_not_found() {
        let (auth, _) = authenticator(descriptor());
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("rotated-away".to_string());
        let token = jsonwebtoken::encode(
            &header,
            &json!({"sub": "alice", "exp": 4_102_444_800u64}),
            &EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap(),
        )
        .unwrap();
        let err = auth.authenticate_bearer(&mut bearer_request(&token)).await.unwrap_err();
        assert!(matches!(err, AuthError::KeyNotFound(kid) if kid == "rotated-away"));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let (auth, _) = authenticator(descriptor());
        let forged_payload = URL_SAFE_NO_PAD.encode(
            json!({"iss": "https://idp.example.com", "sub": "mallory", "aud": "my-client-id", "exp": 4_102_444_800u64})
                .to_string(),
        );
        let mut parts: Vec<&str> = SIGNED.trim().split('.').collect();
        parts[1] = &forged_payload;
        let err = auth
            .authenticate_bearer(&mut bearer_request(&parts.join(".")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Signature(_)));
    }

    #[tokio::test]
    async fn opaque_token_is_malformed() {
        let (auth, _) = authenticator(descriptor());
        let err = auth.authenticate_bearer(&mut bearer_request("opaque-ref")).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken(_)));
    }

    #[test]
    fn begin_login_builds_pkce_authorize_url() {
        let (auth, _) = authenticator(descriptor());
        let location = auth.begin_login(Some("/dashboard")).unwrap();
        let url = Url::parse(&location).unwrap();
        let q: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/authorize");
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "my-client-id");
        assert_eq!(q["scope"], "openid profile email");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["redirect_uri"], "https://app/openid/corp/callback");
        assert!(q.contains_key("state") && q.contains_key("nonce"));
        assert_eq!(auth.pending_logins(), 1);
    }

    fn state_of(location: &str) -> String {
        Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn pending_logins_are_bounded() {
        let (auth, _) = authenticator(descriptor());
        let first = state_of(&auth.begin_login(None).unwrap());
        for _ in 0..MAX_PENDING_LOGINS.get() + 10 {
            auth.begin_login(Some("/")).unwrap();
        }
        assert_eq!(auth.pending_logins(), MAX_PENDING_LOGINS.get());

        // the oldest login was dropped to make room
        let mut request = AuthRequest::new("/openid/corp/callback").with_query(&format!("code=abc&state={first}"));
        assert!(matches!(
            auth.complete_login(&mut request).await,
            Err(AuthError::InvalidState)
        ));
    }

    #[test]
    fn public_client_login_has_no_challenge() {
        let (auth, _) = authenticator(ProviderDescriptor {
            client_auth: ClientAuthStrategy::Public,
            ..descriptor()
        });
        let location = auth.begin_login(None).unwrap();
        assert!(!location.contains("code_challenge"));
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let (auth, _) = authenticator(descriptor());
        auth.begin_login(None).unwrap();
        let mut request = AuthRequest::new("/openid/corp/callback").with_query("code=abc&state=forged");
        assert!(matches!(
            auth.complete_login(&mut request).await,
            Err(AuthError::InvalidState)
        ));
        assert!(!request.security.is_authenticated());
    }

    #[tokio::test]
    async fn callback_error_param_is_provider_error() {
        let (auth, _) = authenticator(descriptor());
        let mut request = AuthRequest::new("/openid/corp/callback")
            .with_query("error=access_denied&error_description=user%20cancelled");
        match auth.complete_login(&mut request).await {
            Err(AuthError::Provider { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description, "user cancelled");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn implicit_callback_validates_access_token() {
        let (auth, _) = authenticator(ProviderDescriptor {
            grants: vec![GrantKind::Implicit],
            client_auth: ClientAuthStrategy::Public,
            ..descriptor()
        });
        let location = auth.begin_login(Some("/home")).unwrap();
        let state = Url::parse(&location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let mut request = AuthRequest::new("/openid/corp/callback")
            .with_query(&format!("state={state}&access_token={}", SIGNED.trim()));
        let completion = auth.complete_login(&mut request).await.unwrap();
        assert_eq!(completion.result.principal.name, "alice");
        assert_eq!(completion.return_to.as_deref(), Some("/home"));
        assert!(request.security.is_authenticated());

        // state is single use
        let mut replay = AuthRequest::new("/openid/corp/callback")
            .with_query(&format!("state={state}&access_token={}", SIGNED.trim()));
        assert!(matches!(
            auth.complete_login(&mut replay).await,
            Err(AuthError::InvalidState)
        ));
    }

    #[test]
    fn default_entry_redirects_only_when_configured() {
        let (auth, _) = authenticator(descriptor());
        assert_eq!(auth.default_entry(&AuthRequest::new("/")).unwrap(), None);

        let (auth, _) = authenticator(ProviderDescriptor {
            auto_redirect: true,
            ..descriptor()
        });
        let location = auth.default_entry(&AuthRequest::new("/")).unwrap().unwrap();
        assert!(location.starts_with("https://idp.example.com/authorize?"));
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        assert_eq!(challenge, URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())));
        assert_ne!(generate_pkce().0, verifier);
    }
}
