//! Bearer token claim validators.
//!
//! Validators are pure checks over (configuration, access-token claims,
//! user-info claims). A [`ValidatorChain`] runs them in order and stops at
//! the first failure.

use tracing::{debug, warn};

use super::{AuthError, TokenClaims};
use crate::config::ValidatorKind;

/// A check run against decoded token claims.
pub trait TokenValidator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Pass (`Ok`) or reject with the reason.
    fn verify(&self, access: &TokenClaims, user_info: Option<&TokenClaims>) -> Result<(), AuthError>;
}

/// The token must be issued for this client.
///
/// Any one of these is sufficient: `aud` equals or contains the client id,
/// `appid` equals it, or `azp` (string or list) contains it.
#[derive(Debug, Clone)]
pub struct AudienceValidator {
    client_id: String,
}

impl AudienceValidator {
    /// Validator expecting `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

impl TokenValidator for AudienceValidator {
    fn name(&self) -> &'static str {
        "audience"
    }

    fn verify(&self, access: &TokenClaims, _user_info: Option<&TokenClaims>) -> Result<(), AuthError> {
        let expected = self.client_id.as_str();
        if access.contains("aud", expected)
            || access.get_str("appid") == Some(expected)
            || access.contains("azp", expected)
        {
            return Ok(());
        }

        warn!(
            expected_client_id = %expected,
            aud = ?access.get("aud"),
            appid = ?access.get("appid"),
            azp = ?access.get("azp"),
            "Token audience does not name this client"
        );
        Err(AuthError::AudienceMismatch {
            expected: self.client_id.clone(),
        })
    }
}

/// The access token and the user-info response must describe the same user.
///
/// Without user-info claims there is nothing to compare and the check passes.
#[derive(Debug, Clone, Default)]
pub struct SubjectValidator {
    container_claim: Option<String>,
}

impl SubjectValidator {
    /// Validator comparing `sub`, and `{container}.sub` when a container is set.
    #[must_use]
    pub fn new(container_claim: Option<String>) -> Self {
        Self { container_claim }
    }
}

impl TokenValidator for SubjectValidator {
    fn name(&self) -> &'static str {
        "subject"
    }

    fn verify(&self, access: &TokenClaims, user_info: Option<&TokenClaims>) -> Result<(), AuthError> {
        let Some(user_info) = user_info else {
            debug!("No user-info claims, subject check skipped");
            return Ok(());
        };

        let expected = user_info.subject();
        if expected.is_some() && access.subject() == expected {
            return Ok(());
        }
        if let Some(container) = self.container_claim.as_deref() {
            if expected.is_some() && access.nested_subject(container) == expected {
                return Ok(());
            }
        }

        let token = self
            .container_claim
            .as_deref()
            .and_then(|c| access.nested_subject(c))
            .or_else(|| access.subject())
            .unwrap_or_default()
            .to_string();
        let user_info = expected.unwrap_or_default().to_string();
        warn!(token_sub = %token, user_info_sub = %user_info, "Token subject does not match user-info subject");
        Err(AuthError::SubjectMismatch { token, user_info })
    }
}

/// Ordered validators; all must pass.
#[derive(Default)]
pub struct ValidatorChain {
    validators: Vec<Box<dyn TokenValidator>>,
}

impl ValidatorChain {
    /// Chain over explicit validators.
    #[must_use]
    pub fn new(validators: Vec<Box<dyn TokenValidator>>) -> Self {
        Self { validators }
    }

    /// Build the configured chain for one provider.
    #[must_use]
    pub fn from_kinds(kinds: &[ValidatorKind], client_id: &str, container_claim: Option<&str>) -> Self {
        let validators = kinds
            .iter()
            .map(|kind| -> Box<dyn TokenValidator> {
                match kind {
                    ValidatorKind::Audience => Box::new(AudienceValidator::new(client_id)),
                    ValidatorKind::Subject => {
                        Box::new(SubjectValidator::new(container_claim.map(str::to_string)))
                    }
                }
            })
            .collect();
        Self { validators }
    }

    /// Number of validators in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the chain is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl TokenValidator for ValidatorChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn verify(&self, access: &TokenClaims, user_info: Option<&TokenClaims>) -> Result<(), AuthError> {
        for validator in &self.validators {
            validator.verify(access, user_info).inspect_err(|e| {
                debug!(validator = validator.name(), error = %e, "Validator rejected token");
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.validators.iter().map(|v| v.name()))
            .finish()
    }
}
