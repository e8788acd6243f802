//! Token claims and unverified JWT decoding.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::AuthError;

/// Claims decoded from a token payload or a user-info response.
///
/// Decoding implies no trust: signature and validator checks run separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenClaims(Map<String, Value>);

impl TokenClaims {
    /// Wrap an already-parsed JSON object.
    #[must_use]
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Parse a JSON object; anything else is a malformed token.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(_) => Err(AuthError::MalformedToken(
                "claims are not a JSON object".to_string(),
            )),
            Err(e) => Err(AuthError::MalformedToken(format!("invalid claims JSON: {e}"))),
        }
    }

    /// Decode the payload segment of a compact JWS without verifying it.
    pub fn decode_unverified(token: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::MalformedToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }
        let payload = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {e}")))?;
        Self::from_json_slice(&payload)
    }

    /// Raw claim value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Claim value when it is a string.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.get_str("sub")
    }

    /// The `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.get_str("iss")
    }

    /// The `exp` claim, in seconds since the epoch.
    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        self.numeric("exp")
    }

    /// The `nbf` claim, in seconds since the epoch.
    #[must_use]
    pub fn not_before(&self) -> Option<u64> {
        self.numeric("nbf")
    }

    /// Time left until `exp`; zero once it has passed, `None` without `exp`.
    #[must_use]
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        let now = jsonwebtoken::get_current_timestamp();
        self.expires_at()
            .map(|exp| Duration::from_secs(exp.saturating_sub(now)))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn numeric(&self, name: &str) -> Option<u64> {
        let value = self.0.get(name)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }

    /// `sub` nested under a container claim, e.g. `{"ext": {"sub": "..."}}`.
    #[must_use]
    pub fn nested_subject(&self, container: &str) -> Option<&str> {
        self.0
            .get(container)
            .and_then(|c| c.get("sub"))
            .and_then(Value::as_str)
    }

    /// A claim that may be a single string or a list of strings.
    #[must_use]
    pub fn string_or_list(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(arr)) => arr
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether a string-or-list claim contains `expected`.
    #[must_use]
    pub fn contains(&self, name: &str, expected: &str) -> bool {
        match self.0.get(name) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(expected)),
            _ => false,
        }
    }

    /// Borrow the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for TokenClaims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Compact serialization shape of a token string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    /// Three segments: a signed JWT.
    Signed,
    /// Five segments: an encrypted JWE envelope.
    Encrypted,
    /// Anything else (opaque reference token or garbage).
    Opaque,
}

impl TokenShape {
    /// Classify a token by counting its dot-separated segments.
    #[must_use]
    pub fn of(token: &str) -> Self {
        match token.split('.').count() {
            3 => Self::Signed,
            5 => Self::Encrypted,
            _ => Self::Opaque,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(v: Value) -> TokenClaims {
        match v {
            Value::Object(map) => TokenClaims::new(map),
            _ => unreachable!(),
        }
    }

    fn unsigned_jwt(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.")
    }

    #[test]
    fn lifetime_claims() {
        let now = jsonwebtoken::get_current_timestamp();
        let c = claims(json!({"exp": now + 120, "nbf": 1_000.5}));
        assert_eq!(c.not_before(), Some(1_000));
        let left = c.remaining_lifetime().unwrap();
        assert!(left > Duration::from_secs(100) && left <= Duration::from_secs(120));

        let expired = claims(json!({"exp": 1_000_000_000u64}));
        assert_eq!(expired.remaining_lifetime(), Some(Duration::ZERO));
        assert_eq!(claims(json!({"exp": "soon"})).expires_at(), None);
        assert_eq!(TokenClaims::default().remaining_lifetime(), None);
    }

    #[test]
    fn decode_unverified_reads_payload() {
        let token = unsigned_jwt(&json!({"sub": "alice", "iss": "https://idp"}));
        let c = TokenClaims::decode_unverified(&token).unwrap();
        assert_eq!(c.subject(), Some("alice"));
        assert_eq!(c.issuer(), Some("https://idp"));
    }

    #[test]
    fn decode_unverified_rejects_wrong_segment_count() {
        assert!(matches!(
            TokenClaims::decode_unverified("a.b"),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn decode_unverified_rejects_non_object_payload() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let body = URL_SAFE_NO_PAD.encode(b"[1,2]");
        let token = format!("{header}.{body}.sig");
        assert!(TokenClaims::decode_unverified(&token).is_err());
    }

    #[test]
    fn string_or_list_accepts_both_forms() {
        let c = claims(json!({"roles": "admin", "groups": ["a", "b", 3]}));
        assert_eq!(c.string_or_list("roles"), vec!["admin"]);
        assert_eq!(c.string_or_list("groups"), vec!["a", "b"]);
        assert!(c.string_or_list("missing").is_empty());
    }

    #[test]
    fn nested_subject_reads_container() {
        let c = claims(json!({"ext": {"sub": "xyz"}}));
        assert_eq!(c.nested_subject("ext"), Some("xyz"));
        assert_eq!(c.nested_subject("other"), None);
    }

    #[test]
    fn token_shape_by_segment_count() {
        assert_eq!(TokenShape::of("a.b.c"), TokenShape::Signed);
        assert_eq!(TokenShape::of("a.b.c.d.e"), TokenShape::Encrypted);
        assert_eq!(TokenShape::of("opaque"), TokenShape::Opaque);
        assert_eq!(TokenShape::of("a..c.d.e"), TokenShape::Encrypted);
    }
}
