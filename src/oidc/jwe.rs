//! Encrypted (JWE) token envelopes.
//!
//! Some providers encrypt the access token to the relying party. The
//! unwrapper opens the compact five-segment form with the configured private
//! key and hands back either the nested signed JWT or, when the provider
//! encrypts claims directly, the decoded claims.
//!
//! Supported key management: `RSA-OAEP`, `RSA-OAEP-256` and direct `ECDH-ES`
//! on P-256 / P-384. Supported content encryption: `A128GCM`, `A256GCM`.
//! RSA keys must be PKCS#8; EC keys may be PKCS#8 or SEC1.

use std::path::Path;

use aws_lc_rs::{aead, agreement, rsa};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rustls::pki_types::{PrivateKeyDer, pem::PemObject};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{AuthError, TokenClaims, TokenShape};

/// Result of opening an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Unwrapped {
    /// A nested compact JWS that still needs signature verification.
    Signed(String),
    /// Claims the provider encrypted directly, with no inner signature.
    Claims(TokenClaims),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    P256,
    P384,
}

impl Curve {
    fn algorithm(self) -> &'static agreement::Algorithm {
        match self {
            Self::P256 => &agreement::ECDH_P256,
            Self::P384 => &agreement::ECDH_P384,
        }
    }

    fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    fn from_jwk(crv: &str) -> Option<Self> {
        match crv {
            "P-256" => Some(Self::P256),
            "P-384" => Some(Self::P384),
            _ => None,
        }
    }
}

// Raw DER is kept and parsed per call so the unwrapper stays plain data.
enum DecryptionKey {
    Rsa(Vec<u8>),
    Ec { curve: Curve, der: Vec<u8> },
}

/// Opens JWE envelopes with one private key.
pub struct EncryptedTokenUnwrapper {
    key: DecryptionKey,
}

impl std::fmt::Debug for EncryptedTokenUnwrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.key {
            DecryptionKey::Rsa(_) => "RSA",
            DecryptionKey::Ec { curve: Curve::P256, .. } => "EC P-256",
            DecryptionKey::Ec { curve: Curve::P384, .. } => "EC P-384",
        };
        f.debug_struct("EncryptedTokenUnwrapper")
            .field("key", &kind)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(default)]
    cty: Option<String>,
    #[serde(default)]
    epk: Option<EphemeralKey>,
}

#[derive(Debug, Deserialize)]
struct EphemeralKey {
    crv: String,
    x: String,
    y: String,
}

impl EncryptedTokenUnwrapper {
    /// Load a PEM private key from disk.
    pub fn from_pem_file(path: &Path) -> Result<Self, AuthError> {
        let pem = std::fs::read(path).map_err(|e| {
            AuthError::Config(format!(
                "cannot read decryption key {}: {e}",
                path.display()
            ))
        })?;
        Self::from_pem(&pem)
    }

    /// Parse a PEM private key (RSA PKCS#8, or EC PKCS#8 / SEC1).
    pub fn from_pem(pem: &[u8]) -> Result<Self, AuthError> {
        let der = PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| AuthError::Config(format!("invalid PEM private key: {e}")))?;

        let key = match der {
            PrivateKeyDer::Pkcs1(_) => {
                return Err(AuthError::Config(
                    "RSA decryption keys must be PKCS#8 (BEGIN PRIVATE KEY)".to_string(),
                ));
            }
            PrivateKeyDer::Pkcs8(ref k) if rsa::PrivateDecryptingKey::from_pkcs8(k.secret_pkcs8_der()).is_ok() => {
                DecryptionKey::Rsa(k.secret_pkcs8_der().to_vec())
            }
            other => {
                let bytes = other.secret_der();
                let curve = [Curve::P256, Curve::P384]
                    .into_iter()
                    .find(|c| agreement::PrivateKey::from_private_key_der(c.algorithm(), bytes).is_ok())
                    .ok_or_else(|| {
                        AuthError::Config(
                            "decryption key is neither RSA nor EC P-256/P-384".to_string(),
                        )
                    })?;
                DecryptionKey::Ec {
                    curve,
                    der: bytes.to_vec(),
                }
            }
        };
        Ok(Self { key })
    }

    /// Open a compact JWE.
    pub fn unwrap_token(&self, token: &str) -> Result<Unwrapped, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
            return Err(AuthError::MalformedToken(format!(
                "expected 5 JWE segments, found {}",
                parts.len()
            )));
        };

        let header: JweHeader = serde_json::from_slice(&b64(protected, "header")?)
            .map_err(|e| AuthError::MalformedToken(format!("invalid JWE header: {e}")))?;
        debug!(alg = %header.alg, enc = %header.enc, "Opening encrypted token");

        let cek_len = match header.enc.as_str() {
            "A128GCM" => 16,
            "A256GCM" => 32,
            other => {
                return Err(AuthError::Decryption(format!(
                    "unsupported content encryption '{other}'"
                )));
            }
        };

        let cek = match header.alg.as_str() {
            "RSA-OAEP" | "RSA-OAEP-256" => {
                self.unwrap_rsa_key(&header.alg, &b64(encrypted_key, "encrypted key")?)?
            }
            "ECDH-ES" => {
                if !encrypted_key.is_empty() {
                    return Err(AuthError::MalformedToken(
                        "ECDH-ES envelope carries an encrypted key".to_string(),
                    ));
                }
                self.agree_ecdh_es(&header, cek_len)?
            }
            other => {
                return Err(AuthError::Decryption(format!(
                    "unsupported key management '{other}'"
                )));
            }
        };
        if cek.len() != cek_len {
            return Err(AuthError::Decryption(format!(
                "content key is {} bytes, {} requires {cek_len}",
                cek.len(),
                header.enc
            )));
        }

        let mut in_out = b64(ciphertext, "ciphertext")?;
        in_out.extend_from_slice(&b64(tag, "tag")?);
        let plaintext = open_gcm(&cek, &b64(iv, "iv")?, protected.as_bytes(), &mut in_out)?;

        classify(plaintext, header.cty.as_deref())
    }

    fn unwrap_rsa_key(&self, alg: &str, encrypted_key: &[u8]) -> Result<Vec<u8>, AuthError> {
        let DecryptionKey::Rsa(der) = &self.key else {
            return Err(AuthError::Decryption(format!(
                "'{alg}' envelope but the configured key is not RSA"
            )));
        };
        let key = rsa::PrivateDecryptingKey::from_pkcs8(der)
            .map_err(|e| AuthError::Decryption(format!("RSA key rejected: {e}")))?;
        let key = rsa::OaepPrivateDecryptingKey::new(key)
            .map_err(|_| AuthError::Decryption("RSA key unusable for OAEP".to_string()))?;
        let algorithm = if alg == "RSA-OAEP" {
            &rsa::OAEP_SHA1_MGF1SHA1
        } else {
            &rsa::OAEP_SHA256_MGF1SHA256
        };

        let mut out = vec![0u8; key.key_size_bytes()];
        let cek = key
            .decrypt(algorithm, encrypted_key, &mut out, None)
            .map_err(|_| AuthError::Decryption("content key unwrap failed".to_string()))?;
        Ok(cek.to_vec())
    }

    fn agree_ecdh_es(&self, header: &JweHeader, cek_len: usize) -> Result<Vec<u8>, AuthError> {
        let DecryptionKey::Ec { curve, der } = &self.key else {
            return Err(AuthError::Decryption(
                "'ECDH-ES' envelope but the configured key is not EC".to_string(),
            ));
        };
        let epk = header
            .epk
            .as_ref()
            .ok_or_else(|| AuthError::MalformedToken("ECDH-ES header lacks 'epk'".to_string()))?;
        if Curve::from_jwk(&epk.crv) != Some(*curve) {
            return Err(AuthError::Decryption(format!(
                "ephemeral key curve '{}' does not match the configured key",
                epk.crv
            )));
        }

        let size = curve.coordinate_len();
        let mut point = Vec::with_capacity(1 + 2 * size);
        point.push(0x04);
        point.extend(left_pad(&b64(&epk.x, "epk.x")?, size)?);
        point.extend(left_pad(&b64(&epk.y, "epk.y")?, size)?);

        let private = agreement::PrivateKey::from_private_key_der(curve.algorithm(), der)
            .map_err(|e| AuthError::Decryption(format!("EC key rejected: {e}")))?;
        let peer = agreement::UnparsedPublicKey::new(curve.algorithm(), point);

        agreement::agree(
            &private,
            &peer,
            AuthError::Decryption("key agreement failed".to_string()),
            |z| Ok(concat_kdf(z, &header.enc, cek_len)),
        )
    }
}

/// Single-pass Concat KDF (NIST SP 800-56A) with SHA-256, empty PartyU/V info.
#[allow(clippy::cast_possible_truncation)]
fn concat_kdf(z: &[u8], enc: &str, key_len: usize) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(z);
    hasher.update((enc.len() as u32).to_be_bytes());
    hasher.update(enc.as_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(((key_len * 8) as u32).to_be_bytes());
    hasher.finalize()[..key_len].to_vec()
}

fn open_gcm(cek: &[u8], iv: &[u8], aad: &[u8], in_out: &mut Vec<u8>) -> Result<Vec<u8>, AuthError> {
    let algorithm = if cek.len() == 16 {
        &aead::AES_128_GCM
    } else {
        &aead::AES_256_GCM
    };
    let key = aead::UnboundKey::new(algorithm, cek)
        .map(aead::LessSafeKey::new)
        .map_err(|_| AuthError::Decryption("invalid content key".to_string()))?;
    let nonce = aead::Nonce::try_assume_unique_for_key(iv)
        .map_err(|_| AuthError::MalformedToken("JWE iv must be 96 bits".to_string()))?;
    let plaintext = key
        .open_in_place(nonce, aead::Aad::from(aad), in_out)
        .map_err(|_| AuthError::Decryption("authentication tag mismatch".to_string()))?;
    Ok(plaintext.to_vec())
}

fn classify(plaintext: Vec<u8>, cty: Option<&str>) -> Result<Unwrapped, AuthError> {
    let nested_jwt = cty.is_some_and(|c| c.eq_ignore_ascii_case("JWT"));
    let text = String::from_utf8(plaintext)
        .map_err(|_| AuthError::MalformedToken("decrypted payload is not UTF-8".to_string()))?;
    let text = text.trim();

    if nested_jwt || TokenShape::of(text) == TokenShape::Signed {
        if TokenShape::of(text) != TokenShape::Signed {
            return Err(AuthError::MalformedToken(
                "nested token is not a compact JWS".to_string(),
            ));
        }
        return Ok(Unwrapped::Signed(text.to_string()));
    }
    TokenClaims::from_json_slice(text.as_bytes()).map(Unwrapped::Claims)
}

fn left_pad(bytes: &[u8], size: usize) -> Result<Vec<u8>, AuthError> {
    if bytes.len() > size {
        return Err(AuthError::MalformedToken(
            "ephemeral key coordinate too long".to_string(),
        ));
    }
    let mut out = vec![0u8; size - bytes.len()];
    out.extend_from_slice(bytes);
    Ok(out)
}

fn b64(segment: &str, what: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::MalformedToken(format!("JWE {what} is not base64url: {e}")))
}
