//! # Session Tokens
//!
//! Stateless bearer credentials minted by the web app and verified here.
//!
//! ## Wire Format:
//! ```text
//! base64url(payload_json) "." base64url(HMAC-SHA256(payload_json, secret))
//! ```
//! with `payload_json = {"expiresAtMs": 1700000000000, "userId": "u_1", "nonce": "…"}`.
//!
//! Validity is a function of the signature and `expiresAtMs` only. The nonce
//! is checked separately by [`super::nonce::NonceCache`] when replay
//! protection is enabled.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub expires_at_ms: i64,
    pub user_id: String,
    pub nonce: String,
}

/// Why a token was refused. All variants map to HTTP 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Missing separator, bad base64 or a payload that is not the claims JSON
    Malformed,
    /// Signature does not match the payload
    BadSignature,
    /// `expiresAtMs` is in the past
    Expired,
    /// Nonce already presented by an earlier connection
    Replayed,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "malformed session token"),
            TokenError::BadSignature => write!(f, "invalid session token signature"),
            TokenError::Expired => write!(f, "session token expired"),
            TokenError::Replayed => write!(f, "session token already used"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Signs and verifies session tokens with the shared HMAC secret.
///
/// The keyed MAC is built once and cloned per operation.
#[derive(Clone)]
pub struct TokenVerifier {
    mac: HmacSha256,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> anyhow::Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow::anyhow!("Invalid session secret: {}", e))?;
        Ok(Self { mac })
    }

    /// Mint a token for `claims`. The relay never issues tokens itself; this
    /// exists for tooling and tests that stand in for the web app.
    pub fn sign(&self, claims: &SessionClaims) -> Result<String, serde_json::Error> {
        let payload = serde_json::to_vec(claims)?;
        let mut mac = self.mac.clone();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verify `token` and return its claims.
    ///
    /// The signature is checked before the payload is parsed, using the
    /// constant-time comparison of [`Mac::verify_slice`]. A token whose
    /// `expiresAtMs` equals `now_ms` is still accepted.
    pub fn verify(&self, token: &str, now_ms: i64) -> Result<SessionClaims, TokenError> {
        let (payload_part, signature_part) = token.split_once('.').ok_or(TokenError::Malformed)?;
        if payload_part.is_empty() || signature_part.is_empty() || signature_part.contains('.') {
            return Err(TokenError::Malformed);
        }

        let payload = decode_segment(payload_part)?;
        let signature = decode_segment(signature_part)?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if claims.expires_at_ms < now_ms {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

/// Issuers differ on whether base64url keeps its `=` padding.
fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| TokenError::Malformed)
}
