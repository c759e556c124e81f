//! # Connection Admission
//!
//! Every WebSocket upgrade on `/ws` passes through [`AdmissionPolicy::admit`]
//! before a socket is opened. Failures become plain HTTP responses.
//!
//! ## Checks (in order):
//! 1. **Origin**: present but not allow-listed → 403
//! 2. **Rate limit**: too many attempts from this IP in the window → 429
//! 3. **Session token**: missing, malformed, badly signed, expired or replayed → 401
//!
//! `admit` only looks the nonce up. The upgrade handler calls
//! [`AdmissionPolicy::claim_nonce`] after the handshake has been accepted, so
//! a request that fails the handshake leaves its token usable.

pub mod nonce;
pub mod rate_limit;
pub mod token;

pub use nonce::NonceCache;
pub use rate_limit::{ConnectionThrottle, FixedWindowLimiter};
pub use token::{SessionClaims, TokenError, TokenVerifier};

use crate::error::{AppError, AppResult};
use std::sync::Arc;
use std::time::Instant;

/// What admission needs to know about an upgrade request.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub origin: Option<&'a str>,
    pub ip: &'a str,
    pub token: Option<&'a str>,
}

pub struct AdmissionPolicy {
    allowed_origins: Vec<String>,
    throttle: Arc<dyn ConnectionThrottle>,
    verifier: TokenVerifier,
    /// `None` when replay protection is disabled
    nonces: Option<NonceCache>,
}

impl AdmissionPolicy {
    pub fn new(
        allowed_origins: Vec<String>,
        throttle: Arc<dyn ConnectionThrottle>,
        verifier: TokenVerifier,
        replay_protection: bool,
    ) -> Self {
        Self {
            allowed_origins: allowed_origins
                .into_iter()
                .map(|origin| origin.trim_end_matches('/').to_string())
                .collect(),
            throttle,
            verifier,
            nonces: replay_protection.then(NonceCache::new),
        }
    }

    /// Run all checks and return the verified claims.
    ///
    /// `now` drives the rate limiter, `now_ms` (wall clock) the token expiry.
    /// A nonce that is already claimed is refused here, but nothing is
    /// consumed; see [`AdmissionPolicy::claim_nonce`].
    pub fn admit(&self, request: &AdmissionRequest<'_>, now: Instant, now_ms: i64) -> AppResult<SessionClaims> {
        if let Some(origin) = request.origin {
            if !self.origin_allowed(origin) {
                return Err(AppError::Forbidden(format!("Origin not allowed: {}", origin)));
            }
        }

        if self.throttle.should_throttle(request.ip, now) {
            return Err(AppError::RateLimited("Too many connection attempts".to_string()));
        }

        let token = request
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing session token".to_string()))?;

        let claims = self.verifier.verify(token, now_ms)?;

        if let Some(nonces) = &self.nonces {
            if nonces.is_claimed(&claims.user_id, &claims.nonce, now_ms) {
                return Err(TokenError::Replayed.into());
            }
        }

        Ok(claims)
    }

    /// Consume the token's nonce. Fails if another connection claimed it
    /// between `admit` and now.
    pub fn claim_nonce(&self, claims: &SessionClaims, now_ms: i64) -> AppResult<()> {
        match &self.nonces {
            Some(nonces) if !nonces.claim(&claims.user_id, &claims.nonce, claims.expires_at_ms, now_ms) => {
                Err(TokenError::Replayed.into())
            }
            _ => Ok(()),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    /// Periodic housekeeping for the shared admission stores.
    pub fn prune(&self, now: Instant, now_ms: i64) -> usize {
        let windows = self.throttle.prune(now);
        let nonces = self.nonces.as_ref().map_or(0, |n| n.prune(now_ms));
        windows + nonces
    }
}
