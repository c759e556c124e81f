//! Replay protection for session tokens.
//!
//! A token authorizes one relay connection. Each accepted nonce is remembered
//! until its token expires; after that the expiry check rejects the token
//! anyway, so the entry can go.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct NonceCache {
    /// `user_id:nonce` → token expiry (ms since epoch)
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a nonce. Returns false if it was already used and has not
    /// expired yet.
    pub fn claim(&self, user_id: &str, nonce: &str, expires_at_ms: i64, now_ms: i64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, expiry| *expiry >= now_ms);

        let key = format!("{}:{}", user_id, nonce);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, expires_at_ms);
        true
    }

    /// True if the nonce has been claimed and its token is still live.
    pub fn is_claimed(&self, user_id: &str, nonce: &str, now_ms: i64) -> bool {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.get(&format!("{}:{}", user_id, nonce))
            .is_some_and(|expiry| *expiry >= now_ms)
    }

    pub fn prune(&self, now_ms: i64) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, expiry| *expiry >= now_ms);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
