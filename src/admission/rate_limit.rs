//! Per-IP connection rate limiting.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Decides whether a new connection attempt from `ip` should be refused.
///
/// Injected into the application state so tests control the clock and get a
/// fresh counter store each.
pub trait ConnectionThrottle: Send + Sync {
    /// Count one attempt from `ip` at `now`; true when it exceeds the budget.
    fn should_throttle(&self, ip: &str, now: Instant) -> bool;

    /// Drop bookkeeping that can no longer affect a decision. Returns the
    /// number of entries removed.
    fn prune(&self, _now: Instant) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    attempts: u32,
}

/// Fixed-window counter keyed by IP.
///
/// Every attempt counts, including ones later refused for another reason.
/// A window opens at the first attempt and resets once `window` has elapsed.
pub struct FixedWindowLimiter {
    max_connections: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(max_connections: u32, window: Duration) -> Self {
        Self {
            max_connections,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ConnectionThrottle for FixedWindowLimiter {
    fn should_throttle(&self, ip: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = windows.entry(ip.to_string()).or_insert(Window {
            opened_at: now,
            attempts: 0,
        });

        if now.saturating_duration_since(entry.opened_at) >= self.window {
            *entry = Window {
                opened_at: now,
                attempts: 0,
            };
        }

        entry.attempts = entry.attempts.saturating_add(1);
        entry.attempts > self.max_connections
    }

    fn prune(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.opened_at) < self.window);
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_eleventh_attempt_throttled() {
        let limiter = FixedWindowLimiter::new(10, WINDOW);
        let start = Instant::now();

        for i in 0..10 {
            assert!(!limiter.should_throttle("10.0.0.1", start + Duration::from_secs(i)));
        }
        assert!(limiter.should_throttle("10.0.0.1", start + Duration::from_secs(10)));
        assert!(limiter.should_throttle("10.0.0.1", start + Duration::from_secs(59)));
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let limiter = FixedWindowLimiter::new(2, WINDOW);
        let start = Instant::now();

        assert!(!limiter.should_throttle("10.0.0.1", start));
        assert!(!limiter.should_throttle("10.0.0.1", start));
        assert!(limiter.should_throttle("10.0.0.1", start));

        assert!(!limiter.should_throttle("10.0.0.1", start + WINDOW));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = FixedWindowLimiter::new(1, WINDOW);
        let now = Instant::now();

        assert!(!limiter.should_throttle("10.0.0.1", now));
        assert!(limiter.should_throttle("10.0.0.1", now));
        assert!(!limiter.should_throttle("10.0.0.2", now));
    }

    #[test]
    fn test_prune_drops_expired_windows() {
        let limiter = FixedWindowLimiter::new(5, WINDOW);
        let start = Instant::now();

        limiter.should_throttle("10.0.0.1", start);
        limiter.should_throttle("10.0.0.2", start + Duration::from_secs(30));
        assert_eq!(limiter.tracked_ips(), 2);

        assert_eq!(limiter.prune(start + WINDOW), 1);
        assert_eq!(limiter.tracked_ips(), 1);
    }

    #[test]
    fn test_concurrent_attempts_counted_once_each() {
        let limiter = std::sync::Arc::new(FixedWindowLimiter::new(50, WINDOW));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10).filter(|_| limiter.should_throttle("10.0.0.9", now)).count()
                })
            })
            .collect();

        let throttled: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(throttled, 80 - 50);
    }
}
