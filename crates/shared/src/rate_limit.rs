//! In-memory request rate limiting
//!
//! Fixed one-minute windows keyed by user id. Single-process only; each API
//! instance enforces its own budget, which is acceptable because the limit
//! exists to stop runaway clients, not to meter billing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(60);

/// Bound on tracked keys so unauthenticated churn cannot grow the map
/// without limit
const MAX_ENTRIES: usize = 10_000;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: Option<u64>,
}

struct Window {
    started: Instant,
    count: u32,
}

/// Per-user fixed-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<Uuid, Window>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one request against `key`'s window
    pub fn check(&self, key: Uuid, limit_per_minute: u32) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if windows.len() >= MAX_ENTRIES && !windows.contains_key(&key) {
            windows.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }

        let window = windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }

        if window.count >= limit_per_minute {
            let elapsed = now.duration_since(window.started);
            let retry_after = WINDOW.saturating_sub(elapsed).as_secs().max(1);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: limit_per_minute - window.count,
            retry_after_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();
        let result = limiter.check(Uuid::new_v4(), 60);
        assert!(result.allowed);
        assert_eq!(result.remaining, 59);
    }

    #[test]
    fn test_limit_exhaustion_rejected_with_retry_after() {
        let limiter = RateLimiter::new_in_memory();
        let key = Uuid::new_v4();

        for i in 0..5 {
            assert!(limiter.check(key, 5).allowed, "request {i} should pass");
        }

        let rejected = limiter.check(key, 5);
        assert!(!rejected.allowed);
        assert!(rejected.retry_after_seconds.is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new_in_memory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for _ in 0..3 {
            limiter.check(a, 3);
        }
        assert!(!limiter.check(a, 3).allowed);
        assert!(limiter.check(b, 3).allowed);
    }
}
