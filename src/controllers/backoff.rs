//! Retry pacing for the Alert controller
//!
//! Failed keys are requeued with a per-key exponential backoff, and every
//! reconcile start is throttled by a shared `governor` token bucket.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::{Error, Result};

/// First retry delay for a failing key
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound on the retry delay for a failing key
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff tracked per object key
#[derive(Debug)]
pub struct KeyedBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for KeyedBackoff {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

impl KeyedBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(key.to_string()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        self.base
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Clear the failure history of `key` after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Failures recorded for `key` since its last success
    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Token bucket shared by all reconciles
pub fn reconcile_limiter(qps: u32, burst: u32) -> Result<DefaultDirectRateLimiter> {
    let qps = NonZeroU32::new(qps)
        .ok_or_else(|| Error::ConfigError("reconcile qps must be greater than zero".into()))?;
    let burst = NonZeroU32::new(burst)
        .ok_or_else(|| Error::ConfigError("reconcile burst must be greater than zero".into()))?;
    Ok(RateLimiter::direct(Quota::per_second(qps).allow_burst(burst)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_ready, task};

    #[test]
    fn test_backoff_doubles_per_failure() {
        let backoff = KeyedBackoff::default();
        assert_eq!(backoff.next_delay("ops/a"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("ops/a"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay("ops/a"), Duration::from_millis(20));
        assert_eq!(backoff.failures("ops/a"), 3);

        // Other keys keep their own history
        assert_eq!(backoff.next_delay("ops/b"), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = KeyedBackoff::default();
        let mut last = Duration::ZERO;
        for _ in 0..64 {
            last = backoff.next_delay("ops/a");
        }
        assert_eq!(last, MAX_DELAY);
    }

    #[test]
    fn test_reset_starts_over() {
        let backoff = KeyedBackoff::default();
        backoff.next_delay("ops/a");
        backoff.next_delay("ops/a");
        backoff.reset("ops/a");
        assert_eq!(backoff.failures("ops/a"), 0);
        assert_eq!(backoff.next_delay("ops/a"), Duration::from_millis(5));
    }

    #[test]
    fn test_limiter_admits_a_burst() {
        let limiter = reconcile_limiter(1, 3).unwrap();
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_first_wait_is_immediate() {
        let limiter = reconcile_limiter(10, 100).unwrap();
        let mut ready = task::spawn(limiter.until_ready());
        assert_ready!(ready.poll());
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(matches!(reconcile_limiter(0, 1), Err(Error::ConfigError(_))));
        assert!(matches!(reconcile_limiter(1, 0), Err(Error::ConfigError(_))));
    }
}
