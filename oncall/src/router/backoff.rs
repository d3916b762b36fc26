//! Retry policy for transient delivery failures

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Bound on a message's failure count. A transient failure that brings
    /// the count to this value is terminal, so this is also the total number
    /// of attempts (0 or 1 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based). Retry 0 has no delay.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let exponent = (retry - 1).min(62) as i32;
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if delay.is_finite() {
            (delay as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        }
    }

    /// Whether a message that has failed `retries` times may be retried again.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::milliseconds(self.backoff_ms(retry).min(i64::MAX as u64) as i64)
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 30s initial backoff, 2x multiplier, 10 min max.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 600_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(1), 100);
        assert_eq!(policy.backoff_ms(2), 200);
        assert_eq!(policy.backoff_ms(3), 350);
        assert_eq!(policy.backoff_ms(1000), 350);
        assert_eq!(policy.backoff(2), Duration::milliseconds(200));
    }

    #[test]
    fn test_retry_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        // The worker asks with the count the failure would bring it to
        let single = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        assert!(!single.should_retry(1));
    }
}
