//! Retry bounds and backoff for reclaimed transactions.

use std::env;

use crate::domain::DEFAULT_MAX_RETRIES;

/// Maximum exponent applied to the base backoff
const MAX_BACKOFF_EXPONENT: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rows at or above this retry count are never claimed again
    pub max_retries: i32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_secs: 15,
            max_backoff_secs: 1_800,
        }
    }
}

impl RetryPolicy {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_retries = env::var("MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries);

        let base_backoff_secs = env::var("RETRY_BASE_BACKOFF_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.base_backoff_secs);

        let max_backoff_secs = env::var("RETRY_MAX_BACKOFF_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_backoff_secs);

        Self {
            max_retries,
            base_backoff_secs,
            max_backoff_secs,
        }
    }

    /// Delay before the next attempt after `retry_count` attempts
    #[must_use]
    pub fn backoff_secs(&self, retry_count: i32) -> i64 {
        let exponent = retry_count.clamp(0, MAX_BACKOFF_EXPONENT) as u32;
        self.base_backoff_secs
            .saturating_mul(2_i64.pow(exponent))
            .min(self.max_backoff_secs)
    }

    /// Whether one more failed attempt uses up the budget
    #[must_use]
    pub fn exhausted_after_increment(&self, retry_count: i32) -> bool {
        retry_count + 1 >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_backoff_secs: 1,
            max_backoff_secs: 300,
        };
        assert_eq!(policy.backoff_secs(0), 1);
        assert_eq!(policy.backoff_secs(1), 2);
        assert_eq!(policy.backoff_secs(4), 16);
        assert_eq!(policy.backoff_secs(8), 256);
        assert_eq!(policy.backoff_secs(9), 256); // Capped at 2^8
        assert_eq!(policy.backoff_secs(-3), 1);
    }

    #[test]
    fn test_backoff_respects_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_secs(0), 15);
        assert_eq!(policy.backoff_secs(7), 1_800);
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted_after_increment(8));
        assert!(policy.exhausted_after_increment(9));
        assert!(policy.exhausted_after_increment(10));
    }
}
