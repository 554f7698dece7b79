//! Retry policy for failed applies.

use std::time::Duration;

/// Bounded retry with exponential backoff.
///
/// `max_retries` is the budget a deterministically failing envelope gets
/// before it is routed to the dead-letter sink.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for a retry attempt
    pub fn get_backoff(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let capped = backoff.min(self.max_backoff_ms);
        Duration::from_millis(capped)
    }

    /// Check if should retry
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::default();

        assert!(policy.get_backoff(1) > policy.get_backoff(0));
        assert!(policy.get_backoff(2) > policy.get_backoff(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.get_backoff(20), Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
