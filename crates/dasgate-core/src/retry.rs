//! Retry policy for transport-level fetch failures.

use std::time::Duration;

/// Configuration for the automatic retry mechanism.
///
/// Retry number `attempt` (1-based) waits `unit * attempt` before it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// The maximum number of retries to attempt.
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay added per retry.
    pub unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

impl RetryConfig {
    pub fn linear(max_retries: u32, unit: Duration) -> Self {
        Self { max_retries, unit }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate the delay for a given retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_grows_by_unit() {
        let config = RetryConfig::linear(3, Duration::from_millis(250));

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(750));
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let config = RetryConfig::linear(0, Duration::from_millis(1));

        assert_eq!(config.max_attempts(), 1);
    }
}
