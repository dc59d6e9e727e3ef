//! Stage retry policy

use chrono::Duration;

/// Exponential backoff with a ceiling on consecutive failures per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures of one stage after which the job fails
    pub limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base_delay: Duration::seconds(2),
            max_delay: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.limit
    }

    /// Backoff before the next attempt: `base * 2^(failures - 1)`, capped
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
