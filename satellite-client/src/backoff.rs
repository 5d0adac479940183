//! Exponential backoff for connection attempts.

use std::time::Duration;

/// Retry policy for [`crate::SatelliteClient::connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub num_of_attempts: u32,
    pub starting_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            num_of_attempts: 10,
            starting_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based):
    /// `min(max_delay, starting_delay * multiplier^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.starting_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}
