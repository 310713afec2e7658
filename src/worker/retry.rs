//! Retry policy for failed deliveries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter and an attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deliveries allowed before a job is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempts-1)`, capped at `max_backoff`. No jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before redelivery: backoff plus up to 25% jitter, raised to
    /// the provider's `Retry-After` hint when that is longer.
    pub fn delay_for(&self, attempts: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempts);
        let spread = (backoff.as_millis() / 4) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        let delay = (backoff + Duration::from_millis(jitter)).min(self.max_backoff);
        match hint {
            Some(h) if h > delay => h,
            _ => delay,
        }
    }

    /// Whether a delivery on its `attempts`-th try may not be retried again.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
