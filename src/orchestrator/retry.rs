//! Exponential backoff with jitter for transient stage failures.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay randomized away, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before the attempt after `attempt` (0-based) failed:
    /// base * 2^attempt, capped, minus up to `jitter` of itself.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return exp;
        }
        let shave = rand::thread_rng().gen_range(0.0..self.jitter);
        exp.mul_f64(1.0 - shave)
    }
}
