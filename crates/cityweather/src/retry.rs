//! Retry decisions for upstream failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::provider::ProviderError;

/// Largest jitter fraction that still keeps consecutive delays ordered:
/// the lowest draw for attempt `n + 1` never undercuts the highest for `n`.
pub const MAX_JITTER: f64 = 1.0 / 3.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the task and try again after the delay.
    RetryAfter(Duration),
    /// The failure is terminal.
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Decides what to do after attempt number `attempt` (1-based) failed.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        error: &ProviderError,
        attempt: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff(attempt, rng))
    }

    /// `min(max_delay, base_delay * 2^(attempt-1) * (1 ± jitter))`.
    pub fn backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let nominal = self.base_delay.as_secs_f64() * 2f64.powi(exponent);

        let jitter = self.jitter.clamp(0.0, MAX_JITTER);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };

        let cap = self.max_delay.as_secs_f64();
        Duration::from_secs_f64((nominal * factor).min(cap).max(0.0))
    }
}
