use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for retryable stream failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per round, including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    ///
    /// A server hint raises the delay but never past `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let max = Duration::from_millis(self.max_delay_ms);
        let delay = Duration::from_millis(base.min(self.max_delay_ms as f64) as u64);

        match hint {
            Some(hint) => delay.max(hint).min(max),
            None => delay.min(max),
        }
    }
}
