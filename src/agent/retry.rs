//! Exponential backoff for resubmitting failed tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy: `min(max_delay, initial_delay * multiplier^attempt)`.
///
/// The dispatch loop never retries on its own; components that resubmit
/// failed tasks ask the policy how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
