use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a dropped persistent connection is re-established.
///
/// Attempt `n` (counting from zero) waits `initial_delay * multiplier^n`,
/// capped at `max_delay`; after `max_retries` attempts the transport gives up.
///
/// ```
/// use credflow_sdk::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 3,
///     initial_delay: Duration::from_millis(100),
///     multiplier: 2.0,
///     max_delay: Duration::from_secs(1),
/// };
///
/// let delays: Vec<_> = policy.schedule().collect();
/// assert_eq!(delays, [100, 200, 400].map(Duration::from_millis));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt`, `None` once the budget is spent
    pub fn next_timeout(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());

        Some(Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay))
    }

    /// Every delay of the policy, in order
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + use<> {
        let policy = *self;
        (0..).map_while(move |attempt| policy.next_timeout(attempt))
    }
}
