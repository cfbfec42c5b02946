use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Retry policy applied by the activity layer when a retryable error kind
/// surfaces. Components override the defaults per definition; scanners
/// commonly raise `max_attempts` to 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_initial_interval_ms() -> u64 {
    2_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based attempt that just failed),
    /// capped at `max_interval_ms`.
    pub fn delay_before_retry(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = self.backoff_coefficient.powi(exponent as i32);
        let delay_ms = (self.initial_interval_ms as f64 * factor) as u64;
        Duration::from_millis(delay_ms.min(self.max_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_policy_matches_platform_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay_before_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_before_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max_interval() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_before_retry(8), Duration::from_secs(30));
    }
}
