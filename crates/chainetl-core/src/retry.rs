//! Exponential backoff policy, shared by the retrying node client and the
//! crawler's poll-cycle backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add `jitter_fraction * backoff / 2` on top of every delay (0.0 = none).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        Some(self.backoff(attempt))
    }

    /// Unbounded backoff for the `attempt`-th consecutive failure, capped at
    /// `max_backoff_ms`. Used where retries never give up (crawler cycles).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        let jitter_ms = capped * self.config.jitter_fraction * 0.5;
        Duration::from_millis((capped + jitter_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, max_backoff_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms,
            multiplier,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn exponential_delays() {
        let p = policy(3, 30_000, 2.0);
        assert_eq!(p.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(p.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(p.next_delay(3).unwrap().as_millis(), 400);
        assert!(p.next_delay(4).is_none());
        assert!(p.next_delay(0).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let p = policy(10, 500, 10.0);
        assert!(p.next_delay(5).unwrap() <= Duration::from_millis(500));
        assert_eq!(p.backoff(1_000), Duration::from_millis(500));
    }
}
