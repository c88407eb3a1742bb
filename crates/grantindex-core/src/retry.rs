//! Bounded exponential backoff for transient storage failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget for ledger writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on the backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Stateless backoff schedule — computes the delay for a given attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), or `None` once the
    /// retry budget is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.max_retries {
            return None;
        }
        let base = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
