//! Per-key exponential backoff.
//!
//! Each key accumulates a failure count. The delay handed out for the n-th
//! consecutive failure is `base * multiplier^n`, capped at `max_delay`.
//! Forgetting a key resets its streak so the next failure starts at `base`.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Initial requeue delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Upper bound for any single requeue delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Configuration for per-key backoff.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay for the first failure of a streak
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: 2.0,
        }
    }
}

/// Tracks consecutive failures per key and turns them into delays.
#[derive(Debug)]
pub struct ItemExponentialBackoff<K> {
    config: BackoffConfig,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemExponentialBackoff<K> {
    /// Create a limiter with the given configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&mut self, key: &K) -> Duration {
        let exp = {
            let count = self.failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        let max = self.config.max_delay.as_secs_f64();
        // powi saturates to infinity for large streaks, min() brings it back to the cap
        let delay = self.config.base_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exp.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(delay.min(max))
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure streak for `key`
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

impl<K: Eq + Hash + Clone> Default for ItemExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
