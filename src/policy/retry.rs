//! Bounded exponential backoff with full jitter
//!
//! The ceiling starts at the configured base, doubles on every consecutive
//! call and saturates at the configured max. Each call returns a uniformly
//! random delay in `[1, ceiling]` so that many clients losing the same
//! broker do not reconnect in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry interval configuration in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_secs")]
    pub base_secs: u64,
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,
}

fn default_base_secs() -> u64 {
    5
}

fn default_max_secs() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: default_base_secs(),
            max_secs: default_max_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRetryPolicy {
    base: u64,
    max: u64,
    current: u64,
}

impl ConnectRetryPolicy {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        let base = base_secs.max(1);
        let max = max_secs.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_secs, config.max_secs)
    }

    /// Advance the backoff and return the pre-jitter ceiling for this attempt
    pub fn next_ceiling(&mut self) -> u64 {
        if self.current >= self.max {
            return self.max;
        }
        let ceiling = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        ceiling
    }

    /// Next reconnect delay in seconds, jittered within `[1, ceiling]`
    pub fn next_interval_seconds(&mut self) -> u64 {
        self.next_interval_with(&mut rand::thread_rng())
    }

    pub fn next_interval_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> u64 {
        let ceiling = self.next_ceiling();
        rng.gen_range(1..=ceiling)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn base_secs(&self) -> u64 {
        self.base
    }

    pub fn max_secs(&self) -> u64 {
        self.max
    }
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ceilings_double_then_saturate() {
        let mut policy = ConnectRetryPolicy::new(2, 10);
        let ceilings: Vec<u64> = (0..6).map(|_| policy.next_ceiling()).collect();
        assert_eq!(ceilings, vec![2, 4, 8, 10, 10, 10]);
    }

    #[test]
    fn test_jittered_interval_within_bounds() {
        let mut policy = ConnectRetryPolicy::new(2, 10);
        let mut shadow = policy.clone();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let ceiling = shadow.next_ceiling();
            let interval = policy.next_interval_with(&mut rng);
            assert!(interval >= 1);
            assert!(interval <= ceiling);
        }
    }

    #[test]
    fn test_reset_restores_base() {
        let mut policy = ConnectRetryPolicy::new(3, 20);
        policy.next_ceiling();
        policy.next_ceiling();
        policy.reset();
        assert_eq!(policy.next_ceiling(), 3);
    }

    #[test]
    fn test_degenerate_bounds_are_clamped() {
        let mut policy = ConnectRetryPolicy::new(0, 0);
        assert_eq!(policy.base_secs(), 1);
        assert_eq!(policy.max_secs(), 1);
        assert_eq!(policy.next_interval_seconds(), 1);

        let policy = ConnectRetryPolicy::new(8, 4);
        assert_eq!(policy.max_secs(), 8);
    }

    #[test]
    fn test_default_matches_config_defaults() {
        let mut policy = ConnectRetryPolicy::default();
        assert_eq!(policy.base_secs(), 5);
        assert_eq!(policy.max_secs(), 10);
        assert_eq!(policy.next_ceiling(), 5);
        assert_eq!(policy.next_ceiling(), 10);
    }
}
