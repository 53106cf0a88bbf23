//! Retry decisions for failed authentication round-trips
//!
//! Client errors (4xx) mean the credentials request itself is wrong and
//! will not improve by repeating it, so only server-side HTTP failures are
//! retried, a bounded number of times with exponential spacing.

use crate::auth::AuthError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRetryConfig {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_base_retry_secs")]
    pub base_retry_secs: u64,
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_base_retry_secs() -> u64 {
    1
}

impl Default for AuthRetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            base_retry_secs: default_base_retry_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthRetryPolicy {
    config: AuthRetryConfig,
    retry_count: u32,
}

impl AuthRetryPolicy {
    pub fn new(config: AuthRetryConfig) -> Self {
        Self {
            config,
            retry_count: 0,
        }
    }

    pub fn should_retry(&self, error: &AuthError) -> bool {
        match error {
            AuthError::Http { status, .. } => {
                !(400..=499).contains(status) && self.retry_count < self.config.max_retry_count
            }
            _ => false,
        }
    }

    /// Consume one retry and return how long to wait before it
    pub fn next_retry_delay(&mut self) -> Duration {
        self.retry_count = self.retry_count.saturating_add(1);
        let exponent = self.retry_count.saturating_sub(1).min(16);
        Duration::from_secs(self.config.base_retry_secs.saturating_mul(1u64 << exponent))
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }
}

impl Default for AuthRetryPolicy {
    fn default() -> Self {
        Self::new(AuthRetryConfig::default())
    }
}
