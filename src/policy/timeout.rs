//! Timeout parameters used to detect dead sockets and half-open sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds how long a transport connect attempt may wait for CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTimeoutPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_connect_timer_interval")]
    pub timer_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
}

fn default_connect_timer_interval() -> u64 {
    16
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ConnectTimeoutPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timer_interval_secs: default_connect_timer_interval(),
            timeout_secs: default_connect_timeout(),
        }
    }
}

impl ConnectTimeoutPolicy {
    pub fn timer_interval(&self) -> Duration {
        Duration::from_secs(self.timer_interval_secs.max(1))
    }

    pub fn is_expired(&self, connecting_for: Duration) -> bool {
        self.enabled && connecting_for >= Duration::from_secs(self.timeout_secs)
    }
}

/// Detects connections that look alive but stopped carrying traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleActivityTimeoutPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_idle_timer_interval")]
    pub timer_interval_secs: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_idle_timer_interval() -> u64 {
    12
}

fn default_inactivity_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    40
}

impl Default for IdleActivityTimeoutPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timer_interval_secs: default_idle_timer_interval(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl IdleActivityTimeoutPolicy {
    pub fn timer_interval(&self) -> Duration {
        Duration::from_secs(self.timer_interval_secs.max(1))
    }

    /// A session is half-open when nothing has been read for the read
    /// timeout, or when we wrote something and the broker stayed silent
    /// for longer than the inactivity timeout afterwards.
    pub fn is_connection_idle(&self, idle_inbound: Duration, idle_outbound: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        if idle_inbound >= Duration::from_secs(self.read_timeout_secs) {
            return true;
        }
        // Nothing read since the last write, and that write is old enough
        idle_outbound < idle_inbound
            && idle_outbound >= Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// Bounds how long a hung authenticator can block reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTimeoutPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

fn default_auth_timeout() -> u64 {
    20
}

impl Default for AuthTimeoutPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_auth_timeout(),
        }
    }
}

impl AuthTimeoutPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_secs(self.timeout_secs))
    }
}
