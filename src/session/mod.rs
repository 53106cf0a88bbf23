//! Session management
//!
//! [`SessionManager`] is the public face of the client. Every call is
//! marshaled onto a single worker task that owns the lifecycle flags, the
//! timers and the subscription store, so state transitions never race.

pub mod manager;
pub mod stream;
mod worker;

pub use manager::{SessionBuilder, SessionManager};
pub use stream::TopicStream;

use crate::message::ReceiverConfig;
use crate::policy::{AuthRetryConfig, AuthTimeoutPolicy, RetryConfig};
use std::fmt;
use std::time::Duration;

/// Coarse connection state reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Session level tuning; transport tuning lives in
/// [`TransportSettings`](crate::transport::mqtt::TransportSettings)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auth_retry: AuthRetryConfig,
    /// Paces re-authentication after a non-retriable auth failure
    pub auto_reconnect: RetryConfig,
    pub auth_timeout: AuthTimeoutPolicy,
    pub background_grace: Duration,
    pub disconnect_on_background: bool,
    pub receiver: ReceiverConfig,
    /// Recorded in `AuthStart` when `connect()` is called without a source
    pub default_connect_source: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_retry: AuthRetryConfig::default(),
            auto_reconnect: RetryConfig::default(),
            auth_timeout: AuthTimeoutPolicy::default(),
            background_grace: Duration::from_secs(1),
            disconnect_on_background: false,
            receiver: ReceiverConfig::default(),
            default_connect_source: None,
        }
    }
}

/// Flags owned by the worker and mirrored for synchronous queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SessionFlags {
    pub authenticating: bool,
    pub destroyed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert_eq!(config.background_grace, Duration::from_secs(1));
        assert!(!config.disconnect_on_background);
        assert!(config.auth_timeout.timeout().is_none());
        assert!(!config.receiver.persistence_enabled());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
