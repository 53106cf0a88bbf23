//! Transport layer between the session manager and the broker
//!
//! The session manager only talks to a [`Connection`]; the MQTT
//! implementation lives in [`mqtt`] and a scripted stand-in lives in
//! `testing::mocks`.

pub mod mqtt;
pub mod options;

pub use options::ConnectOptions;

use crate::event::EventSink;
use crate::message::{MqttPacket, MessageReceiver, QoS};
use crate::store::StorageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Lifecycle of one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    Starting,
    Connecting,
    Connected,
    Closing,
    Closed,
    /// Reached on protocol or socket failure; immediately followed by Closed
    Error,
}

impl TransportState {
    pub fn is_live(self) -> bool {
        matches!(self, TransportState::Connecting | TransportState::Connected)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Starting => "starting",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
            TransportState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportErrorKind {
    /// Bad credentials or not authorized; retrying without re-authenticating is pointless
    Authentication,
    ConnectionRefused,
    Protocol,
    Tls,
    Io,
    Timeout,
    KeepAlive,
    IdleTimeout,
    ClosedByBroker,
    Other,
}

/// Classified transport failure carried by connection events
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: crate::error::sanitize_error_message(&message.into()),
        }
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == TransportErrorKind::Authentication
    }
}

/// Capability interface over one physical broker connection.
///
/// All operations are fire-and-forget: outcomes are reported through the
/// [`EventSink`] passed to [`Connection::attach`].
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Wire the connection to the session's event channel and message queue
    fn attach(&self, events: EventSink, receiver: MessageReceiver);

    /// Connect with `options`; a no-op when already live with equal options
    async fn connect(&self, options: ConnectOptions);

    async fn disconnect(&self);

    /// Tear down and connect again with the last options
    async fn reconnect(&self);

    async fn publish(&self, packet: MqttPacket);

    async fn subscribe(&self, topics: &[(String, QoS)]);

    async fn unsubscribe(&self, topics: &[String]);

    fn state(&self) -> TransportState;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    fn is_connecting(&self) -> bool {
        self.state() == TransportState::Connecting
    }

    /// True once any CONNACK has been received on this connection
    fn has_existing_session(&self) -> bool;

    fn connect_options(&self) -> Option<ConnectOptions>;

    /// Drop every in-flight outgoing flow record
    fn delete_all_persisted_messages(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_states() {
        assert!(TransportState::Connecting.is_live());
        assert!(TransportState::Connected.is_live());
        assert!(!TransportState::Closing.is_live());
        assert!(!TransportState::Error.is_live());
        assert_eq!(TransportState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_error_message_is_sanitized() {
        let error = TransportError::new(TransportErrorKind::Io, "failed with password=hunter2");
        assert!(!error.message.contains("hunter2"));
        assert!(!error.is_authentication());
        assert!(TransportError::new(TransportErrorKind::Authentication, "no").is_authentication());
    }
}
