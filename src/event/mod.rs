//! Lifecycle and telemetry events
//!
//! Every observable transition of the client is reported as a
//! [`CourierEvent`]. Transports and streams push events into an
//! [`EventSink`]; the session worker annotates them with connection info
//! and fans them out over the [`EventBus`].

pub mod bus;

pub use bus::{EventBus, EventHandler, HandlerId};

use crate::auth::AuthError;
use crate::message::QoS;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Identity of the connection an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u16,
    pub client_id: String,
    pub username: String,
    pub clean_session: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CourierEventKind {
    AuthStart {
        source: Option<String>,
    },
    AuthSuccess {
        host: String,
        port: u16,
        elapsed_ms: u64,
    },
    AuthFailure {
        error: AuthError,
        elapsed_ms: u64,
    },

    ConnectionAttempt,
    ConnectionSuccess {
        elapsed_ms: u64,
    },
    ConnectionFailure {
        elapsed_ms: u64,
        error: TransportError,
    },
    ConnectionLost {
        elapsed_ms: u64,
        error: TransportError,
        idle_inbound_ms: u64,
        idle_outbound_ms: u64,
    },
    ConnectionDisconnect,
    CourierDisconnect {
        clear_state: bool,
    },
    Reconnect,
    ConnectDiscarded {
        reason: String,
    },

    SubscribeAttempt {
        topics: Vec<(String, QoS)>,
    },
    SubscribeSuccess {
        topics: Vec<(String, QoS)>,
        elapsed_ms: u64,
    },
    SubscribeFailure {
        topics: Vec<(String, QoS)>,
        error: String,
        elapsed_ms: u64,
    },
    UnsubscribeAttempt {
        topics: Vec<String>,
    },
    UnsubscribeSuccess {
        topics: Vec<String>,
        elapsed_ms: u64,
    },
    UnsubscribeFailure {
        topics: Vec<String>,
        error: String,
        elapsed_ms: u64,
    },

    Ping {
        host: String,
    },
    PongReceived {
        elapsed_ms: u64,
    },
    PingFailure {
        elapsed_ms: u64,
        error: String,
    },

    MessageReceive {
        topic: String,
        size_bytes: usize,
    },
    MessageReceiveFailure {
        topic: String,
        error: String,
        size_bytes: usize,
    },
    MessageSend {
        topic: String,
        qos: QoS,
        size_bytes: usize,
    },
    MessageSendSuccess {
        topic: String,
        qos: QoS,
        size_bytes: usize,
    },
    MessageSendFailure {
        topic: String,
        qos: QoS,
        error: String,
        size_bytes: usize,
    },

    AppForeground,
    AppBackground,
    ConnectionAvailable,
    ConnectionUnavailable,
}

impl CourierEventKind {
    /// Stable identifier used in logs
    pub fn name(&self) -> &'static str {
        use CourierEventKind::*;
        match self {
            AuthStart { .. } => "auth_start",
            AuthSuccess { .. } => "auth_success",
            AuthFailure { .. } => "auth_failure",
            ConnectionAttempt => "connection_attempt",
            ConnectionSuccess { .. } => "connection_success",
            ConnectionFailure { .. } => "connection_failure",
            ConnectionLost { .. } => "connection_lost",
            ConnectionDisconnect => "connection_disconnect",
            CourierDisconnect { .. } => "courier_disconnect",
            Reconnect => "reconnect",
            ConnectDiscarded { .. } => "connect_discarded",
            SubscribeAttempt { .. } => "subscribe_attempt",
            SubscribeSuccess { .. } => "subscribe_success",
            SubscribeFailure { .. } => "subscribe_failure",
            UnsubscribeAttempt { .. } => "unsubscribe_attempt",
            UnsubscribeSuccess { .. } => "unsubscribe_success",
            UnsubscribeFailure { .. } => "unsubscribe_failure",
            Ping { .. } => "ping",
            PongReceived { .. } => "pong_received",
            PingFailure { .. } => "ping_failure",
            MessageReceive { .. } => "message_receive",
            MessageReceiveFailure { .. } => "message_receive_failure",
            MessageSend { .. } => "message_send",
            MessageSendSuccess { .. } => "message_send_success",
            MessageSendFailure { .. } => "message_send_failure",
            AppForeground => "app_foreground",
            AppBackground => "app_background",
            ConnectionAvailable => "connection_available",
            ConnectionUnavailable => "connection_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourierEvent {
    pub kind: CourierEventKind,
    pub connection_info: Option<ConnectionInfo>,
    pub timestamp: DateTime<Utc>,
}

impl CourierEvent {
    pub fn new(kind: CourierEventKind) -> Self {
        Self {
            kind,
            connection_info: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_connection_info(mut self, info: Option<ConnectionInfo>) -> Self {
        self.connection_info = info;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Sending half of a component's event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CourierEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CourierEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event; silently dropped once the receiving worker is gone
    pub fn emit(&self, kind: CourierEventKind) {
        let _ = self.tx.send(CourierEvent::new(kind));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Milliseconds in a duration, saturating
pub fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_snake_case() {
        let kinds = vec![
            CourierEventKind::ConnectionAttempt,
            CourierEventKind::CourierDisconnect { clear_state: true },
            CourierEventKind::MessageReceive {
                topic: "t".to_string(),
                size_bytes: 3,
            },
        ];
        for kind in kinds {
            let name = kind.name();
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(CourierEventKind::ConnectionAttempt);
        sink.emit(CourierEventKind::ConnectionSuccess { elapsed_ms: 5 });

        assert_eq!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::ConnectionAttempt
        );
        assert_eq!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::ConnectionSuccess { elapsed_ms: 5 }
        );
    }

    #[test]
    fn test_sink_survives_closed_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        sink.emit(CourierEventKind::AppForeground);
    }

    #[test]
    fn test_event_carries_connection_info() {
        let info = ConnectionInfo {
            host: "h".to_string(),
            port: 1883,
            keep_alive_secs: 60,
            client_id: "c".to_string(),
            username: String::new(),
            clean_session: false,
        };
        let event = CourierEvent::new(CourierEventKind::Reconnect)
            .with_connection_info(Some(info.clone()));
        assert_eq!(event.connection_info, Some(info));
        assert_eq!(event.name(), "reconnect");
    }
}
