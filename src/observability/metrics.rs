//! Thread-safe metrics collection
//!
//! The collector is an [`EventHandler`]: registered on a session, it counts
//! connection, subscription and message traffic from the event stream
//! without the session knowing about it.

use crate::event::{CourierEvent, CourierEventKind, EventHandler};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnects: AtomicU64,
    discarded_connects: AtomicU64,
    connection_start_time: AtomicU64,

    auth_successes: AtomicU64,
    auth_failures: AtomicU64,

    ping_failures: AtomicU64,
    last_pong: AtomicU64,

    subscribe_failures: AtomicU64,
    unsubscribe_failures: AtomicU64,

    messages_received: AtomicU64,
    receive_failures: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    // milliseconds from attempt to CONNACK
    connect_times: Mutex<Vec<u64>>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            discarded_connects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            auth_successes: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
            last_pong: AtomicU64::new(0),
            subscribe_failures: AtomicU64::new(0),
            unsubscribe_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            receive_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            connect_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    fn record_connect_time(&self, elapsed_ms: u64) {
        if let Ok(mut times) = self.connect_times.lock() {
            times.push(elapsed_ms);
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }
    }

    fn connection_established(&self, elapsed_ms: u64) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_connect_time(elapsed_ms);
    }

    fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.reconnects,
            &self.discarded_connects,
            &self.connection_start_time,
            &self.auth_successes,
            &self.auth_failures,
            &self.ping_failures,
            &self.last_pong,
            &self.subscribe_failures,
            &self.unsubscribe_failures,
            &self.messages_received,
            &self.receive_failures,
            &self.messages_sent,
            &self.send_failures,
            &self.bytes_received,
            &self.bytes_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.connect_times.lock() {
            times.clear();
        }
    }

    fn connect_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.connect_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected = self.connected.load(Ordering::Relaxed);
        let start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected && start > 0 {
            now.saturating_sub(start)
        } else {
            0
        };
        let (avg_connect_time_ms, connect_time_p50_ms, connect_time_p95_ms) =
            self.connect_time_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                discarded_connects: self.discarded_connects.load(Ordering::Relaxed),
                auth_successes: self.auth_successes.load(Ordering::Relaxed),
                auth_failures: self.auth_failures.load(Ordering::Relaxed),
                ping_failures: self.ping_failures.load(Ordering::Relaxed),
                last_pong: self.last_pong.load(Ordering::Relaxed),
                avg_connect_time_ms,
                connect_time_p50_ms,
                connect_time_p95_ms,
                connection_duration_seconds,
            },
            messages: MessageMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                receive_failures: self.receive_failures.load(Ordering::Relaxed),
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                bytes_received: self.bytes_received.load(Ordering::Relaxed),
                bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
                subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
                unsubscribe_failures: self.unsubscribe_failures.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for MetricsCollector {
    fn on_event(&self, event: &CourierEvent) {
        use CourierEventKind::*;
        let bump = |counter: &AtomicU64| {
            counter.fetch_add(1, Ordering::Relaxed);
        };

        match &event.kind {
            AuthSuccess { .. } => bump(&self.auth_successes),
            AuthFailure { .. } => bump(&self.auth_failures),
            ConnectionAttempt => bump(&self.connection_attempts),
            ConnectionSuccess { elapsed_ms } => self.connection_established(*elapsed_ms),
            ConnectionFailure { .. } => {
                bump(&self.connection_failures);
                self.connection_closed();
            }
            ConnectionLost { .. } => {
                bump(&self.connections_lost);
                self.connection_closed();
            }
            ConnectionDisconnect | CourierDisconnect { .. } => self.connection_closed(),
            Reconnect => bump(&self.reconnects),
            ConnectDiscarded { .. } => bump(&self.discarded_connects),
            SubscribeFailure { .. } => bump(&self.subscribe_failures),
            UnsubscribeFailure { .. } => bump(&self.unsubscribe_failures),
            PongReceived { .. } => self.last_pong.store(current_timestamp(), Ordering::Relaxed),
            PingFailure { .. } => bump(&self.ping_failures),
            MessageReceive { size_bytes, .. } => {
                bump(&self.messages_received);
                self.bytes_received
                    .fetch_add(*size_bytes as u64, Ordering::Relaxed);
            }
            MessageReceiveFailure { .. } => bump(&self.receive_failures),
            MessageSendSuccess { size_bytes, .. } => {
                bump(&self.messages_sent);
                self.bytes_sent
                    .fetch_add(*size_bytes as u64, Ordering::Relaxed);
            }
            MessageSendFailure { .. } => bump(&self.send_failures),
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnects: u64,
    pub discarded_connects: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub ping_failures: u64,
    pub last_pong: u64,
    pub avg_connect_time_ms: f64,
    pub connect_time_p50_ms: f64,
    pub connect_time_p95_ms: f64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub messages_received: u64,
    pub receive_failures: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub subscribe_failures: u64,
    pub unsubscribe_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted: &[u64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (percentile / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)] as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QoS;
    use crate::transport::{TransportError, TransportErrorKind};

    fn feed(collector: &MetricsCollector, kind: CourierEventKind) {
        collector.on_event(&CourierEvent::new(kind));
    }

    #[test]
    fn test_connection_lifecycle_counts() {
        let collector = MetricsCollector::new();
        feed(&collector, CourierEventKind::ConnectionAttempt);
        feed(
            &collector,
            CourierEventKind::ConnectionFailure {
                elapsed_ms: 10,
                error: TransportError::new(TransportErrorKind::Timeout, "no CONNACK"),
            },
        );
        feed(&collector, CourierEventKind::ConnectionAttempt);
        feed(&collector, CourierEventKind::ConnectionSuccess { elapsed_ms: 40 });

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.connection.avg_connect_time_ms, 40.0);

        feed(&collector, CourierEventKind::CourierDisconnect { clear_state: false });
        assert!(!collector.snapshot().connection.connected);
    }

    #[test]
    fn test_message_traffic_counts_bytes() {
        let collector = MetricsCollector::new();
        feed(
            &collector,
            CourierEventKind::MessageReceive {
                topic: "a".into(),
                size_bytes: 12,
            },
        );
        feed(
            &collector,
            CourierEventKind::MessageSendSuccess {
                topic: "b".into(),
                qos: QoS::AtLeastOnce,
                size_bytes: 5,
            },
        );
        feed(
            &collector,
            CourierEventKind::MessageSendFailure {
                topic: "b".into(),
                qos: QoS::AtLeastOnce,
                error: "boom".into(),
                size_bytes: 5,
            },
        );

        let messages = collector.snapshot().messages;
        assert_eq!(messages.messages_received, 1);
        assert_eq!(messages.bytes_received, 12);
        assert_eq!(messages.messages_sent, 1);
        assert_eq!(messages.bytes_sent, 5);
        assert_eq!(messages.send_failures, 1);
    }

    #[test]
    fn test_reset_clears_counters() {
        let collector = MetricsCollector::new();
        feed(&collector, CourierEventKind::Reconnect);
        feed(&collector, CourierEventKind::ConnectionSuccess { elapsed_ms: 3 });
        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.reconnects, 0);
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.avg_connect_time_ms, 0.0);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50.0), 3.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 100.0), 5.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json["connection"]["connection_attempts"].is_u64());
        assert!(json["messages"]["bytes_sent"].is_u64());
    }
}
