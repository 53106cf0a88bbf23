//! Pure connection health supervision
//!
//! Tracks ping/pong timing and traffic in both directions so the client
//! loop can decide when a session is dead without waiting for TCP.

use crate::policy::{ConnectTimeoutPolicy, IdleActivityTimeoutPolicy};
use crate::transport::{TransportError, TransportErrorKind};
use std::time::{Duration, Instant};

/// Outcome of recording an outgoing ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingCheck {
    Healthy,
    /// The previous ping never got a response
    Missed { waited: Duration },
}

/// Health decision taken on each supervision tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthDecision {
    Healthy,
    ConnectTimedOut(TransportError),
    Idle(TransportError),
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    last_inbound: Instant,
    last_outbound: Instant,
    attempt_started: Instant,
    connected_at: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(now: Instant) -> Self {
        Self {
            last_ping: None,
            last_pong: None,
            last_inbound: now,
            last_outbound: now,
            attempt_started: now,
            connected_at: None,
        }
    }

    /// Forget everything from the previous attempt
    pub fn start_attempt(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    pub fn connected(&mut self, now: Instant) {
        self.connected_at = Some(now);
        self.last_inbound = now;
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn record_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    /// Record a ping; a ping still waiting for its pong is a keep-alive failure
    pub fn ping_sent(&mut self, now: Instant) -> PingCheck {
        let check = match (self.last_ping, self.last_pong) {
            (Some(ping), None) => PingCheck::Missed {
                waited: now.saturating_duration_since(ping),
            },
            (Some(ping), Some(pong)) if pong < ping => PingCheck::Missed {
                waited: now.saturating_duration_since(ping),
            },
            _ => PingCheck::Healthy,
        };
        self.last_ping = Some(now);
        self.record_outbound(now);
        check
    }

    /// Record a pong and return the round trip of the ping it answers
    pub fn pong_received(&mut self, now: Instant) -> Duration {
        self.last_pong = Some(now);
        self.record_inbound(now);
        self.last_ping
            .map(|ping| now.saturating_duration_since(ping))
            .unwrap_or_default()
    }

    /// Time spent waiting on the outstanding ping, if any
    pub fn outstanding_ping(&self, now: Instant) -> Option<Duration> {
        match (self.last_ping, self.last_pong) {
            (Some(ping), Some(pong)) if pong >= ping => None,
            (Some(ping), _) => Some(now.saturating_duration_since(ping)),
            (None, _) => None,
        }
    }

    pub fn idle_inbound(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_inbound)
    }

    pub fn idle_outbound(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_outbound)
    }

    /// Time since the current attempt started, or since CONNACK once connected
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at.unwrap_or(self.attempt_started))
    }

    pub fn attempt_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.attempt_started)
    }

    /// Apply the timeout policies (pure function)
    pub fn evaluate(
        &self,
        now: Instant,
        connect_timeout: &ConnectTimeoutPolicy,
        idle_timeout: &IdleActivityTimeoutPolicy,
    ) -> HealthDecision {
        if !self.is_connected() {
            if connect_timeout.is_expired(self.attempt_elapsed(now)) {
                return HealthDecision::ConnectTimedOut(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("no CONNACK within {}s", connect_timeout.timeout_secs),
                ));
            }
            return HealthDecision::Healthy;
        }

        let inbound = self.idle_inbound(now);
        let outbound = self.idle_outbound(now);
        if idle_timeout.is_connection_idle(inbound, outbound) {
            return HealthDecision::Idle(TransportError::new(
                TransportErrorKind::IdleTimeout,
                format!(
                    "no inbound traffic for {}ms (last write {}ms ago)",
                    inbound.as_millis(),
                    outbound.as_millis()
                ),
            ));
        }
        HealthDecision::Healthy
    }

    /// Supervision tick interval for the enabled policies
    pub fn tick_interval(
        connect_timeout: &ConnectTimeoutPolicy,
        idle_timeout: &IdleActivityTimeoutPolicy,
    ) -> Duration {
        [
            connect_timeout.enabled.then(|| connect_timeout.timer_interval()),
            idle_timeout.enabled.then(|| idle_timeout.timer_interval()),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(Duration::from_secs(1))
    }
}
