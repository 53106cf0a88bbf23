//! Single-writer session worker
//!
//! Owns the lifecycle flags, the auth policies and every timer. Transport
//! events, timer expiries, authentication results and public calls are all
//! processed here one at a time, so the state machine never races itself.

use super::{SessionConfig, SessionFlags};
use crate::auth::{AuthError, Authenticator};
use crate::event::{millis, CourierEvent, CourierEventKind, EventBus};
use crate::message::{MessageReceiver, MqttPacket, QoS};
use crate::policy::{AuthRetryPolicy, ConnectRetryPolicy};
use crate::store::SubscriptionStore;
use crate::transport::{ConnectOptions, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, info, warn, Instrument};

pub(crate) const DISCARD_CONNECTING: &str = "Client connecting";
pub(crate) const DISCARD_CONNECTED: &str = "Client already connected";
pub(crate) const DISCARD_AUTHENTICATING: &str = "Client is authenticating";
pub(crate) const DISCARD_DESTROYED: &str = "Courier client is destroyed";

/// Requests marshaled from [`SessionManager`](super::SessionManager) handles
#[derive(Debug)]
pub(crate) enum Command {
    Connect { source: Option<String> },
    Disconnect,
    Destroy,
    Subscribe(Vec<(String, QoS)>),
    Unsubscribe(Vec<String>),
    Publish(MqttPacket),
    AppForeground,
    AppBackground,
    NetworkAvailable,
    NetworkUnavailable,
    /// Barrier: answered once every earlier command and queued event is handled
    Sync(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    AuthRetry,
    AuthFailureReconnect,
    AuthTimeout,
    BackgroundGrace,
}

enum Internal {
    AuthCompleted {
        generation: u64,
        started: Instant,
        result: Result<ConnectOptions, AuthError>,
    },
    TimerFired {
        kind: TimerKind,
        id: u64,
    },
}

/// One-shot timers; rescheduling a kind replaces the previous timer
struct Timers {
    next_id: u64,
    active: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    tx: mpsc::UnboundedSender<Internal>,
}

impl Timers {
    fn new(tx: mpsc::UnboundedSender<Internal>) -> Self {
        Self {
            next_id: 0,
            active: HashMap::new(),
            tx,
        }
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_id += 1;
        let id = self.next_id;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::TimerFired { kind, id });
        });
        debug!(timer = ?kind, delay_ms = millis(delay), "Timer scheduled");
        self.active.insert(kind, (id, handle));
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.active.remove(&kind) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    /// True when `id` is still the live timer of `kind`; consumes it
    fn take_fired(&mut self, kind: TimerKind, id: u64) -> bool {
        match self.active.get(&kind) {
            Some((active_id, _)) if *active_id == id => {
                self.active.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

pub(crate) struct SessionParts {
    pub authenticator: Arc<dyn Authenticator>,
    pub connection: Arc<dyn Connection>,
    pub subscriptions: SubscriptionStore,
    pub receiver: MessageReceiver,
    pub bus: EventBus,
    pub config: SessionConfig,
    pub flags_tx: watch::Sender<SessionFlags>,
}

pub(crate) struct SessionWorker {
    authenticator: Arc<dyn Authenticator>,
    connection: Arc<dyn Connection>,
    subscriptions: SubscriptionStore,
    receiver: MessageReceiver,
    bus: EventBus,
    config: SessionConfig,
    auth_retry: AuthRetryPolicy,
    auth_failure_retry: ConnectRetryPolicy,
    flags: SessionFlags,
    flags_tx: watch::Sender<SessionFlags>,
    auth_generation: u64,
    connect_source: Option<String>,
    timers: Timers,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
}

impl SessionWorker {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            auth_retry: AuthRetryPolicy::new(parts.config.auth_retry),
            auth_failure_retry: ConnectRetryPolicy::from_config(&parts.config.auto_reconnect),
            connect_source: parts.config.default_connect_source.clone(),
            authenticator: parts.authenticator,
            connection: parts.connection,
            subscriptions: parts.subscriptions,
            receiver: parts.receiver,
            bus: parts.bus,
            config: parts.config,
            flags: SessionFlags::default(),
            flags_tx: parts.flags_tx,
            auth_generation: 0,
            timers: Timers::new(internal_tx.clone()),
            internal_tx,
            internal_rx: Some(internal_rx),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<CourierEvent>,
    ) {
        let Some(mut internal) = self.internal_rx.take() else {
            return;
        };
        info!("Session worker started");

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.on_transport_event(event).await,

                Some(message) = internal.recv() => self.on_internal(message).await,

                command = commands.recv() => match command {
                    Some(Command::Sync(done)) => {
                        while let Ok(event) = events.try_recv() {
                            self.on_transport_event(event).await;
                        }
                        let _ = done.send(());
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        info!("All session handles dropped, stopping worker");
                        break;
                    }
                },
            }
        }

        self.timers.cancel_all();
        self.connection.disconnect().await;
    }

    async fn on_command(&mut self, command: Command) {
        debug!(command = ?command, "Handling session command");
        match command {
            Command::Connect { source } => {
                let source = source.or_else(|| self.config.default_connect_source.clone());
                self.connect(source).await;
            }
            Command::Disconnect => self.disconnect().await,
            Command::Destroy => self.destroy().await,
            Command::Subscribe(topics) => self.subscribe(topics).await,
            Command::Unsubscribe(topics) => self.unsubscribe(topics).await,
            Command::Publish(packet) => self.connection.publish(packet).await,
            Command::AppForeground => {
                self.dispatch(CourierEventKind::AppForeground);
                self.timers.cancel(TimerKind::BackgroundGrace);
                self.connect(self.connect_source.clone()).await;
            }
            Command::AppBackground => {
                self.dispatch(CourierEventKind::AppBackground);
                self.timers
                    .schedule(TimerKind::BackgroundGrace, self.config.background_grace);
            }
            Command::NetworkAvailable => {
                self.dispatch(CourierEventKind::ConnectionAvailable);
                self.connect(self.connect_source.clone()).await;
            }
            Command::NetworkUnavailable => {
                self.dispatch(CourierEventKind::ConnectionUnavailable);
            }
            Command::Sync(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::AuthCompleted {
                generation,
                started,
                result,
            } => self.on_auth_completed(generation, started, result).await,
            Internal::TimerFired { kind, id } => {
                if !self.timers.take_fired(kind, id) {
                    debug!(timer = ?kind, "Ignoring cancelled timer");
                    return;
                }
                self.on_timer(kind).await;
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::AuthRetry | TimerKind::AuthFailureReconnect => {
                self.handle_auth_failure().await;
            }
            TimerKind::AuthTimeout => {
                if !self.flags.authenticating {
                    return;
                }
                warn!(
                    timeout_secs = self.config.auth_timeout.timeout_secs,
                    "Authenticator did not respond in time, restarting connect"
                );
                // Abandon the hung request; its late result is stale
                self.auth_generation += 1;
                self.set_authenticating(false);
                self.connect(self.connect_source.clone()).await;
            }
            TimerKind::BackgroundGrace => {
                if self.config.disconnect_on_background {
                    info!("Background grace period elapsed, disconnecting");
                    self.disconnect().await;
                } else {
                    debug!("Background grace period elapsed");
                }
            }
        }
    }

    async fn on_transport_event(&mut self, event: CourierEvent) {
        self.dispatch_event(event.clone());

        match event.kind {
            CourierEventKind::ConnectionSuccess { .. } => self.reconcile_subscriptions().await,
            CourierEventKind::UnsubscribeSuccess { topics, .. } => {
                if let Err(e) = self.subscriptions.unsubscribe_acked(&topics) {
                    warn!(error = %e, "Failed to record unsubscribe acknowledgement");
                }
            }
            CourierEventKind::ConnectionFailure { error, .. }
            | CourierEventKind::ConnectionLost { error, .. }
                if error.is_authentication() =>
            {
                warn!(error = %error, "Broker rejected credentials");
                self.handle_auth_failure().await;
            }
            _ => {}
        }
    }

    async fn connect(&mut self, source: Option<String>) {
        let reason = if self.connection.is_connecting() {
            Some(DISCARD_CONNECTING)
        } else if self.connection.is_connected() {
            Some(DISCARD_CONNECTED)
        } else if self.flags.authenticating {
            Some(DISCARD_AUTHENTICATING)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(reason, "Connect discarded");
            self.dispatch(CourierEventKind::ConnectDiscarded {
                reason: reason.to_string(),
            });
            return;
        }

        self.connect_source = source.clone();
        self.dispatch(CourierEventKind::AuthStart { source });
        self.flags = SessionFlags {
            authenticating: true,
            destroyed: false,
        };
        self.publish_flags();

        self.auth_generation += 1;
        let generation = self.auth_generation;
        if let Some(timeout) = self.config.auth_timeout.timeout() {
            self.timers.schedule(TimerKind::AuthTimeout, timeout);
        }

        let authenticator = self.authenticator.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = authenticator.get_connect_options().await;
                let _ = tx.send(Internal::AuthCompleted {
                    generation,
                    started,
                    result,
                });
            }
            .instrument(debug_span!("authenticate", generation)),
        );
    }

    async fn on_auth_completed(
        &mut self,
        generation: u64,
        started: Instant,
        result: Result<ConnectOptions, AuthError>,
    ) {
        if generation != self.auth_generation {
            debug!(generation, current = self.auth_generation, "Discarding stale auth result");
            return;
        }
        self.timers.cancel(TimerKind::AuthTimeout);
        self.set_authenticating(false);

        if self.flags.destroyed {
            self.dispatch(CourierEventKind::ConnectDiscarded {
                reason: DISCARD_DESTROYED.to_string(),
            });
            return;
        }

        let elapsed_ms = millis(started.elapsed());
        match result {
            Ok(options) => {
                info!(host = %options.host, port = options.port, elapsed_ms, "Authenticated");
                self.dispatch(CourierEventKind::AuthSuccess {
                    host: options.host.clone(),
                    port: options.port,
                    elapsed_ms,
                });
                self.auth_retry.reset();
                self.auth_failure_retry.reset();
                self.timers.cancel(TimerKind::AuthFailureReconnect);
                self.connection.connect(options).await;
            }
            Err(error) => {
                warn!(error = %error, elapsed_ms, "Authentication failed");
                self.dispatch(CourierEventKind::AuthFailure {
                    error: error.clone(),
                    elapsed_ms,
                });
                if error.is_network_unavailable() {
                    self.dispatch(CourierEventKind::ConnectionUnavailable);
                }

                if self.auth_retry.should_retry(&error) {
                    let delay = self.auth_retry.next_retry_delay();
                    info!(
                        attempt = self.auth_retry.retry_count(),
                        delay_ms = millis(delay),
                        "Retrying authentication"
                    );
                    self.timers.schedule(TimerKind::AuthRetry, delay);
                } else {
                    let secs = self.auth_failure_retry.next_interval_seconds();
                    self.timers
                        .schedule(TimerKind::AuthFailureReconnect, Duration::from_secs(secs));
                }
            }
        }
    }

    /// Drop the transport and cached credentials, then authenticate again
    async fn handle_auth_failure(&mut self) {
        self.connection.disconnect().await;
        self.authenticator.clear_cached_auth_response();
        self.connect(self.connect_source.clone()).await;
    }

    async fn disconnect(&mut self) {
        self.timers.cancel_all();
        self.auth_generation += 1;
        self.set_authenticating(false);
        self.connection.disconnect().await;
        self.dispatch(CourierEventKind::CourierDisconnect { clear_state: false });
    }

    async fn destroy(&mut self) {
        info!("Destroying session state");
        self.flags.destroyed = true;
        self.timers.cancel_all();
        self.set_authenticating(false);

        if let Err(e) = self.subscriptions.clear_all_subscriptions() {
            warn!(error = %e, "Failed to clear subscriptions");
        }
        if let Err(e) = self.connection.delete_all_persisted_messages() {
            warn!(error = %e, "Failed to delete outgoing messages");
        }
        self.receiver.clear_persisted_messages();

        self.connection.disconnect().await;
        self.dispatch(CourierEventKind::CourierDisconnect { clear_state: true });
    }

    async fn subscribe(&mut self, topics: Vec<(String, QoS)>) {
        if let Err(e) = self.subscriptions.subscribe(&topics) {
            warn!(error = %e, "Failed to persist subscriptions");
        }
        if self.connection.is_connected() {
            self.connection.subscribe(&topics).await;
        } else {
            debug!(count = topics.len(), "Not connected, subscribe deferred to reconnect");
        }
    }

    async fn unsubscribe(&mut self, topics: Vec<String>) {
        let topics: Vec<String> = topics
            .into_iter()
            .filter(|topic| !self.subscriptions.is_currently_pending_unsubscribe(topic))
            .collect();
        if topics.is_empty() {
            return;
        }

        if let Err(e) = self.subscriptions.unsubscribe(&topics) {
            warn!(error = %e, "Failed to persist unsubscribe");
        }
        if self.connection.is_connected() {
            self.connection.unsubscribe(&topics).await;
        }
    }

    /// Bring the broker in line with the desired subscription state
    async fn reconcile_subscriptions(&mut self) {
        let clean_session = self
            .connection
            .connect_options()
            .map(|options| options.clean_session)
            .unwrap_or(false);
        if clean_session {
            debug!("Clean session, clearing stored subscriptions");
            if let Err(e) = self.subscriptions.clear_all_subscriptions() {
                warn!(error = %e, "Failed to clear subscriptions");
            }
        }

        let mut pending: Vec<String> = self.subscriptions.pending_unsubscriptions().into_iter().collect();
        pending.sort();
        if !pending.is_empty() {
            self.connection.unsubscribe(&pending).await;
        }

        let mut desired: Vec<(String, QoS)> = self.subscriptions.subscriptions().into_iter().collect();
        desired.sort();
        if !desired.is_empty() {
            self.connection.subscribe(&desired).await;
        }
    }

    fn set_authenticating(&mut self, authenticating: bool) {
        self.flags.authenticating = authenticating;
        self.publish_flags();
    }

    fn publish_flags(&self) {
        self.flags_tx.send_replace(self.flags);
    }

    fn dispatch(&self, kind: CourierEventKind) {
        self.dispatch_event(CourierEvent::new(kind));
    }

    fn dispatch_event(&self, event: CourierEvent) {
        let info = self
            .connection
            .connect_options()
            .map(|options| options.connection_info());
        let event = event.with_connection_info(info);
        debug!(event = event.name(), "Session event");
        self.bus.dispatch(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rescheduled_timer_replaces_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        timers.schedule(TimerKind::AuthRetry, Duration::from_secs(1));
        timers.schedule(TimerKind::AuthRetry, Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut fired = Vec::new();
        while let Ok(Internal::TimerFired { kind, id }) = rx.try_recv() {
            fired.push(timers.take_fired(kind, id));
        }
        assert_eq!(fired, vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        timers.schedule(TimerKind::BackgroundGrace, Duration::from_secs(1));
        let id = timers.next_id;
        timers.cancel_all();
        assert!(!timers.take_fired(TimerKind::BackgroundGrace, id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
