//! Impure I/O for the MQTT transport
//!
//! Owns the rumqttc client and a supervisor task that polls the event loop,
//! reports every transition as an event, applies the timeout policies and
//! rebuilds the event loop after failures using the retry policy.

use super::connection::{classify_connection_error, configure_mqtt_options, TransportSettings};
use super::health_monitor::{HealthDecision, HealthMonitor, PingCheck};
use super::message_handler::{
    MessageHandler, PendingPublish, PendingSubscribe, PendingUnsubscribe, RequestTracker,
    TransportRoute,
};
use crate::event::{millis, CourierEventKind, EventSink};
use crate::message::{MessageReceiver, MqttPacket, QoS};
use crate::policy::ConnectRetryPolicy;
use crate::store::{OutgoingMessagePersistence, StorageError};
use crate::transport::{
    ConnectOptions, Connection, TransportError, TransportErrorKind, TransportState,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use rumqttc::Outgoing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

fn wire_qos(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

#[derive(Clone)]
struct Links {
    events: EventSink,
    receiver: MessageReceiver,
}

/// State shared between the public handle and the supervisor task
struct Shared {
    client: Mutex<Option<AsyncClient>>,
    state_tx: watch::Sender<TransportState>,
    tracker: std::sync::Mutex<RequestTracker>,
    links: RwLock<Option<Links>>,
    options: RwLock<Option<ConnectOptions>>,
    has_session: AtomicBool,
    outgoing: Option<OutgoingMessagePersistence>,
}

impl Shared {
    fn emit(&self, kind: CourierEventKind) {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(links) = links.as_ref() {
            links.events.emit(kind);
        }
    }

    fn deliver(&self, packet: MqttPacket) {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        match links.as_ref() {
            Some(links) => links.receiver.message_arrived(packet),
            None => debug!(topic = %packet.topic, "No receiver attached, dropping message"),
        }
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Transport state changed");
        }
    }

    fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    fn tracker(&self) -> MutexGuard<'_, RequestTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_flow(&self, id: &str) {
        if let Some(store) = &self.outgoing {
            if let Err(e) = store.remove(id) {
                warn!(id, error = %e, "Failed to remove outgoing flow");
            }
        }
    }

    fn is_flow_persisted(&self, qos: QoS) -> bool {
        qos.is_persistent() && self.outgoing.is_some()
    }

    /// Hand a publish to rumqttc; the tracker entry is queued under the client lock
    fn send_publish(&self, client: &AsyncClient, packet: &MqttPacket) -> Result<(), String> {
        self.tracker()
            .queue_publish(PendingPublish::from_packet(packet, Instant::now()));
        client
            .try_publish(
                packet.topic.clone(),
                wire_qos(packet.qos),
                packet.retained,
                packet.payload.clone(),
            )
            .map_err(|e| {
                self.tracker().unqueue_publish();
                e.to_string()
            })
    }

    /// Forget requests owned by a dead event loop
    fn abandon_requests(&self) {
        let abandoned = self.tracker().clear();
        for publish in abandoned {
            if self.is_flow_persisted(publish.qos) {
                continue;
            }
            self.emit(CourierEventKind::MessageSendFailure {
                topic: publish.topic,
                qos: publish.qos,
                error: "connection lost before the publish completed".to_string(),
                size_bytes: publish.size_bytes,
            });
        }
    }
}

struct Supervisor {
    options: ConnectOptions,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// rumqttc-backed [`Connection`]
pub struct MqttConnection {
    settings: TransportSettings,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl MqttConnection {
    pub fn new(settings: TransportSettings, outgoing: Option<OutgoingMessagePersistence>) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Starting);
        Self {
            settings,
            shared: Arc::new(Shared {
                client: Mutex::new(None),
                state_tx,
                tracker: std::sync::Mutex::new(RequestTracker::new()),
                links: RwLock::new(None),
                options: RwLock::new(None),
                has_session: AtomicBool::new(false),
                outgoing,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Watch transport state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state_tx.subscribe()
    }

    async fn start(&self, options: ConnectOptions) -> Result<Supervisor, TransportError> {
        let mqtt_options = configure_mqtt_options(&options, &self.settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.settings.request_capacity);

        *self.shared.client.lock().await = Some(client);
        self.shared.tracker().clear();
        self.shared.set_state(TransportState::Connecting);
        self.shared.emit(CourierEventKind::ConnectionAttempt);
        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor_loop = SupervisorLoop {
            shared: self.shared.clone(),
            settings: self.settings.clone(),
            options: options.clone(),
            retry: ConnectRetryPolicy::from_config(&self.settings.retry),
            health: HealthMonitor::new(Instant::now()),
        };
        let span = crate::transport_span!(client_id = %options.client_id);
        let handle = tokio::spawn(supervisor_loop.run(event_loop, shutdown_rx).instrument(span));

        Ok(Supervisor {
            options,
            shutdown_tx,
            handle,
        })
    }

    /// Graceful shutdown coordination with the supervisor task
    async fn shutdown(&self, supervisor: Supervisor) {
        let was_live = self.shared.state().is_live();
        self.shared.set_state(TransportState::Closing);

        // Queue DISCONNECT before stopping so the supervisor can flush it
        if let Some(client) = self.shared.client.lock().await.as_ref() {
            let _ = client.try_disconnect();
        }
        let _ = supervisor.shutdown_tx.send(true);

        let mut handle = supervisor.handle;
        match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
            Ok(Ok(())) => debug!("Supervisor task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Supervisor task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Supervisor task didn't shut down gracefully, aborting");
                handle.abort();
            }
        }

        *self.shared.client.lock().await = None;
        self.shared.abandon_requests();
        self.shared.set_state(TransportState::Closed);
        if was_live {
            self.shared.emit(CourierEventKind::ConnectionDisconnect);
        }
        info!("MQTT transport disconnected");
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.try_lock() {
            if let Some(supervisor) = supervisor.take() {
                supervisor.handle.abort();
            }
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    fn attach(&self, events: EventSink, receiver: MessageReceiver) {
        let mut links = self.shared.links.write().unwrap_or_else(PoisonError::into_inner);
        *links = Some(Links { events, receiver });
    }

    async fn connect(&self, options: ConnectOptions) {
        let mut supervisor = self.supervisor.lock().await;

        if let Some(current) = supervisor.as_ref() {
            let state = self.shared.state();
            if current.options == options && state.is_live() {
                debug!(%state, "Connect ignored, transport already live with these options");
                return;
            }
        }
        if let Some(current) = supervisor.take() {
            self.shutdown(current).await;
        }

        *self
            .shared
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(options.clone());

        match self.start(options).await {
            Ok(started) => *supervisor = Some(started),
            Err(error) => {
                error!(error = %error, "Cannot build MQTT connection");
                self.shared.emit(CourierEventKind::ConnectionFailure {
                    elapsed_ms: 0,
                    error,
                });
                self.shared.set_state(TransportState::Error);
                self.shared.set_state(TransportState::Closed);
            }
        }
    }

    async fn disconnect(&self) {
        let mut supervisor = self.supervisor.lock().await;
        match supervisor.take() {
            Some(current) => self.shutdown(current).await,
            None => debug!("Disconnect ignored, transport not started"),
        }
    }

    async fn reconnect(&self) {
        let Some(options) = self.connect_options() else {
            debug!("Reconnect ignored, no connect options");
            return;
        };
        if self.shared.state().is_live() {
            debug!("Reconnect ignored, transport already live");
            return;
        }
        self.shared.emit(CourierEventKind::Reconnect);
        self.connect(options).await;
    }

    async fn publish(&self, packet: MqttPacket) {
        self.shared.emit(CourierEventKind::MessageSend {
            topic: packet.topic.clone(),
            qos: packet.qos,
            size_bytes: packet.size(),
        });

        let persisted = self.shared.is_flow_persisted(packet.qos);
        if persisted {
            if let Some(store) = &self.shared.outgoing {
                if let Err(e) = store.save(&packet) {
                    self.shared.emit(CourierEventKind::MessageSendFailure {
                        topic: packet.topic.clone(),
                        qos: packet.qos,
                        error: format!("cannot persist outgoing flow: {e}"),
                        size_bytes: packet.size(),
                    });
                    return;
                }
            }
        }

        let client = self.shared.client.lock().await;
        let Some(client) = client.as_ref() else {
            if persisted {
                debug!(id = %packet.id, "Transport not started, flow kept for replay");
            } else {
                self.shared.emit(CourierEventKind::MessageSendFailure {
                    topic: packet.topic.clone(),
                    qos: packet.qos,
                    error: "not connected".to_string(),
                    size_bytes: packet.size(),
                });
            }
            return;
        };

        if let Err(error) = self.shared.send_publish(client, &packet) {
            self.shared.remove_flow(&packet.id);
            self.shared.emit(CourierEventKind::MessageSendFailure {
                topic: packet.topic.clone(),
                qos: packet.qos,
                error,
                size_bytes: packet.size(),
            });
        }
    }

    async fn subscribe(&self, topics: &[(String, QoS)]) {
        if topics.is_empty() {
            return;
        }
        self.shared.emit(CourierEventKind::SubscribeAttempt {
            topics: topics.to_vec(),
        });

        let client = self.shared.client.lock().await;
        let Some(client) = client.as_ref() else {
            self.shared.emit(CourierEventKind::SubscribeFailure {
                topics: topics.to_vec(),
                error: "not connected".to_string(),
                elapsed_ms: 0,
            });
            return;
        };

        for (topic, qos) in topics {
            self.shared.tracker().queue_subscribe(PendingSubscribe {
                topics: vec![(topic.clone(), *qos)],
                sent_at: Instant::now(),
            });
            if let Err(e) = client.try_subscribe(topic.clone(), wire_qos(*qos)) {
                self.shared.tracker().unqueue_subscribe();
                self.shared.emit(CourierEventKind::SubscribeFailure {
                    topics: vec![(topic.clone(), *qos)],
                    error: e.to_string(),
                    elapsed_ms: 0,
                });
            }
        }
    }

    async fn unsubscribe(&self, topics: &[String]) {
        if topics.is_empty() {
            return;
        }
        self.shared.emit(CourierEventKind::UnsubscribeAttempt {
            topics: topics.to_vec(),
        });

        let client = self.shared.client.lock().await;
        let Some(client) = client.as_ref() else {
            self.shared.emit(CourierEventKind::UnsubscribeFailure {
                topics: topics.to_vec(),
                error: "not connected".to_string(),
                elapsed_ms: 0,
            });
            return;
        };

        for topic in topics {
            self.shared.tracker().queue_unsubscribe(PendingUnsubscribe {
                topic: topic.clone(),
                sent_at: Instant::now(),
            });
            if let Err(e) = client.try_unsubscribe(topic.clone()) {
                self.shared.tracker().unqueue_unsubscribe();
                self.shared.emit(CourierEventKind::UnsubscribeFailure {
                    topics: vec![topic.clone()],
                    error: e.to_string(),
                    elapsed_ms: 0,
                });
            }
        }
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn has_existing_session(&self) -> bool {
        self.shared.has_session.load(Ordering::SeqCst)
    }

    fn connect_options(&self) -> Option<ConnectOptions> {
        self.shared
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn delete_all_persisted_messages(&self) -> Result<(), StorageError> {
        if let Some(store) = &self.shared.outgoing {
            let removed = store.delete_all()?;
            debug!(removed, "Deleted outgoing flows");
        }
        Ok(())
    }
}

/// Reconnection supervisor running on its own task
struct SupervisorLoop {
    shared: Arc<Shared>,
    settings: TransportSettings,
    options: ConnectOptions,
    retry: ConnectRetryPolicy,
    health: HealthMonitor,
}

impl SupervisorLoop {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HealthMonitor::tick_interval(
            &self.settings.connect_timeout,
            &self.settings.idle_timeout,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        Self::drain_disconnect(&mut event_loop).await;
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let decision = self.health.evaluate(
                        Instant::now(),
                        &self.settings.connect_timeout,
                        &self.settings.idle_timeout,
                    );
                    let error = match decision {
                        HealthDecision::Healthy => continue,
                        HealthDecision::ConnectTimedOut(error) | HealthDecision::Idle(error) => error,
                    };
                    if !self.recover(error, &mut event_loop, &shutdown_rx).await {
                        break;
                    }
                }

                result = event_loop.poll() => {
                    let failure = match result {
                        Ok(event) => self.handle_event(event).await,
                        Err(e) => {
                            let error = classify_connection_error(&e);
                            if error.kind == TransportErrorKind::KeepAlive {
                                self.report_ping_failure(&error);
                            }
                            Some(error)
                        }
                    };
                    if let Some(error) = failure {
                        if !self.recover(error, &mut event_loop, &shutdown_rx).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!("MQTT supervisor stopped");
    }

    /// Give a queued DISCONNECT a moment to reach the broker
    async fn drain_disconnect(event_loop: &mut EventLoop) {
        let _ = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }

    /// Returns an error when the event means the session is dead
    async fn handle_event(&mut self, event: Event) -> Option<TransportError> {
        let now = Instant::now();
        match MessageHandler::route_mqtt_event(&event) {
            TransportRoute::ConnectionAcknowledged { session_present } => {
                let elapsed = self.health.attempt_elapsed(now);
                self.health.connected(now);
                self.retry.reset();
                self.shared.has_session.store(true, Ordering::SeqCst);
                self.shared.set_state(TransportState::Connected);
                info!(session_present, elapsed_ms = millis(elapsed), "MQTT connection established");
                self.shared.emit(CourierEventKind::ConnectionSuccess {
                    elapsed_ms: millis(elapsed),
                });
                self.replay_outgoing_flows().await;
            }
            TransportRoute::MessageReceived(packet) => {
                self.health.record_inbound(now);
                debug!(topic = %packet.topic, qos = packet.qos.as_u8(), "Received MQTT message");
                self.shared.emit(CourierEventKind::MessageReceive {
                    topic: packet.topic.clone(),
                    size_bytes: packet.size(),
                });
                self.shared.deliver(packet);
            }
            TransportRoute::PublishAcknowledged { pkid, success } => {
                self.health.record_inbound(now);
                let acked = self.shared.tracker().publish_acked(pkid);
                if let Some(publish) = acked {
                    self.shared.remove_flow(&publish.id);
                    self.emit_publish_outcome(publish, success);
                }
            }
            TransportRoute::SubscribeAcknowledged { pkid, failures } => {
                self.health.record_inbound(now);
                let pending = self.shared.tracker().subscribe_acked(pkid);
                if let Some(subscribe) = pending {
                    let elapsed_ms = millis(now.saturating_duration_since(subscribe.sent_at));
                    if failures.is_empty() {
                        self.shared.emit(CourierEventKind::SubscribeSuccess {
                            topics: subscribe.topics,
                            elapsed_ms,
                        });
                    } else {
                        self.shared.emit(CourierEventKind::SubscribeFailure {
                            topics: subscribe.topics,
                            error: failures.join(", "),
                            elapsed_ms,
                        });
                    }
                }
            }
            TransportRoute::UnsubscribeAcknowledged { pkid, failures } => {
                self.health.record_inbound(now);
                let pending = self.shared.tracker().unsubscribe_acked(pkid);
                if let Some(unsubscribe) = pending {
                    let elapsed_ms = millis(now.saturating_duration_since(unsubscribe.sent_at));
                    if failures.is_empty() {
                        self.shared.emit(CourierEventKind::UnsubscribeSuccess {
                            topics: vec![unsubscribe.topic],
                            elapsed_ms,
                        });
                    } else {
                        self.shared.emit(CourierEventKind::UnsubscribeFailure {
                            topics: vec![unsubscribe.topic],
                            error: failures.join(", "),
                            elapsed_ms,
                        });
                    }
                }
            }
            TransportRoute::PingResponse => {
                let rtt = self.health.pong_received(now);
                self.shared.emit(CourierEventKind::PongReceived {
                    elapsed_ms: millis(rtt),
                });
            }
            TransportRoute::BrokerDisconnect(reason) => {
                return Some(TransportError::new(
                    TransportErrorKind::ClosedByBroker,
                    format!("broker sent DISCONNECT: {reason}"),
                ));
            }
            TransportRoute::PublishSent(pkid) => {
                self.health.record_outbound(now);
                let completed = self.shared.tracker().publish_sent(pkid);
                if let Some(publish) = completed {
                    self.emit_publish_outcome(publish, true);
                }
            }
            TransportRoute::SubscribeSent(pkid) => {
                self.health.record_outbound(now);
                self.shared.tracker().subscribe_sent(pkid);
            }
            TransportRoute::UnsubscribeSent(pkid) => {
                self.health.record_outbound(now);
                self.shared.tracker().unsubscribe_sent(pkid);
            }
            TransportRoute::PingSent => {
                self.shared.emit(CourierEventKind::Ping {
                    host: self.options.host.clone(),
                });
                let check = self.health.ping_sent(now);
                if let PingCheck::Missed { waited } = check {
                    if self.settings.keep_alive_supervision {
                        let error = TransportError::new(
                            TransportErrorKind::KeepAlive,
                            format!("previous ping unanswered after {}ms", waited.as_millis()),
                        );
                        self.shared.emit(CourierEventKind::PingFailure {
                            elapsed_ms: millis(waited),
                            error: error.message.clone(),
                        });
                        return Some(error);
                    }
                }
            }
            TransportRoute::InboundTraffic => self.health.record_inbound(now),
            TransportRoute::OutboundTraffic => self.health.record_outbound(now),
        }
        None
    }

    fn emit_publish_outcome(&self, publish: PendingPublish, success: bool) {
        if success {
            self.shared.emit(CourierEventKind::MessageSendSuccess {
                topic: publish.topic,
                qos: publish.qos,
                size_bytes: publish.size_bytes,
            });
        } else {
            self.shared.emit(CourierEventKind::MessageSendFailure {
                topic: publish.topic,
                qos: publish.qos,
                error: "rejected by broker".to_string(),
                size_bytes: publish.size_bytes,
            });
        }
    }

    fn report_ping_failure(&self, error: &TransportError) {
        let waited = self
            .health
            .outstanding_ping(Instant::now())
            .unwrap_or_default();
        self.shared.emit(CourierEventKind::PingFailure {
            elapsed_ms: millis(waited),
            error: error.message.clone(),
        });
    }

    /// Re-send flows this event loop has not seen, oldest first
    async fn replay_outgoing_flows(&self) {
        let Some(store) = &self.shared.outgoing else {
            return;
        };
        let flows = match store.flows() {
            Ok(flows) => flows,
            Err(e) => {
                warn!(error = %e, "Cannot load outgoing flows for replay");
                return;
            }
        };
        if flows.is_empty() {
            return;
        }

        let client = self.shared.client.lock().await;
        let Some(client) = client.as_ref() else {
            return;
        };
        let in_flight = self.shared.tracker().in_flight_ids();

        let mut replayed = 0usize;
        for flow in flows.into_iter().filter(|flow| !in_flight.contains(&flow.id)) {
            let packet = MqttPacket::from(flow);
            if let Err(e) = self.shared.send_publish(client, &packet) {
                warn!(error = %e, "Outgoing replay stopped, request queue full");
                break;
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "Replayed unacknowledged publishes");
        }
    }

    /// Report the failure and schedule the next attempt.
    /// Returns false when the supervisor should stop.
    async fn recover(
        &mut self,
        error: TransportError,
        event_loop: &mut EventLoop,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        // Publishes during the backoff must land in the flow store, not the dead client
        *self.shared.client.lock().await = None;

        let now = Instant::now();
        if self.health.is_connected() {
            warn!(error = %error, "MQTT connection lost");
            self.shared.emit(CourierEventKind::ConnectionLost {
                elapsed_ms: millis(self.health.elapsed(now)),
                error: error.clone(),
                idle_inbound_ms: millis(self.health.idle_inbound(now)),
                idle_outbound_ms: millis(self.health.idle_outbound(now)),
            });
        } else {
            warn!(error = %error, "MQTT connect attempt failed");
            self.shared.emit(CourierEventKind::ConnectionFailure {
                elapsed_ms: millis(self.health.attempt_elapsed(now)),
                error: error.clone(),
            });
        }

        self.shared.set_state(TransportState::Error);
        self.shared.set_state(TransportState::Closed);
        self.shared.abandon_requests();

        if error.is_authentication() {
            info!("Broker rejected credentials, waiting for re-authentication");
            return false;
        }

        let delay = self.retry.next_interval_seconds();
        info!(delay_secs = delay, "Scheduling MQTT reconnect");
        if !interruptible_sleep(shutdown_rx.clone(), Duration::from_secs(delay)).await {
            return false;
        }
        if *shutdown_rx.borrow() {
            info!("Shutdown signal received, aborting reconnection");
            return false;
        }

        self.apply_new_connection(event_loop).await
    }

    /// Replace the event loop and shared client for the next attempt
    async fn apply_new_connection(&mut self, event_loop: &mut EventLoop) -> bool {
        match configure_mqtt_options(&self.options, &self.settings) {
            Ok(mqtt_options) => {
                let (client, new_event_loop) =
                    AsyncClient::new(mqtt_options, self.settings.request_capacity);
                let mut shared_client = self.shared.client.lock().await;
                self.shared.abandon_requests();
                *event_loop = new_event_loop;
                *shared_client = Some(client);
                drop(shared_client);
                self.health.start_attempt(Instant::now());
                self.shared.set_state(TransportState::Connecting);
                self.shared.emit(CourierEventKind::ConnectionAttempt);
                true
            }
            Err(error) => {
                error!(error = %error, "Failed to create new connection");
                self.shared.emit(CourierEventKind::ConnectionFailure {
                    elapsed_ms: 0,
                    error,
                });
                false
            }
        }
    }
}

/// Sleep unless shutdown is requested first; returns false on shutdown
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CourierEvent;
    use crate::message::ReceiverConfig;
    use crate::policy::RetryConfig;
    use crate::store::temporary_database;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> TransportSettings {
        TransportSettings::default()
    }

    /// Read one MQTT control packet; returns the first header byte and the body
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn next_event(rx: &mut UnboundedReceiver<CourierEvent>) -> CourierEventKind {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event should arrive")
            .expect("event channel open")
            .kind
    }

    #[tokio::test]
    async fn test_new_connection_is_starting() {
        let connection = MqttConnection::new(settings(), None);
        assert_eq!(connection.state(), TransportState::Starting);
        assert!(!connection.has_existing_session());
        assert!(connection.connect_options().is_none());
    }

    #[tokio::test]
    async fn test_invalid_options_report_connection_failure() {
        let connection = MqttConnection::new(settings(), None);
        let (events, mut rx) = EventSink::channel();
        connection.attach(events, MessageReceiver::start(None, ReceiverConfig::default()));

        connection.connect(ConnectOptions::new("", 1883, "client")).await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, CourierEventKind::ConnectionFailure { .. }));
        assert_eq!(connection.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_publish_without_transport_keeps_persistent_flow() {
        let db = temporary_database().unwrap();
        let outgoing = OutgoingMessagePersistence::open(&db, "client").unwrap();
        let connection = MqttConnection::new(settings(), Some(outgoing.clone()));
        let (events, mut rx) = EventSink::channel();
        connection.attach(events, MessageReceiver::start(None, ReceiverConfig::default()));

        connection
            .publish(MqttPacket::new("t", b"x".to_vec(), QoS::AtLeastOnce))
            .await;
        assert_eq!(outgoing.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::MessageSend { .. }
        ));

        connection
            .publish(MqttPacket::new("t", b"y".to_vec(), QoS::AtMostOnce))
            .await;
        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::MessageSendFailure { .. }
        ));

        connection.delete_all_persisted_messages().unwrap();
        assert!(outgoing.is_empty());
    }

    #[tokio::test]
    async fn test_publish_during_reconnect_backoff_is_sent_after_connack() {
        // Reserve a port, then close it so the first attempt is refused
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let db = temporary_database().unwrap();
        let outgoing = OutgoingMessagePersistence::open(&db, "backoff").unwrap();
        let transport_settings = TransportSettings {
            retry: RetryConfig {
                base_secs: 2,
                max_secs: 2,
            },
            ..settings()
        };
        let connection = MqttConnection::new(transport_settings, Some(outgoing.clone()));
        let (events, mut rx) = EventSink::channel();
        connection.attach(events, MessageReceiver::start(None, ReceiverConfig::default()));

        connection
            .connect(ConnectOptions::new("127.0.0.1", port, "backoff"))
            .await;
        loop {
            if let CourierEventKind::ConnectionFailure { .. } = next_event(&mut rx).await {
                break;
            }
        }

        connection
            .publish(MqttPacket::new(
                "orders/1",
                b"during-backoff".to_vec(),
                QoS::AtLeastOnce,
            ))
            .await;
        assert_eq!(outgoing.len(), 1);
        assert!(connection.shared.tracker().in_flight_ids().is_empty());

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (mut broker, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("transport should retry")
            .unwrap();

        let (connect, _) = read_packet(&mut broker).await;
        assert_eq!(connect, 0x10);
        broker.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await.unwrap();

        let (publish, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut broker))
            .await
            .expect("flow should be replayed after CONNACK");
        assert_eq!(publish & 0xf0, 0x30);
        assert!(body.windows(14).any(|w| w == b"during-backoff"));

        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let pkid = &body[2 + topic_len..4 + topic_len];
        broker.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();

        loop {
            if let CourierEventKind::MessageSendSuccess { topic, .. } = next_event(&mut rx).await {
                assert_eq!(topic, "orders/1");
                break;
            }
        }
        assert!(outgoing.is_empty());
        assert!(connection.shared.tracker().in_flight_ids().is_empty());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_without_transport_fails_fast() {
        let connection = MqttConnection::new(settings(), None);
        let (events, mut rx) = EventSink::channel();
        connection.attach(events, MessageReceiver::start(None, ReceiverConfig::default()));

        connection
            .subscribe(&[("a/b".to_string(), QoS::AtLeastOnce)])
            .await;

        assert!(matches!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::SubscribeAttempt { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            CourierEventKind::SubscribeFailure { .. }
        ));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(rx, Duration::from_secs(60)));
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_without_options_is_noop() {
        let connection = MqttConnection::new(settings(), None);
        connection.reconnect().await;
        assert_eq!(connection.state(), TransportState::Starting);
    }
}
