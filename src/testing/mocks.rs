//! Mock implementations for testing
//!
//! Provides a recording [`Connection`], a scripted [`Authenticator`] and an
//! event recorder so the session can be exercised without a broker.

use crate::auth::{AuthError, Authenticator};
use crate::event::{CourierEvent, CourierEventKind, EventHandler, EventSink};
use crate::message::{MessageReceiver, MqttPacket, QoS};
use crate::store::StorageError;
use crate::transport::{ConnectOptions, Connection, TransportError, TransportState};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Every call made on a [`MockConnection`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCall {
    Connect(ConnectOptions),
    Disconnect,
    Reconnect,
    Publish(MqttPacket),
    Subscribe(Vec<(String, QoS)>),
    Unsubscribe(Vec<String>),
    DeleteAllPersistedMessages,
}

/// Mock transport for testing
pub struct MockConnection {
    calls: Mutex<Vec<ConnectionCall>>,
    state: Mutex<TransportState>,
    options: Mutex<Option<ConnectOptions>>,
    has_session: AtomicBool,
    auto_connect: bool,
    links: Mutex<Option<(EventSink, MessageReceiver)>>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(TransportState::Starting),
            options: Mutex::new(None),
            has_session: AtomicBool::new(false),
            auto_connect: false,
            links: Mutex::new(None),
        }
    }
}

impl MockConnection {
    /// Connects stay in `Connecting` until [`MockConnection::complete_connection`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects succeed immediately and (un)subscribes are acknowledged
    pub fn with_auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ConnectionCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn connect_calls(&self) -> Vec<ConnectOptions> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::Connect(options) => Some(options),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<(String, QoS)>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::Subscribe(topics) => Some(topics),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::Unsubscribe(topics) => Some(topics),
                _ => None,
            })
            .collect()
    }

    pub fn publish_calls(&self) -> Vec<MqttPacket> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::Publish(packet) => Some(packet),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ConnectionCall::Disconnect))
            .count()
    }

    pub fn set_state(&self, state: TransportState) {
        *lock(&self.state) = state;
    }

    pub fn set_existing_session(&self, exists: bool) {
        self.has_session.store(exists, Ordering::SeqCst);
    }

    /// Push an event as if the transport raised it
    pub fn emit(&self, kind: CourierEventKind) {
        if let Some((events, _)) = lock(&self.links).as_ref() {
            events.emit(kind);
        }
    }

    /// Hand a message to the receive path as if it arrived from the broker
    pub fn deliver(&self, packet: MqttPacket) {
        if let Some((_, receiver)) = lock(&self.links).as_ref() {
            receiver.message_arrived(packet);
        }
    }

    /// Simulate a CONNACK for the pending connect
    pub fn complete_connection(&self) {
        self.set_state(TransportState::Connected);
        self.set_existing_session(true);
        self.emit(CourierEventKind::ConnectionSuccess { elapsed_ms: 5 });
    }

    pub fn fail_connection(&self, error: TransportError) {
        self.set_state(TransportState::Closed);
        self.emit(CourierEventKind::ConnectionFailure {
            elapsed_ms: 5,
            error,
        });
    }

    pub fn lose_connection(&self, error: TransportError) {
        self.set_state(TransportState::Closed);
        self.emit(CourierEventKind::ConnectionLost {
            elapsed_ms: 1_000,
            error,
            idle_inbound_ms: 0,
            idle_outbound_ms: 0,
        });
    }

    fn record(&self, call: ConnectionCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn attach(&self, events: EventSink, receiver: MessageReceiver) {
        *lock(&self.links) = Some((events, receiver));
    }

    async fn connect(&self, options: ConnectOptions) {
        self.record(ConnectionCall::Connect(options.clone()));
        *lock(&self.options) = Some(options);
        self.set_state(TransportState::Connecting);
        self.emit(CourierEventKind::ConnectionAttempt);
        if self.auto_connect {
            self.complete_connection();
        }
    }

    async fn disconnect(&self) {
        self.record(ConnectionCall::Disconnect);
        let was_live = self.state().is_live();
        self.set_state(TransportState::Closed);
        if was_live {
            self.emit(CourierEventKind::ConnectionDisconnect);
        }
    }

    async fn reconnect(&self) {
        self.record(ConnectionCall::Reconnect);
        self.emit(CourierEventKind::Reconnect);
    }

    async fn publish(&self, packet: MqttPacket) {
        self.emit(CourierEventKind::MessageSend {
            topic: packet.topic.clone(),
            qos: packet.qos,
            size_bytes: packet.size(),
        });
        self.record(ConnectionCall::Publish(packet));
    }

    async fn subscribe(&self, topics: &[(String, QoS)]) {
        self.record(ConnectionCall::Subscribe(topics.to_vec()));
        self.emit(CourierEventKind::SubscribeAttempt {
            topics: topics.to_vec(),
        });
        if self.auto_connect {
            self.emit(CourierEventKind::SubscribeSuccess {
                topics: topics.to_vec(),
                elapsed_ms: 1,
            });
        }
    }

    async fn unsubscribe(&self, topics: &[String]) {
        self.record(ConnectionCall::Unsubscribe(topics.to_vec()));
        self.emit(CourierEventKind::UnsubscribeAttempt {
            topics: topics.to_vec(),
        });
        if self.auto_connect {
            self.emit(CourierEventKind::UnsubscribeSuccess {
                topics: topics.to_vec(),
                elapsed_ms: 1,
            });
        }
    }

    fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    fn has_existing_session(&self) -> bool {
        self.has_session.load(Ordering::SeqCst)
    }

    fn connect_options(&self) -> Option<ConnectOptions> {
        lock(&self.options).clone()
    }

    fn delete_all_persisted_messages(&self) -> Result<(), StorageError> {
        self.record(ConnectionCall::DeleteAllPersistedMessages);
        Ok(())
    }
}

/// Mock authenticator with scripted responses
pub struct MockAuthenticator {
    client_id: String,
    options: ConnectOptions,
    scripted: Mutex<VecDeque<Result<ConnectOptions, AuthError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    cache_clears: AtomicUsize,
}

impl MockAuthenticator {
    /// Always answers with `options` once the script is exhausted
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            client_id: options.client_id.clone(),
            options,
            scripted: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
        }
    }

    /// Delay every response, e.g. to exercise the auth timeout
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: Result<ConnectOptions, AuthError>) {
        lock(&self.scripted).push_back(response);
    }

    pub fn push_failure(&self, error: AuthError) {
        self.push_response(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cache_clear_count(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn get_connect_options(&self) -> Result<ConnectOptions, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.scripted).pop_front();
        scripted.unwrap_or_else(|| Ok(self.options.clone()))
    }

    fn clear_cached_auth_response(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Event handler that keeps every event it sees
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<CourierEvent>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CourierEvent> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(CourierEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    pub fn discard_reasons(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match &event.kind {
                CourierEventKind::ConnectDiscarded { reason } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventHandler for RecordingEventHandler {
    fn on_event(&self, event: &CourierEvent) {
        lock(&self.events).push(event.clone());
    }
}
