//! Public session handle and its builder

use super::stream::{Decoder, TopicStream};
use super::worker::{Command, SessionParts, SessionWorker};
use super::{ConnectionState, SessionConfig, SessionFlags};
use crate::auth::Authenticator;
use crate::error::{CourierError, CourierResult};
use crate::event::{CourierEvent, CourierEventKind, EventBus, EventHandler, EventSink, HandlerId};
use crate::message::{MessageAdaptersCoordinator, MessageReceiver, MqttPacket, QoS};
use crate::store::{
    temporary_database, IncomingMessagePersistence, OutgoingMessagePersistence, SubscriptionStore,
};
use crate::topic;
use crate::transport::mqtt::{MqttConnection, TransportSettings};
use crate::transport::{ConnectOptions, Connection, TransportState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn, Instrument};

pub struct SessionBuilder {
    authenticator: Arc<dyn Authenticator>,
    config: SessionConfig,
    transport: TransportSettings,
    adapters: MessageAdaptersCoordinator,
    db: Option<Db>,
    connection: Option<Arc<dyn Connection>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport_settings(mut self, settings: TransportSettings) -> Self {
        self.transport = settings;
        self
    }

    pub fn adapters(mut self, adapters: MessageAdaptersCoordinator) -> Self {
        self.adapters = adapters;
        self
    }

    /// Durable store; an in-memory database is used when none is given
    pub fn database(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    /// Replace the rumqttc transport, mainly for tests
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Open the stores and spawn the workers; must run inside a Tokio runtime
    pub fn build(self) -> CourierResult<SessionManager> {
        let client_id = self.authenticator.client_id();
        let db = match self.db {
            Some(db) => db,
            None => temporary_database()?,
        };

        let subscriptions = SubscriptionStore::open(&db, &client_id)?;
        let incoming = if self.config.receiver.persistence_enabled() {
            Some(IncomingMessagePersistence::open(&db, &client_id)?)
        } else {
            None
        };
        let connection: Arc<dyn Connection> = match self.connection {
            Some(connection) => connection,
            None => Arc::new(MqttConnection::new(
                self.transport,
                Some(OutgoingMessagePersistence::open(&db, &client_id)?),
            )),
        };

        let receiver = MessageReceiver::start(incoming, self.config.receiver);
        let (events, events_rx) = EventSink::channel();
        connection.attach(events.clone(), receiver.clone());

        let bus = EventBus::new();
        for handler in self.handlers {
            bus.add_event_handler(handler);
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (flags_tx, flags) = watch::channel(SessionFlags::default());
        let worker = SessionWorker::new(SessionParts {
            authenticator: self.authenticator,
            connection: connection.clone(),
            subscriptions: subscriptions.clone(),
            receiver: receiver.clone(),
            bus: bus.clone(),
            config: self.config,
            flags_tx,
        });
        tokio::spawn(
            worker
                .run(commands_rx, events_rx)
                .instrument(crate::session_span!(client_id = %client_id)),
        );
        info!(client_id = %client_id, "Session created");

        Ok(SessionManager {
            inner: Arc::new(Inner {
                client_id,
                commands,
                connection,
                subscriptions,
                receiver,
                adapters: Arc::new(self.adapters),
                bus,
                events,
                flags,
            }),
        })
    }
}

struct Inner {
    client_id: String,
    commands: mpsc::UnboundedSender<Command>,
    connection: Arc<dyn Connection>,
    subscriptions: SubscriptionStore,
    receiver: MessageReceiver,
    adapters: Arc<MessageAdaptersCoordinator>,
    bus: EventBus,
    events: EventSink,
    flags: watch::Receiver<SessionFlags>,
}

/// Handle to a persistent MQTT session.
///
/// Cheap to clone; the worker stops and disconnects once every clone is
/// dropped. State-changing calls return immediately and report their
/// outcome through events.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(authenticator: Arc<dyn Authenticator>) -> SessionBuilder {
        SessionBuilder {
            authenticator,
            config: SessionConfig::default(),
            transport: TransportSettings::default(),
            adapters: MessageAdaptersCoordinator::default(),
            db: None,
            connection: None,
            handlers: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    fn send(&self, command: Command) -> CourierResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| CourierError::WorkerStopped)
    }

    fn send_lifecycle(&self, command: Command) {
        if let Err(e) = self.send(command) {
            warn!(error = %e, "Session command dropped");
        }
    }

    pub fn connect(&self) {
        self.send_lifecycle(Command::Connect { source: None });
    }

    /// Connect, recording `source` in the `AuthStart` event
    pub fn connect_with_source(&self, source: impl Into<String>) {
        self.send_lifecycle(Command::Connect {
            source: Some(source.into()),
        });
    }

    /// Tear down the transport; subscriptions and messages are kept
    pub fn disconnect(&self) {
        self.send_lifecycle(Command::Disconnect);
    }

    /// Purge every persisted subscription and message, then disconnect
    pub fn destroy(&self) {
        self.send_lifecycle(Command::Destroy);
    }

    pub fn subscribe<S: Into<String>>(
        &self,
        topics: impl IntoIterator<Item = (S, QoS)>,
    ) -> CourierResult<()> {
        let topics = topics
            .into_iter()
            .map(|(topic, qos)| {
                let topic = topic.into();
                topic::validate_filter(&topic)?;
                Ok((topic, qos))
            })
            .collect::<CourierResult<Vec<_>>>()?;
        if topics.is_empty() {
            return Ok(());
        }
        self.send(Command::Subscribe(topics))
    }

    pub fn unsubscribe<S: Into<String>>(&self, topics: impl IntoIterator<Item = S>) -> CourierResult<()> {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Ok(());
        }
        self.send(Command::Unsubscribe(topics))
    }

    /// Encode `value` through the adapters and publish it
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T, qos: QoS) -> CourierResult<()> {
        self.ensure_session()?;
        let payload = match self.inner.adapters.encode(value) {
            Ok(payload) => payload,
            Err(e) => {
                self.inner.events.emit(CourierEventKind::MessageSendFailure {
                    topic: topic.to_string(),
                    qos,
                    error: e.to_string(),
                    size_bytes: 0,
                });
                return Err(CourierError::encoding(e.to_string()));
            }
        };
        self.send(Command::Publish(MqttPacket::new(topic, payload, qos)))
    }

    /// Publish raw bytes without going through the adapters
    pub fn publish_bytes(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) -> CourierResult<()> {
        self.ensure_session()?;
        self.send(Command::Publish(MqttPacket::new(topic, payload, qos)))
    }

    fn ensure_session(&self) -> CourierResult<()> {
        if self.inner.connection.has_existing_session() {
            Ok(())
        } else {
            Err(CourierError::SessionNotExist)
        }
    }

    /// Stream of messages on `filter`, decoded through the adapters
    pub fn receive<T>(&self, filter: &str) -> CourierResult<TopicStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let adapters = self.inner.adapters.clone();
        self.attach(filter, Box::new(move |payload| adapters.decode(payload)))
    }

    /// Stream of raw payloads on `filter`
    pub fn receive_bytes(&self, filter: &str) -> CourierResult<TopicStream<Vec<u8>>> {
        self.attach(filter, Box::new(|payload| Ok(payload.to_vec())))
    }

    fn attach<T>(&self, filter: &str, decode: Decoder<T>) -> CourierResult<TopicStream<T>> {
        topic::validate_filter(filter)?;
        let (token, rx) = self.inner.receiver.attach(filter);
        Ok(TopicStream::new(rx, token, decode, self.inner.events.clone()))
    }

    pub fn app_foreground(&self) {
        self.send_lifecycle(Command::AppForeground);
    }

    pub fn app_background(&self) {
        self.send_lifecycle(Command::AppBackground);
    }

    pub fn network_available(&self) {
        self.send_lifecycle(Command::NetworkAvailable);
    }

    pub fn network_unavailable(&self) {
        self.send_lifecycle(Command::NetworkUnavailable);
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.inner.bus.add_event_handler(handler)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.inner.bus.remove_event_handler(id)
    }

    /// Install a nested client that observes every event after the plain handlers
    pub fn set_composed_client(&self, client: Option<Arc<dyn EventHandler>>) {
        self.inner.bus.set_composed_client(client);
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.inner.connection.state() {
            TransportState::Connected => ConnectionState::Connected,
            TransportState::Connecting => ConnectionState::Connecting,
            _ if self.inner.flags.borrow().authenticating => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.flags.borrow().destroyed
    }

    pub fn has_existing_session(&self) -> bool {
        self.inner.connection.has_existing_session()
    }

    pub fn subscriptions(&self) -> HashMap<String, QoS> {
        self.inner.subscriptions.subscriptions()
    }

    pub fn pending_unsubscriptions(&self) -> HashSet<String> {
        self.inner.subscriptions.pending_unsubscriptions()
    }

    pub fn connect_options(&self) -> Option<ConnectOptions> {
        self.inner.connection.connect_options()
    }

    /// Wait until every call made so far, and the events it queued, are handled
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.send(Command::Sync(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        self.inner.receiver.sync().await;
    }
}

/// A session composed into another client's bus follows its lifecycle signals
impl EventHandler for SessionManager {
    fn on_event(&self, event: &CourierEvent) {
        match event.kind {
            CourierEventKind::AppForeground => self.app_foreground(),
            CourierEventKind::AppBackground => self.app_background(),
            CourierEventKind::ConnectionAvailable => self.network_available(),
            _ => {}
        }
    }
}
