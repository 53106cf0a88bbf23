//! Command and callback surface for host platforms
//!
//! [`PlatformBridge`] is what mobile glue code drives: flat commands in,
//! raw payloads and named event maps out. Credentials are pushed by the
//! host through `connect`; when the broker rejects them the session asks
//! for new ones and the bridge forwards that request as `on_auth_failure`.

pub mod events;

pub use events::{map_event, BridgeEvent};

use crate::auth::{AuthError, Authenticator};
use crate::error::{CourierError, CourierResult};
use crate::event::{ConnectionInfo, CourierEvent, EventHandler};
use crate::message::{QoS, ReceiverConfig};
use crate::policy::{ConnectTimeoutPolicy, IdleActivityTimeoutPolicy, RetryConfig};
use crate::session::{SessionConfig, SessionManager};
use crate::store::{open_database, temporary_database};
use crate::transport::mqtt::TransportSettings;
use crate::transport::{ConnectOptions, Connection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::Db;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callbacks invoked on the host side
pub trait BridgeCallbacks: Send + Sync {
    fn on_message_receive(&self, payload: Vec<u8>, topic: String);

    /// The session needs fresh credentials; answer with `connect(options)`
    fn on_auth_failure(&self);

    fn on_event(
        &self,
        name: &str,
        properties: Map<String, Value>,
        connection_info: Option<ConnectionInfo>,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRetryPolicy {
    #[serde(default = "default_base_retry")]
    pub base_retry_time_seconds: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry_time_seconds: u64,
}

fn default_base_retry() -> u64 {
    5
}

fn default_max_retry() -> u64 {
    10
}

impl Default for BridgeRetryPolicy {
    fn default() -> Self {
        Self {
            base_retry_time_seconds: default_base_retry(),
            max_retry_time_seconds: default_max_retry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConnectTimeout {
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,
    #[serde(default = "default_socket_timeout")]
    pub handshake_timeout: u64,
}

fn default_socket_timeout() -> u64 {
    10
}

impl Default for BridgeConnectTimeout {
    fn default() -> Self {
        Self {
            socket_timeout: default_socket_timeout(),
            handshake_timeout: default_socket_timeout(),
        }
    }
}

/// Settings handed over by the host at initialisation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_activity_check")]
    pub activity_check_interval_seconds: u64,
    #[serde(default = "default_inactivity")]
    pub inactivity_timeout_seconds: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub timer_ping_sender_enabled: bool,
    #[serde(default)]
    pub connect_retry_policy: BridgeRetryPolicy,
    #[serde(default)]
    pub connect_timeout: BridgeConnectTimeout,
    #[serde(default)]
    pub disconnect_delay_seconds: u64,
    #[serde(default)]
    pub incoming_message_ttl_seconds: u64,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

fn default_activity_check() -> u64 {
    12
}

fn default_inactivity() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    40
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            activity_check_interval_seconds: default_activity_check(),
            inactivity_timeout_seconds: default_inactivity(),
            read_timeout_seconds: default_read_timeout(),
            timer_ping_sender_enabled: true,
            connect_retry_policy: BridgeRetryPolicy::default(),
            connect_timeout: BridgeConnectTimeout::default(),
            disconnect_delay_seconds: 0,
            incoming_message_ttl_seconds: 0,
            storage_path: None,
        }
    }
}

impl BridgeConfig {
    fn retry(&self) -> RetryConfig {
        RetryConfig {
            base_secs: self.connect_retry_policy.base_retry_time_seconds,
            max_secs: self.connect_retry_policy.max_retry_time_seconds,
        }
    }

    /// The host always runs with both timeout policies enabled
    pub fn transport_settings(&self) -> TransportSettings {
        let connect_secs = self
            .connect_timeout
            .socket_timeout
            .max(self.connect_timeout.handshake_timeout);
        TransportSettings {
            retry: self.retry(),
            connect_timeout: ConnectTimeoutPolicy {
                enabled: true,
                timer_interval_secs: connect_secs,
                timeout_secs: connect_secs,
            },
            idle_timeout: IdleActivityTimeoutPolicy {
                enabled: true,
                timer_interval_secs: self.activity_check_interval_seconds,
                inactivity_timeout_secs: self.inactivity_timeout_seconds,
                read_timeout_secs: self.read_timeout_seconds,
            },
            keep_alive_supervision: self.timer_ping_sender_enabled,
            ..Default::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auto_reconnect: self.retry(),
            receiver: ReceiverConfig {
                ttl: Duration::from_secs(self.incoming_message_ttl_seconds),
                ..Default::default()
            },
            default_connect_source: Some("bridge".to_string()),
            ..Default::default()
        }
    }
}

/// Holds the host's latest credentials; asks the host when they are gone
struct BridgeAuthenticator {
    client_id: String,
    options: StdMutex<Option<ConnectOptions>>,
    waiters: StdMutex<Vec<oneshot::Sender<ConnectOptions>>>,
    callbacks: Arc<dyn BridgeCallbacks>,
}

impl BridgeAuthenticator {
    fn new(options: ConnectOptions, callbacks: Arc<dyn BridgeCallbacks>) -> Self {
        Self {
            client_id: options.client_id.clone(),
            options: StdMutex::new(Some(options)),
            waiters: StdMutex::new(Vec::new()),
            callbacks,
        }
    }

    fn set_connect_options(&self, options: ConnectOptions) {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = Some(options.clone());
        let waiters: Vec<_> = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), "Completing pending credential requests");
        }
        for waiter in waiters {
            let _ = waiter.send(options.clone());
        }
    }
}

#[async_trait]
impl Authenticator for BridgeAuthenticator {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn get_connect_options(&self) -> Result<ConnectOptions, AuthError> {
        let cached = self
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(options) = cached {
            return Ok(options);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        info!("Requesting fresh credentials from host");
        self.callbacks.on_auth_failure();
        rx.await
            .map_err(|_| AuthError::Other("host bridge went away".to_string()))
    }

    fn clear_cached_auth_response(&self) {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct ActiveSession {
    manager: SessionManager,
    authenticator: Arc<BridgeAuthenticator>,
}

#[derive(Default)]
struct BridgeState {
    session: Option<ActiveSession>,
    listeners: HashMap<String, JoinHandle<()>>,
    delayed_disconnect: Option<JoinHandle<()>>,
}

impl BridgeState {
    fn cancel_delayed_disconnect(&mut self) {
        if let Some(handle) = self.delayed_disconnect.take() {
            debug!("Cancelling delayed disconnect");
            handle.abort();
        }
    }

    fn detach_all(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }

    fn manager(&self) -> CourierResult<&SessionManager> {
        self.session
            .as_ref()
            .map(|session| &session.manager)
            .ok_or(CourierError::ConnectOptionsMissing)
    }
}

/// Builds the transport for each new session
pub type ConnectionFactory = Arc<dyn Fn(&TransportSettings) -> Arc<dyn Connection> + Send + Sync>;

pub struct PlatformBridge {
    config: BridgeConfig,
    callbacks: Arc<dyn BridgeCallbacks>,
    db: Db,
    connection_factory: Option<ConnectionFactory>,
    state: Mutex<BridgeState>,
}

impl PlatformBridge {
    pub fn initialise(config: BridgeConfig, callbacks: Arc<dyn BridgeCallbacks>) -> CourierResult<Self> {
        let db = match &config.storage_path {
            Some(path) => open_database(path)?,
            None => temporary_database()?,
        };
        info!(
            persistence = config.storage_path.is_some(),
            disconnect_delay_secs = config.disconnect_delay_seconds,
            "Platform bridge initialised"
        );
        Ok(Self {
            config,
            callbacks,
            db,
            connection_factory: None,
            state: Mutex::new(BridgeState::default()),
        })
    }

    /// Use `factory` instead of the rumqttc transport
    pub fn with_connection_factory(mut self, factory: ConnectionFactory) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Connect with host-supplied credentials.
    ///
    /// A new client id starts a fresh session scoped to that identity;
    /// different options for the same identity replace the live connection.
    pub async fn connect(&self, options: ConnectOptions) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        state.cancel_delayed_disconnect();

        let same_identity = state
            .session
            .as_ref()
            .map_or(false, |session| session.manager.client_id() == options.client_id);

        if same_identity {
            if let Some(session) = &state.session {
                let changed = session
                    .manager
                    .connect_options()
                    .map_or(false, |current| current != options);
                session.authenticator.set_connect_options(options);
                if changed {
                    info!("Connect options changed, reconnecting");
                    session.manager.disconnect();
                }
                session.manager.connect();
            }
            return Ok(());
        }

        if let Some(previous) = state.session.take() {
            info!(
                previous = previous.manager.client_id(),
                next = %options.client_id,
                "Client id changed, replacing session"
            );
            previous.manager.disconnect();
        }
        state.detach_all();

        let authenticator = Arc::new(BridgeAuthenticator::new(options, self.callbacks.clone()));
        let callbacks = self.callbacks.clone();
        let forward: Arc<dyn EventHandler> = Arc::new(move |event: &CourierEvent| {
            for mapped in map_event(event) {
                callbacks.on_event(mapped.name, mapped.properties, event.connection_info.clone());
            }
        });
        let settings = self.config.transport_settings();
        let mut builder = SessionManager::builder(authenticator.clone())
            .config(self.config.session_config())
            .database(self.db.clone())
            .event_handler(forward);
        if let Some(factory) = &self.connection_factory {
            builder = builder.connection(factory(&settings));
        }
        let manager = builder.transport_settings(settings).build()?;
        manager.connect();

        state.session = Some(ActiveSession {
            manager,
            authenticator,
        });
        Ok(())
    }

    /// Disconnect; `clear_state` destroys every persisted subscription and message
    pub async fn disconnect(&self, clear_state: bool) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        let manager = state.manager()?.clone();

        if clear_state {
            state.cancel_delayed_disconnect();
            state.detach_all();
            manager.destroy();
            return Ok(());
        }

        if self.config.disconnect_delay_seconds == 0 {
            manager.disconnect();
            return Ok(());
        }

        state.cancel_delayed_disconnect();
        let delay = Duration::from_secs(self.config.disconnect_delay_seconds);
        debug!(delay_secs = self.config.disconnect_delay_seconds, "Scheduling delayed disconnect");
        state.delayed_disconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.disconnect();
        }));
        Ok(())
    }

    /// Subscribe and forward every message on `topic` to `on_message_receive`
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        let manager = state.manager()?;
        manager.subscribe([(topic, qos)])?;
        let mut stream = manager.receive_bytes(topic)?;

        let callbacks = self.callbacks.clone();
        let handle = tokio::spawn(async move {
            while let Some((topic, payload)) = stream.recv_with_topic().await {
                callbacks.on_message_receive(payload, topic);
            }
        });
        if let Some(previous) = state.listeners.insert(topic.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.listeners.remove(topic) {
            handle.abort();
        }
        state.manager()?.unsubscribe([topic])
    }

    /// Publish raw bytes
    pub async fn send(&self, payload: Vec<u8>, topic: &str, qos: QoS) -> CourierResult<()> {
        let state = self.state.lock().await;
        let result = state.manager()?.publish_bytes(topic, payload, qos);
        if let Err(e) = &result {
            warn!(topic, error = %e, "Send rejected");
        }
        result
    }

    /// The live session, if `connect` has been called
    pub async fn session(&self) -> Option<SessionManager> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|session| session.manager.clone())
    }

    pub async fn is_disconnect_scheduled(&self) -> bool {
        let state = self.state.lock().await;
        state
            .delayed_disconnect
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}
