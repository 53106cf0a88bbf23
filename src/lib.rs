//! Courier - persistent-session MQTT client core
//!
//! A client for apps that come and go: subscriptions, undelivered incoming
//! messages and unacknowledged outgoing QoS flows survive restarts in a
//! local [`sled`] database, while a single session worker drives
//! authentication, connection, reconnection and subscription reconciliation.
//!
//! # Overview
//!
//! - [`session::SessionManager`]: the public handle (connect, subscribe,
//!   publish, receive, lifecycle hooks)
//! - [`auth`]: pluggable credential sources
//! - [`transport`]: the rumqttc-backed connection with retry, timeout and
//!   keep-alive supervision
//! - [`store`]: durable subscription, incoming and outgoing state
//! - [`event`]: typed events for every attempt and outcome
//! - [`bridge`]: a callback-based facade for host platforms
//!
//! # Quick Start
//!
//! ```no_run
//! use courier_mqtt::auth::StaticAuthenticator;
//! use courier_mqtt::message::QoS;
//! use courier_mqtt::session::SessionManager;
//! use courier_mqtt::transport::ConnectOptions;
//! use std::sync::Arc;
//!
//! # async fn example() -> courier_mqtt::CourierResult<()> {
//! let options = ConnectOptions::new("broker.example.com", 1883, "device-42");
//! let session = SessionManager::builder(Arc::new(StaticAuthenticator::new(options))).build()?;
//!
//! session.connect();
//! session.subscribe([("orders/+/status", QoS::AtLeastOnce)])?;
//!
//! let mut updates = session.receive::<serde_json::Value>("orders/+/status")?;
//! while let Some(update) = updates.recv().await {
//!     println!("{update}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod observability;
pub mod policy;
pub mod session;
pub mod store;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::*;
pub use error::{CourierError, CourierResult};
pub use event::{CourierEvent, CourierEventKind, EventHandler};
pub use message::{MqttPacket, QoS};
pub use session::{ConnectionState, SessionConfig, SessionManager, TopicStream};
pub use transport::ConnectOptions;
