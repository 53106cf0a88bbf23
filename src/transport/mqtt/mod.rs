//! rumqttc-backed MQTT transport
//!
//! Pure functions are kept apart from the I/O so they can be tested in
//! isolation:
//!
//! - [`connection`] - option building and error classification
//! - [`message_handler`] - event routing and request bookkeeping
//! - [`health_monitor`] - keep-alive and timeout supervision
//! - [`client`] - the supervisor task and the [`Connection`](crate::transport::Connection) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_mqtt::message::{MqttPacket, QoS};
//! use courier_mqtt::transport::mqtt::{MqttConnection, TransportSettings};
//! use courier_mqtt::transport::{ConnectOptions, Connection};
//!
//! # tokio_test::block_on(async {
//! let connection = MqttConnection::new(TransportSettings::default(), None);
//! connection
//!     .connect(ConnectOptions::new("localhost", 1883, "device-1"))
//!     .await;
//! connection
//!     .publish(MqttPacket::new("devices/1/hello", b"hi".to_vec(), QoS::AtMostOnce))
//!     .await;
//! connection.disconnect().await;
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttConnection;
pub use connection::{classify_connack, classify_connection_error, configure_mqtt_options, TransportSettings};
pub use health_monitor::{HealthDecision, HealthMonitor, PingCheck};
pub use message_handler::{MessageHandler, RequestTracker, TransportRoute};
