//! Pure connection configuration for the MQTT transport
//!
//! Builds rumqttc options from [`ConnectOptions`] and classifies rumqttc
//! failures into [`TransportError`]s. Nothing here touches the network.

use crate::policy::{ConnectTimeoutPolicy, IdleActivityTimeoutPolicy, RetryConfig};
use crate::transport::{ConnectOptions, TransportError, TransportErrorKind};
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use rumqttc::v5::{ConnectionError, MqttOptions, StateError};
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::path::PathBuf;
use std::time::Duration;

/// Transport tuning that does not come from the authenticator
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub retry: RetryConfig,
    pub connect_timeout: ConnectTimeoutPolicy,
    pub idle_timeout: IdleActivityTimeoutPolicy,
    /// Fail the session when a ping goes unanswered before the next one
    pub keep_alive_supervision: bool,
    /// Custom CA bundle; required for ALPN negotiation
    pub ca_path: Option<PathBuf>,
    pub request_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            connect_timeout: ConnectTimeoutPolicy::default(),
            idle_timeout: IdleActivityTimeoutPolicy::default(),
            keep_alive_supervision: true,
            ca_path: None,
            request_capacity: 10,
        }
    }
}

/// Pure function to build rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    options: &ConnectOptions,
    settings: &TransportSettings,
) -> Result<MqttOptions, TransportError> {
    if options.host.trim().is_empty() {
        return Err(TransportError::new(
            TransportErrorKind::Other,
            "broker host is empty",
        ));
    }
    if options.client_id.trim().is_empty() {
        return Err(TransportError::new(
            TransportErrorKind::Other,
            "client id is empty",
        ));
    }

    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)));
    mqtt_options.set_clean_start(options.clean_session);

    if !options.username.is_empty() {
        mqtt_options.set_credentials(&options.username, &options.password);
    }

    if let Some(properties) = &options.user_properties {
        mqtt_options.set_user_properties(
            properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
    }

    if let Some(ca_path) = &settings.ca_path {
        let ca = std::fs::read(ca_path).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Tls,
                format!("cannot read CA bundle {}: {e}", ca_path.display()),
            )
        })?;
        let alpn = options
            .alpn
            .as_ref()
            .map(|protocols| protocols.iter().map(|p| p.as_bytes().to_vec()).collect());
        mqtt_options.set_transport(RumqttcTransport::tls_with_config(
            TlsConfiguration::Simple {
                ca,
                alpn,
                client_auth: None,
            },
        ));
    } else if options.uses_tls() {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    Ok(mqtt_options)
}

/// Pure classification of an event loop failure
pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_connack(code),
        ConnectionError::MqttState(StateError::AwaitPingResp) => TransportError::new(
            TransportErrorKind::KeepAlive,
            "no ping response before next keep-alive",
        ),
        ConnectionError::MqttState(state) => {
            TransportError::new(TransportErrorKind::Protocol, state.to_string())
        }
        ConnectionError::Io(io) => {
            let kind = match io.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                    TransportErrorKind::ClosedByBroker
                }
                _ => TransportErrorKind::Io,
            };
            TransportError::new(kind, io.to_string())
        }
        ConnectionError::Tls(tls) => TransportError::new(TransportErrorKind::Tls, tls.to_string()),
        other => TransportError::new(TransportErrorKind::Other, other.to_string()),
    }
}

/// Pure classification of a refused CONNACK
pub fn classify_connack(code: &ConnectReturnCode) -> TransportError {
    let kind = match code {
        ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized
        | ConnectReturnCode::BadAuthenticationMethod => TransportErrorKind::Authentication,
        ConnectReturnCode::MalformedPacket | ConnectReturnCode::ProtocolError => {
            TransportErrorKind::Protocol
        }
        _ => TransportErrorKind::ConnectionRefused,
    };
    TransportError::new(kind, format!("connection refused: {code:?}"))
}
