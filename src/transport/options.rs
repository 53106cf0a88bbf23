//! Connect options handed from the authenticator to the transport

use crate::event::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Immutable broker connection parameters.
///
/// Equality decides whether a repeated `connect` is a no-op or must tear
/// the live transport down and rebuild it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default)]
    pub user_properties: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub alpn: Option<Vec<String>>,
}

fn default_keep_alive() -> u16 {
    60
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: default_keep_alive(),
            clean_session: false,
            user_properties: None,
            alpn: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive_secs: u16) -> Self {
        self.keep_alive_secs = keep_alive_secs;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_user_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.user_properties = Some(properties);
        self
    }

    pub fn with_alpn(mut self, protocols: Vec<String>) -> Self {
        self.alpn = Some(protocols);
        self
    }

    /// Ports 443 and 8883 are served over TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self.port, 443 | 8883)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.clone(),
            port: self.port,
            keep_alive_secs: self.keep_alive_secs,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            clean_session: self.clean_session,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("clean_session", &self.clean_session)
            .field("user_properties", &self.user_properties)
            .field("alpn", &self.alpn)
            .finish()
    }
}
