//! TOML configuration for the courier client
//!
//! Credentials are never stored in the file: the `[broker]` section names
//! environment variables that are read when connect options are built.

use crate::auth::HttpAuthenticatorConfig;
use crate::message::{QoS, ReceiverConfig};
use crate::policy::{
    AuthRetryConfig, AuthTimeoutPolicy, ConnectTimeoutPolicy, IdleActivityTimeoutPolicy,
    RetryConfig,
};
use crate::session::SessionConfig;
use crate::topic;
use crate::transport::mqtt::TransportSettings;
use crate::transport::ConnectOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourierConfig {
    pub client: ClientSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    /// Topics subscribed on startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default)]
    pub clean_session: bool,
    pub alpn: Option<Vec<String>>,
    pub ca_path: Option<PathBuf>,
    pub user_properties: Option<BTreeMap<String, String>>,
}

fn default_keep_alive() -> u16 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Transport reconnect backoff
    #[serde(default)]
    pub connect: RetryConfig,
    /// Re-authentication pacing after non-retriable auth failures
    #[serde(default)]
    pub auto_reconnect: RetryConfig,
    #[serde(default)]
    pub auth: AuthRetryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    #[serde(default)]
    pub timeout: AuthTimeoutPolicy,
    /// Fetch credentials from a token endpoint instead of the environment
    pub http: Option<HttpAuthenticatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsSection {
    #[serde(default)]
    pub connect: ConnectTimeoutPolicy,
    #[serde(default)]
    pub idle: IdleActivityTimeoutPolicy,
    #[serde(default = "default_true")]
    pub keep_alive_supervision: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect: ConnectTimeoutPolicy::default(),
            idle: IdleActivityTimeoutPolicy::default(),
            keep_alive_supervision: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceSection {
    /// Database directory; in-memory when absent
    pub path: Option<PathBuf>,
    /// How long undelivered messages are kept (0 disables persistence)
    #[serde(default)]
    pub incoming_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval() -> u64 {
    10
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            path: None,
            incoming_ttl_secs: 0,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleSection {
    #[serde(default = "default_background_grace")]
    pub background_grace_secs: u64,
    #[serde(default)]
    pub disconnect_on_background: bool,
    #[serde(default)]
    pub disconnect_delay_secs: u64,
}

fn default_background_grace() -> u64 {
    1
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            background_grace_secs: default_background_grace(),
            disconnect_on_background: false,
            disconnect_delay_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: QoS,
}

fn default_qos() -> QoS {
    QoS::AtLeastOnce
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Broker address parsed from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl CourierConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: CourierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client.id)?;
        self.broker_endpoint()?;

        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.keep_alive_secs must be greater than zero".to_string(),
            ));
        }
        for (name, retry) in [
            ("retry.connect", &self.retry.connect),
            ("retry.auto_reconnect", &self.retry.auto_reconnect),
        ] {
            if retry.base_secs == 0 || retry.base_secs > retry.max_secs {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name}: base_secs must be in 1..=max_secs (got {} and {})",
                    retry.base_secs, retry.max_secs
                )));
            }
        }
        if self.auth.timeout.enabled && self.auth.timeout.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "auth.timeout.timeout_secs must be greater than zero when enabled".to_string(),
            ));
        }
        if self.persistence.incoming_ttl_secs > 0 && self.persistence.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "persistence.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        for entry in &self.subscriptions {
            topic::validate_filter(&entry.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("subscription '{}': {e}", entry.topic))
            })?;
        }
        Ok(())
    }

    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker.url).map_err(|e| {
            ConfigError::InvalidConfig(format!("invalid broker url '{}': {e}", self.broker.url))
        })?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "unsupported broker scheme '{other}', expected mqtt or mqtts"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                ConfigError::InvalidConfig(format!("broker url '{}' has no host", self.broker.url))
            })?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        Ok(BrokerEndpoint { host, port, tls })
    }

    fn get_env_var(name: Option<&String>) -> Result<String, ConfigError> {
        match name {
            Some(name) => {
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
            }
            None => Ok(String::new()),
        }
    }

    /// Connect options with credentials read from the environment
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let endpoint = self.broker_endpoint()?;
        let username = Self::get_env_var(self.broker.username_env.as_ref())?;
        let password = Self::get_env_var(self.broker.password_env.as_ref())?;

        let mut options = ConnectOptions::new(endpoint.host, endpoint.port, &self.client.id)
            .with_credentials(username, password)
            .with_keep_alive(self.broker.keep_alive_secs)
            .with_clean_session(self.broker.clean_session);
        if let Some(properties) = &self.broker.user_properties {
            options = options.with_user_properties(properties.clone());
        }
        if let Some(alpn) = &self.broker.alpn {
            options = options.with_alpn(alpn.clone());
        }
        Ok(options)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auth_retry: self.retry.auth,
            auto_reconnect: self.retry.auto_reconnect,
            auth_timeout: self.auth.timeout,
            background_grace: Duration::from_secs(self.lifecycle.background_grace_secs),
            disconnect_on_background: self.lifecycle.disconnect_on_background,
            receiver: ReceiverConfig {
                ttl: Duration::from_secs(self.persistence.incoming_ttl_secs),
                cleanup_interval: Duration::from_secs(self.persistence.cleanup_interval_secs.max(1)),
            },
            default_connect_source: Some("cli".to_string()),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            retry: self.retry.connect,
            connect_timeout: self.timeouts.connect,
            idle_timeout: self.timeouts.idle,
            keep_alive_supervision: self.timeouts.keep_alive_supervision,
            ca_path: self.broker.ca_path.clone(),
            ..Default::default()
        }
    }

    pub fn initial_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .iter()
            .map(|entry| (entry.topic.clone(), entry.qos))
            .collect()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[client]
id = "test-client"

[broker]
url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Client ids are used in storage tree names, so keep them to a safe alphabet
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
