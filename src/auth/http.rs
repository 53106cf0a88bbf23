//! Authenticator that fetches broker credentials from an HTTP endpoint

use super::{AuthError, Authenticator};
use crate::config::ConfigError;
use crate::error::sanitize_error_message;
use crate::transport::ConnectOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAuthenticatorConfig {
    /// Endpoint returning a credentials document
    pub endpoint: String,
    /// Environment variable holding a bearer token for the endpoint
    pub token_env: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

/// Credentials document served by the endpoint
#[derive(Debug, Clone, Deserialize)]
struct CredentialsResponse {
    host: String,
    port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    keep_alive_secs: Option<u16>,
    clean_session: Option<bool>,
    user_properties: Option<BTreeMap<String, String>>,
    alpn: Option<Vec<String>>,
}

impl CredentialsResponse {
    fn into_options(self, client_id: &str) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.host, self.port, client_id)
            .with_credentials(self.username, self.password);
        if let Some(keep_alive) = self.keep_alive_secs {
            options = options.with_keep_alive(keep_alive);
        }
        if let Some(clean_session) = self.clean_session {
            options = options.with_clean_session(clean_session);
        }
        options.user_properties = self.user_properties;
        options.alpn = self.alpn;
        options
    }
}

pub struct HttpAuthenticator {
    client_id: String,
    endpoint: Url,
    token: Option<String>,
    http: reqwest::Client,
    cached: Mutex<Option<ConnectOptions>>,
}

impl HttpAuthenticator {
    pub fn new(
        client_id: impl Into<String>,
        config: &HttpAuthenticatorConfig,
    ) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            ConfigError::InvalidConfig(format!("invalid auth endpoint '{}': {e}", config.endpoint))
        })?;
        let token = config
            .token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client_id: client_id.into(),
            endpoint,
            token,
            http,
            cached: Mutex::new(None),
        })
    }

    fn cached(&self) -> Option<ConnectOptions> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn fetch(&self) -> Result<ConnectOptions, AuthError> {
        let mut request = self
            .http
            .get(self.endpoint.clone())
            .query(&[("client_id", self.client_id.as_str())]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Http {
                status: status.as_u16(),
                message: sanitize_error_message(&body),
            });
        }

        let credentials: CredentialsResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        Ok(credentials.into_options(&self.client_id))
    }
}

fn map_request_error(error: reqwest::Error) -> AuthError {
    if error.is_connect() || error.is_timeout() {
        AuthError::NetworkUnavailable(sanitize_error_message(&error.to_string()))
    } else {
        AuthError::Other(sanitize_error_message(&error.to_string()))
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn get_connect_options(&self) -> Result<ConnectOptions, AuthError> {
        if let Some(options) = self.cached() {
            debug!(client_id = %self.client_id, "Using cached broker credentials");
            return Ok(options);
        }

        match self.fetch().await {
            Ok(options) => {
                let mut guard = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
                *guard = Some(options.clone());
                Ok(options)
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "Credentials request failed");
                Err(e)
            }
        }
    }

    fn clear_cached_auth_response(&self) {
        let mut guard = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}
