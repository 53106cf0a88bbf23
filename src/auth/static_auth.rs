//! Authenticator backed by locally known options

use super::{AuthError, Authenticator};
use crate::config::CourierConfig;
use crate::config::ConfigError;
use crate::transport::ConnectOptions;
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// Hands out a fixed set of connect options.
///
/// The options can be replaced at runtime; the next connect attempt picks
/// up whatever is stored at that point.
#[derive(Debug)]
pub struct StaticAuthenticator {
    client_id: String,
    options: RwLock<Option<ConnectOptions>>,
}

impl StaticAuthenticator {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            client_id: options.client_id.clone(),
            options: RwLock::new(Some(options)),
        }
    }

    /// An authenticator that fails until options are supplied
    pub fn empty(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            options: RwLock::new(None),
        }
    }

    /// Build options from configuration, reading credentials from the environment
    pub fn from_config(config: &CourierConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.connect_options()?))
    }

    pub fn set_options(&self, options: ConnectOptions) {
        let mut guard = self.options.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(options);
    }

    pub fn options(&self) -> Option<ConnectOptions> {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    fn client_id(&self) -> String {
        self.options()
            .map(|options| options.client_id)
            .unwrap_or_else(|| self.client_id.clone())
    }

    async fn get_connect_options(&self) -> Result<ConnectOptions, AuthError> {
        self.options()
            .ok_or_else(|| AuthError::Other("connect options have not been provided".to_string()))
    }

    fn clear_cached_auth_response(&self) {
        // Nothing cached beyond the configured options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_configured_options() {
        let options = ConnectOptions::new("broker", 1883, "client-a");
        let auth = StaticAuthenticator::new(options.clone());

        assert_eq!(auth.client_id(), "client-a");
        assert_eq!(auth.get_connect_options().await.unwrap(), options);
    }

    #[tokio::test]
    async fn test_empty_authenticator_fails_until_options_set() {
        let auth = StaticAuthenticator::empty("fallback");
        assert_eq!(auth.client_id(), "fallback");
        assert!(matches!(
            auth.get_connect_options().await,
            Err(AuthError::Other(_))
        ));

        auth.set_options(ConnectOptions::new("broker", 443, "client-b"));
        assert_eq!(auth.client_id(), "client-b");
        assert_eq!(auth.get_connect_options().await.unwrap().port, 443);
    }
}
