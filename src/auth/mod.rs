//! Authentication collaborators
//!
//! The session asks an [`Authenticator`] for fresh [`ConnectOptions`] before
//! every transport connect and clears its cache whenever the broker rejects
//! the credentials.

pub mod http;
pub mod static_auth;

pub use http::{HttpAuthenticator, HttpAuthenticatorConfig};
pub use static_auth::StaticAuthenticator;

use crate::transport::ConnectOptions;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Invalid credentials response: {0}")]
    InvalidResponse(String),
    #[error("Authentication failed: {0}")]
    Other(String),
}

impl AuthError {
    pub fn is_network_unavailable(&self) -> bool {
        matches!(self, AuthError::NetworkUnavailable(_))
    }
}

/// Source of broker credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Identity used to scope persisted state when no session exists yet
    fn client_id(&self) -> String;

    async fn get_connect_options(&self) -> Result<ConnectOptions, AuthError>;

    /// Forget any cached credentials so the next call re-authenticates
    fn clear_cached_auth_response(&self);
}
