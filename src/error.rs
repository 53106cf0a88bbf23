//! Error types surfaced across the public API
//!
//! Only synchronous precondition failures are returned to callers; every
//! asynchronous failure is reported as an event instead.

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::store::StorageError;
use crate::topic::TopicError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("No session exists: connect before publishing")]
    SessionNotExist,

    #[error("Decoding error: {message}")]
    Decoding { message: String },

    #[error("Encoding error: {message}")]
    Encoding { message: String },

    #[error("Connect options are not available")]
    ConnectOptionsMissing,

    #[error("Message save error: {message}")]
    MessageSave { message: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Session worker has stopped")]
    WorkerStopped,

    #[error("{message}")]
    Other { message: String },
}

impl CourierError {
    pub fn decoding<S: Into<String>>(message: S) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    pub fn message_save<S: Into<String>>(message: S) -> Self {
        Self::MessageSave {
            message: message.into(),
        }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|secret|authorization)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Strip credentials and sensitive paths from text bound for events and logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for client operations
pub type CourierResult<T> = Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        assert!(matches!(
            CourierError::decoding("bad"),
            CourierError::Decoding { message } if message == "bad"
        ));
        assert!(matches!(
            CourierError::encoding("bad"),
            CourierError::Encoding { .. }
        ));
        assert!(matches!(
            CourierError::message_save("disk"),
            CourierError::MessageSave { .. }
        ));
        assert!(matches!(CourierError::other("x"), CourierError::Other { .. }));
    }

    #[test]
    fn test_error_display() {
        let errors = vec![
            CourierError::SessionNotExist,
            CourierError::ConnectOptionsMissing,
            CourierError::WorkerStopped,
            CourierError::decoding("invalid utf-8"),
            CourierError::Auth(AuthError::NetworkUnavailable("offline".to_string())),
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_sanitize_redacts_credentials() {
        let sanitized = sanitize_error_message("connect failed: password=hunter2 token: abc123");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc123"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_redacts_sensitive_paths() {
        let sanitized = sanitize_error_message("cannot read /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("id_rsa"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let long = "x".repeat(2000);
        let sanitized = sanitize_error_message(&long);
        assert_eq!(sanitized.len(), 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_truncation_respects_char_boundaries() {
        let long = "é".repeat(600);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
