//! Durable session state on an embedded sled database
//!
//! Every tree name carries the client id so that destroying one identity
//! purges only its own subscriptions and messages.

pub mod incoming;
pub mod outgoing;
pub mod subscription;

pub use incoming::IncomingMessagePersistence;
pub use outgoing::{OutgoingFlow, OutgoingMessagePersistence};
pub use subscription::{SubscriptionState, SubscriptionStore};

use chrono::{DateTime, Utc};
use sled::transaction::TransactionError;
use sled::Db;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage engine error: {0}")]
    Engine(#[from] sled::Error),
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Storage transaction aborted")]
    Aborted,
}

impl From<TransactionError<()>> for StorageError {
    fn from(error: TransactionError<()>) -> Self {
        match error {
            TransactionError::Storage(e) => StorageError::Engine(e),
            TransactionError::Abort(()) => StorageError::Aborted,
        }
    }
}

/// Open (or create) the database backing all stores
pub fn open_database(path: &Path) -> Result<Db, StorageError> {
    Ok(sled::open(path)?)
}

/// In-memory database discarded on drop
pub fn temporary_database() -> Result<Db, StorageError> {
    Ok(sled::Config::new().temporary(true).open()?)
}

pub(crate) fn tree_name(kind: &str, client_id: &str) -> String {
    format!("{kind}::{client_id}")
}

/// Sortable key prefix for a timestamp: big-endian microseconds since epoch
pub(crate) fn timestamp_prefix(timestamp: DateTime<Utc>) -> [u8; 8] {
    let micros = timestamp.timestamp_micros().max(0) as u64;
    micros.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_tree_names_are_scoped_by_client() {
        assert_eq!(tree_name("incoming", "a"), "incoming::a");
        assert_ne!(tree_name("incoming", "a"), tree_name("incoming", "b"));
    }

    #[test]
    fn test_timestamp_prefix_sorts_chronologically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1);
        assert!(timestamp_prefix(earlier) < timestamp_prefix(later));
    }

    #[test]
    fn test_open_database_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(&dir.path().join("courier_db")).unwrap();
        db.insert("k", "v").unwrap();
        assert!(db.contains_key("k").unwrap());
    }
}
