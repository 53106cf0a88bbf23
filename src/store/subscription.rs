//! Durable record of desired subscriptions and unacknowledged unsubscribes
//!
//! A topic is never both a subscribe target and a pending unsubscribe:
//! subscribing clears the pending flag, unsubscribing drops the
//! subscription and sets it. Each mutation commits both trees in one
//! transaction and flushes before returning.

use super::{tree_name, StorageError};
use crate::message::QoS;
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Point-in-time view of the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    pub subscriptions: HashMap<String, QoS>,
    pub pending_unsubscriptions: HashSet<String>,
}

#[derive(Clone)]
pub struct SubscriptionStore {
    db: Db,
    subscriptions: Tree,
    pending: Tree,
    state: Arc<Mutex<SubscriptionState>>,
}

impl SubscriptionStore {
    /// Open the trees for `client_id` and load the persisted state
    pub fn open(db: &Db, client_id: &str) -> Result<Self, StorageError> {
        let subscriptions = db.open_tree(tree_name("subscriptions", client_id))?;
        let pending = db.open_tree(tree_name("pending_unsubscriptions", client_id))?;

        let mut state = SubscriptionState::default();
        for entry in subscriptions.iter() {
            let (key, value) = entry?;
            let topic = decode_topic(&key)?;
            let qos = value
                .first()
                .copied()
                .and_then(|raw| QoS::try_from(raw).ok())
                .ok_or_else(|| StorageError::Corrupt(format!("invalid QoS for topic {topic}")))?;
            state.subscriptions.insert(topic, qos);
        }
        for entry in pending.iter() {
            let (key, _) = entry?;
            state.pending_unsubscriptions.insert(decode_topic(&key)?);
        }

        debug!(
            client_id,
            subscriptions = state.subscriptions.len(),
            pending_unsubscriptions = state.pending_unsubscriptions.len(),
            "Loaded subscription store"
        );

        Ok(Self {
            db: db.clone(),
            subscriptions,
            pending,
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, topics: &[(String, QoS)]) -> Result<(), StorageError> {
        let mut state = self.lock();
        let result: Result<(), TransactionError<()>> = (&self.subscriptions, &self.pending)
            .transaction(|(subscriptions, pending)| {
                for (topic, qos) in topics {
                    pending.remove(topic.as_bytes())?;
                    subscriptions.insert(topic.as_bytes(), vec![qos.as_u8()])?;
                }
                Ok(())
            });
        result?;
        self.db.flush()?;

        for (topic, qos) in topics {
            state.pending_unsubscriptions.remove(topic);
            state.subscriptions.insert(topic.clone(), *qos);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topics: &[String]) -> Result<(), StorageError> {
        let mut state = self.lock();
        let result: Result<(), TransactionError<()>> = (&self.subscriptions, &self.pending)
            .transaction(|(subscriptions, pending)| {
                for topic in topics {
                    subscriptions.remove(topic.as_bytes())?;
                    pending.insert(topic.as_bytes(), Vec::<u8>::new())?;
                }
                Ok(())
            });
        result?;
        self.db.flush()?;

        for topic in topics {
            state.subscriptions.remove(topic);
            state.pending_unsubscriptions.insert(topic.clone());
        }
        Ok(())
    }

    /// The broker confirmed these unsubscribes
    pub fn unsubscribe_acked(&self, topics: &[String]) -> Result<(), StorageError> {
        let mut state = self.lock();
        for topic in topics {
            self.pending.remove(topic.as_bytes())?;
        }
        self.db.flush()?;

        for topic in topics {
            state.pending_unsubscriptions.remove(topic);
        }
        Ok(())
    }

    pub fn is_currently_pending_unsubscribe(&self, topic: &str) -> bool {
        self.lock().pending_unsubscriptions.contains(topic)
    }

    pub fn clear_all_subscriptions(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        let subscribed: Vec<String> = state.subscriptions.keys().cloned().collect();
        let pending: Vec<String> = state.pending_unsubscriptions.iter().cloned().collect();

        let result: Result<(), TransactionError<()>> = (&self.subscriptions, &self.pending)
            .transaction(|(subscriptions_tx, pending_tx)| {
                for topic in &subscribed {
                    subscriptions_tx.remove(topic.as_bytes())?;
                }
                for topic in &pending {
                    pending_tx.remove(topic.as_bytes())?;
                }
                Ok(())
            });
        result?;
        self.db.flush()?;

        if !self.subscriptions.is_empty() || !self.pending.is_empty() {
            warn!("Subscription trees held entries unknown to the in-memory state, clearing");
            self.subscriptions.clear()?;
            self.pending.clear()?;
            self.db.flush()?;
        }

        *state = SubscriptionState::default();
        Ok(())
    }

    pub fn subscriptions(&self) -> HashMap<String, QoS> {
        self.lock().subscriptions.clone()
    }

    pub fn pending_unsubscriptions(&self) -> HashSet<String> {
        self.lock().pending_unsubscriptions.clone()
    }

    pub fn snapshot(&self) -> SubscriptionState {
        self.lock().clone()
    }
}

fn decode_topic(raw: &[u8]) -> Result<String, StorageError> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| StorageError::Corrupt(format!("topic is not UTF-8: {e}")))
}
