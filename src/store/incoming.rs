//! Durable buffer of received messages awaiting a live subscriber
//!
//! Records are keyed by arrival time followed by the message id, so a
//! plain tree scan yields them oldest first and TTL eviction is a range
//! delete. A secondary index maps ids back to their keys.

use super::{timestamp_prefix, tree_name, StorageError};
use crate::message::MqttPacket;
use crate::topic;
use chrono::{DateTime, Utc};
use sled::transaction::TransactionError;
use sled::{Db, IVec, Transactional, Tree};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Clone)]
pub struct IncomingMessagePersistence {
    db: Db,
    messages: Tree,
    index: Tree,
    last_stamp: Arc<Mutex<u64>>,
}

impl IncomingMessagePersistence {
    pub fn open(db: &Db, client_id: &str) -> Result<Self, StorageError> {
        let messages = db.open_tree(tree_name("incoming", client_id))?;
        let index = db.open_tree(tree_name("incoming_index", client_id))?;

        let last_stamp = match messages.last()? {
            Some((key, _)) => stamp_of(&key)?,
            None => 0,
        };

        Ok(Self {
            db: db.clone(),
            messages,
            index,
            last_stamp: Arc::new(Mutex::new(last_stamp)),
        })
    }

    /// Arrival stamp that is strictly greater than every earlier one.
    /// Timestamps from the future are treated as now.
    fn next_stamp(&self, timestamp: DateTime<Utc>) -> u64 {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let candidate = u64::from_be_bytes(timestamp_prefix(timestamp.min(Utc::now())));
        let stamp = candidate.max(last.saturating_add(1));
        *last = stamp;
        stamp
    }

    pub fn save_message(&self, packet: &MqttPacket) -> Result<(), StorageError> {
        let stamp = self.next_stamp(packet.timestamp);
        let key = record_key(stamp, &packet.id);
        let value = serde_json::to_vec(packet)?;

        let result: Result<(), TransactionError<()>> =
            (&self.messages, &self.index).transaction(|(messages, index)| {
                if let Some(previous) = index.get(packet.id.as_bytes())? {
                    messages.remove(previous)?;
                }
                messages.insert(key.as_slice(), value.as_slice())?;
                index.insert(packet.id.as_bytes(), key.as_slice())?;
                Ok(())
            });
        result?;
        self.db.flush()?;

        debug!(id = %packet.id, topic = %packet.topic, "Persisted incoming message");
        Ok(())
    }

    /// Messages for the given topics, oldest first; an empty list means all
    pub fn get_all_messages(&self, topics: &[String]) -> Result<Vec<MqttPacket>, StorageError> {
        self.collect(|packet| topics.is_empty() || topics.iter().any(|t| *t == packet.topic))
    }

    /// Messages whose topic matches any of the given filters, oldest first
    pub fn get_messages_matching(&self, filters: &[String]) -> Result<Vec<MqttPacket>, StorageError> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        self.collect(|packet| filters.iter().any(|f| topic::matches(f, &packet.topic)))
    }

    fn collect<F>(&self, keep: F) -> Result<Vec<MqttPacket>, StorageError>
    where
        F: Fn(&MqttPacket) -> bool,
    {
        let mut packets = Vec::new();
        for entry in self.messages.iter() {
            let (_, value) = entry?;
            let packet: MqttPacket = serde_json::from_slice(&value)?;
            if keep(&packet) {
                packets.push(packet);
            }
        }
        Ok(packets)
    }

    pub fn delete_messages(&self, ids: &[String]) -> Result<usize, StorageError> {
        let result: Result<usize, TransactionError<()>> =
            (&self.messages, &self.index).transaction(|(messages, index)| {
                let mut removed = 0;
                for id in ids {
                    if let Some(key) = index.remove(id.as_bytes())? {
                        messages.remove(key)?;
                        removed += 1;
                    }
                }
                Ok(removed)
            });
        let removed = result?;
        self.db.flush()?;
        Ok(removed)
    }

    /// Evict everything that arrived before `cutoff`
    pub fn delete_messages_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let upper = timestamp_prefix(cutoff);
        let expired: Vec<(IVec, IVec)> = self
            .messages
            .range(..upper.to_vec())
            .collect::<Result<Vec<_>, _>>()?;

        let mut removed = 0;
        for (key, value) in expired {
            let packet: MqttPacket = serde_json::from_slice(&value)?;
            self.messages.remove(&key)?;
            self.index.remove(packet.id.as_bytes())?;
            removed += 1;
        }
        if removed > 0 {
            self.db.flush()?;
            debug!(removed, "Evicted expired incoming messages");
        }
        Ok(removed)
    }

    pub fn delete_all_messages(&self) -> Result<(), StorageError> {
        self.messages.clear()?;
        self.index.clear()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn record_key(stamp: u64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&stamp.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn stamp_of(key: &[u8]) -> Result<u64, StorageError> {
    let prefix: [u8; 8] = key
        .get(..8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| StorageError::Corrupt("incoming key shorter than its stamp".to_string()))?;
    Ok(u64::from_be_bytes(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QoS;
    use crate::store::temporary_database;
    use chrono::Duration;

    fn store() -> IncomingMessagePersistence {
        let db = temporary_database().unwrap();
        IncomingMessagePersistence::open(&db, "client").unwrap()
    }

    #[test]
    fn test_save_and_fetch_round_trip() {
        let store = store();
        let packet = MqttPacket::new("news", b"hello".to_vec(), QoS::AtLeastOnce);
        store.save_message(&packet).unwrap();

        let fetched = store.get_all_messages(&["news".to_string()]).unwrap();
        assert_eq!(fetched, vec![packet]);
    }

    #[test]
    fn test_fetch_is_ordered_by_arrival() {
        let store = store();
        let now = Utc::now();
        let mut late = MqttPacket::new("t", b"late".to_vec(), QoS::AtLeastOnce);
        late.timestamp = now;
        let mut early = MqttPacket::new("t", b"early".to_vec(), QoS::AtLeastOnce);
        early.timestamp = now - Duration::seconds(5);

        store.save_message(&early).unwrap();
        store.save_message(&late).unwrap();

        let payloads: Vec<Vec<u8>> = store
            .get_all_messages(&[])
            .unwrap()
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(payloads, vec![b"early".to_vec(), b"late".to_vec()]);
    }

    #[test]
    fn test_topic_filtering() {
        let store = store();
        store
            .save_message(&MqttPacket::new("a", b"1".to_vec(), QoS::AtLeastOnce))
            .unwrap();
        store
            .save_message(&MqttPacket::new("b/c", b"2".to_vec(), QoS::AtLeastOnce))
            .unwrap();

        assert_eq!(store.get_all_messages(&[]).unwrap().len(), 2);
        assert_eq!(store.get_all_messages(&["a".to_string()]).unwrap().len(), 1);
        assert_eq!(
            store.get_messages_matching(&["b/+".to_string()]).unwrap().len(),
            1
        );
        assert!(store.get_messages_matching(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_messages_by_id() {
        let store = store();
        let keep = MqttPacket::new("t", b"keep".to_vec(), QoS::AtLeastOnce);
        let drop = MqttPacket::new("t", b"drop".to_vec(), QoS::AtLeastOnce);
        store.save_message(&keep).unwrap();
        store.save_message(&drop).unwrap();

        let removed = store
            .delete_messages(&[drop.id.clone(), "unknown".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_all_messages(&[]).unwrap(), vec![keep]);
    }

    #[test]
    fn test_resaving_same_id_replaces_record() {
        let store = store();
        let mut packet = MqttPacket::new("t", b"v1".to_vec(), QoS::AtLeastOnce);
        store.save_message(&packet).unwrap();
        packet.payload = b"v2".to_vec();
        store.save_message(&packet).unwrap();

        let all = store.get_all_messages(&[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, b"v2".to_vec());
    }

    #[test]
    fn test_delete_older_than() {
        let store = store();
        let mut old = MqttPacket::new("t", b"old".to_vec(), QoS::AtLeastOnce);
        old.timestamp = Utc::now() - Duration::seconds(120);
        let fresh = MqttPacket::new("t", b"fresh".to_vec(), QoS::AtLeastOnce);
        store.save_message(&old).unwrap();
        store.save_message(&fresh).unwrap();

        let removed = store
            .delete_messages_older_than(Utc::now() - Duration::seconds(60))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_all_messages(&[]).unwrap(), vec![fresh]);
        assert_eq!(store.delete_messages(&[old.id]).unwrap(), 0);
    }

    #[test]
    fn test_delete_all_messages() {
        let store = store();
        store
            .save_message(&MqttPacket::new("t", b"x".to_vec(), QoS::AtLeastOnce))
            .unwrap();
        store.delete_all_messages().unwrap();
        assert!(store.is_empty());
    }
}
