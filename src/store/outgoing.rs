//! Flow records for QoS 1/2 publishes awaiting acknowledgement

use super::{tree_name, StorageError};
use crate::message::{MqttPacket, QoS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingFlow {
    pub id: String,
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<&MqttPacket> for OutgoingFlow {
    fn from(packet: &MqttPacket) -> Self {
        Self {
            id: packet.id.clone(),
            topic: packet.topic.clone(),
            qos: packet.qos,
            payload: packet.payload.clone(),
            created_at: packet.timestamp,
        }
    }
}

impl From<OutgoingFlow> for MqttPacket {
    fn from(flow: OutgoingFlow) -> Self {
        MqttPacket {
            id: flow.id,
            topic: flow.topic,
            qos: flow.qos,
            payload: flow.payload,
            timestamp: flow.created_at,
            retained: false,
            duplicate: true,
        }
    }
}

#[derive(Clone)]
pub struct OutgoingMessagePersistence {
    db: Db,
    flows: Tree,
}

impl OutgoingMessagePersistence {
    pub fn open(db: &Db, client_id: &str) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            flows: db.open_tree(tree_name("outgoing", client_id))?,
        })
    }

    pub fn save(&self, packet: &MqttPacket) -> Result<(), StorageError> {
        let flow = OutgoingFlow::from(packet);
        self.flows
            .insert(flow.id.as_bytes(), serde_json::to_vec(&flow)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// Drop the flow for an acknowledged or abandoned publish
    pub fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let removed = self.flows.remove(id.as_bytes())?.is_some();
        if removed {
            self.db.flush()?;
        }
        Ok(removed)
    }

    pub fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.flows.contains_key(id.as_bytes())?)
    }

    /// All pending flows, oldest first
    pub fn flows(&self) -> Result<Vec<OutgoingFlow>, StorageError> {
        let mut flows = Vec::with_capacity(self.flows.len());
        for entry in self.flows.iter() {
            let (_, value) = entry?;
            flows.push(serde_json::from_slice::<OutgoingFlow>(&value)?);
        }
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }

    pub fn delete_all(&self) -> Result<usize, StorageError> {
        let count = self.flows.len();
        self.flows.clear()?;
        self.db.flush()?;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
