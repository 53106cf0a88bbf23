//! Message model shared by the transport, the persistence stores and the
//! receive path.

pub mod adapter;
pub mod receiver;

pub use adapter::{
    AdapterError, JsonMessageAdapter, MessageAdapter, MessageAdaptersCoordinator,
    TextMessageAdapter,
};
pub use receiver::{ListenerToken, MessageReceiver, ReceiverConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// MQTT delivery guarantee tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// QoS 1 and 2 packets are worth persisting; QoS 0 has no redelivery value.
    pub fn is_persistent(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid QoS level: {0}")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

/// A single application message travelling through the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttPacket {
    pub id: String,
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retained: bool,
    #[serde(default)]
    pub duplicate: bool,
}

impl MqttPacket {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            qos,
            payload: payload.into(),
            timestamp: Utc::now(),
            retained: false,
            duplicate: false,
        }
    }

    /// Tag an incoming packet with the wire flags it arrived with
    pub fn with_flags(mut self, retained: bool, duplicate: bool) -> Self {
        self.retained = retained;
        self.duplicate = duplicate;
        self
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversions() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(InvalidQoS(3)));
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }

    #[test]
    fn test_qos_persistence_tier() {
        assert!(!QoS::AtMostOnce.is_persistent());
        assert!(QoS::AtLeastOnce.is_persistent());
        assert!(QoS::ExactlyOnce.is_persistent());
    }

    #[test]
    fn test_qos_serializes_as_number() {
        let json = serde_json::to_string(&QoS::AtLeastOnce).unwrap();
        assert_eq!(json, "1");
        let qos: QoS = serde_json::from_str("2").unwrap();
        assert_eq!(qos, QoS::ExactlyOnce);
        assert!(serde_json::from_str::<QoS>("7").is_err());
    }

    #[test]
    fn test_packet_ids_are_unique() {
        let a = MqttPacket::new("t", b"x".to_vec(), QoS::AtLeastOnce);
        let b = MqttPacket::new("t", b"x".to_vec(), QoS::AtLeastOnce);
        assert_ne!(a.id, b.id);
        assert_eq!(a.size(), 1);
        assert!(!a.retained && !a.duplicate);
    }
}
