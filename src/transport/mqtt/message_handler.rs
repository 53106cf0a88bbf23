//! Pure routing of rumqttc events and request bookkeeping
//!
//! rumqttc reports packet ids only when a request leaves the socket, so
//! requests are queued per kind in submission order and paired with the
//! `Outgoing` events as they appear.

use crate::message::{MqttPacket, QoS};
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, SubscribeReasonCode, UnsubAckReason};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum TransportRoute {
    ConnectionAcknowledged { session_present: bool },
    MessageReceived(MqttPacket),
    PublishAcknowledged { pkid: u16, success: bool },
    SubscribeAcknowledged { pkid: u16, failures: Vec<String> },
    UnsubscribeAcknowledged { pkid: u16, failures: Vec<String> },
    PingResponse,
    BrokerDisconnect(String),
    PublishSent(u16),
    SubscribeSent(u16),
    UnsubscribeSent(u16),
    PingSent,
    InboundTraffic,
    OutboundTraffic,
}

pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc event (pure function)
    pub fn route_mqtt_event(event: &Event) -> TransportRoute {
        match event {
            Event::Incoming(packet) => Self::route_incoming(packet),
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => TransportRoute::PublishSent(*pkid),
                Outgoing::Subscribe(pkid) => TransportRoute::SubscribeSent(*pkid),
                Outgoing::Unsubscribe(pkid) => TransportRoute::UnsubscribeSent(*pkid),
                Outgoing::PingReq => TransportRoute::PingSent,
                _ => TransportRoute::OutboundTraffic,
            },
        }
    }

    fn route_incoming(packet: &Packet) -> TransportRoute {
        match packet {
            Packet::ConnAck(connack) => TransportRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => {
                let qos = QoS::try_from(publish.qos as u8).unwrap_or(QoS::AtMostOnce);
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                TransportRoute::MessageReceived(
                    MqttPacket::new(topic, publish.payload.to_vec(), qos)
                        .with_flags(publish.retain, publish.dup),
                )
            }
            Packet::PubAck(ack) => TransportRoute::PublishAcknowledged {
                pkid: ack.pkid,
                success: matches!(
                    ack.reason,
                    PubAckReason::Success | PubAckReason::NoMatchingSubscribers
                ),
            },
            Packet::PubComp(comp) => TransportRoute::PublishAcknowledged {
                pkid: comp.pkid,
                success: true,
            },
            Packet::SubAck(suback) => TransportRoute::SubscribeAcknowledged {
                pkid: suback.pkid,
                failures: suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .map(|code| format!("{code:?}"))
                    .collect(),
            },
            Packet::UnsubAck(unsuback) => TransportRoute::UnsubscribeAcknowledged {
                pkid: unsuback.pkid,
                failures: unsuback
                    .reasons
                    .iter()
                    .filter(|reason| !matches!(reason, UnsubAckReason::Success))
                    .map(|reason| format!("{reason:?}"))
                    .collect(),
            },
            Packet::PingResp(_) => TransportRoute::PingResponse,
            Packet::Disconnect(disconnect) => {
                TransportRoute::BrokerDisconnect(format!("{:?}", disconnect.reason_code))
            }
            _ => TransportRoute::InboundTraffic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub id: String,
    pub topic: String,
    pub qos: QoS,
    pub size_bytes: usize,
    pub sent_at: Instant,
}

impl PendingPublish {
    pub fn from_packet(packet: &MqttPacket, now: Instant) -> Self {
        Self {
            id: packet.id.clone(),
            topic: packet.topic.clone(),
            qos: packet.qos,
            size_bytes: packet.size(),
            sent_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubscribe {
    pub topics: Vec<(String, QoS)>,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUnsubscribe {
    pub topic: String,
    pub sent_at: Instant,
}

/// Pairs client requests with the packet ids rumqttc assigns to them
#[derive(Debug, Default)]
pub struct RequestTracker {
    queued_publishes: VecDeque<PendingPublish>,
    queued_subscribes: VecDeque<PendingSubscribe>,
    queued_unsubscribes: VecDeque<PendingUnsubscribe>,
    awaiting_puback: HashMap<u16, PendingPublish>,
    awaiting_suback: HashMap<u16, PendingSubscribe>,
    awaiting_unsuback: HashMap<u16, PendingUnsubscribe>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_publish(&mut self, publish: PendingPublish) {
        self.queued_publishes.push_back(publish);
    }

    /// Undo the most recent queue_publish after the request was rejected
    pub fn unqueue_publish(&mut self) -> Option<PendingPublish> {
        self.queued_publishes.pop_back()
    }

    pub fn queue_subscribe(&mut self, subscribe: PendingSubscribe) {
        self.queued_subscribes.push_back(subscribe);
    }

    pub fn unqueue_subscribe(&mut self) -> Option<PendingSubscribe> {
        self.queued_subscribes.pop_back()
    }

    pub fn queue_unsubscribe(&mut self, unsubscribe: PendingUnsubscribe) {
        self.queued_unsubscribes.push_back(unsubscribe);
    }

    pub fn unqueue_unsubscribe(&mut self) -> Option<PendingUnsubscribe> {
        self.queued_unsubscribes.pop_back()
    }

    /// A publish left the socket. QoS 0 publishes complete here and are returned.
    pub fn publish_sent(&mut self, pkid: u16) -> Option<PendingPublish> {
        let publish = self.queued_publishes.pop_front()?;
        if publish.qos == QoS::AtMostOnce || pkid == 0 {
            return Some(publish);
        }
        self.awaiting_puback.insert(pkid, publish);
        None
    }

    pub fn publish_acked(&mut self, pkid: u16) -> Option<PendingPublish> {
        self.awaiting_puback.remove(&pkid)
    }

    pub fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(subscribe) = self.queued_subscribes.pop_front() {
            self.awaiting_suback.insert(pkid, subscribe);
        }
    }

    pub fn subscribe_acked(&mut self, pkid: u16) -> Option<PendingSubscribe> {
        self.awaiting_suback.remove(&pkid)
    }

    pub fn unsubscribe_sent(&mut self, pkid: u16) {
        if let Some(unsubscribe) = self.queued_unsubscribes.pop_front() {
            self.awaiting_unsuback.insert(pkid, unsubscribe);
        }
    }

    pub fn unsubscribe_acked(&mut self, pkid: u16) -> Option<PendingUnsubscribe> {
        self.awaiting_unsuback.remove(&pkid)
    }

    /// Ids of publishes handed to the current event loop and not yet acknowledged
    pub fn in_flight_ids(&self) -> HashSet<String> {
        self.queued_publishes
            .iter()
            .chain(self.awaiting_puback.values())
            .map(|publish| publish.id.clone())
            .collect()
    }

    /// Drop everything; returns the abandoned publishes
    pub fn clear(&mut self) -> Vec<PendingPublish> {
        self.queued_subscribes.clear();
        self.queued_unsubscribes.clear();
        self.awaiting_suback.clear();
        self.awaiting_unsuback.clear();
        let mut abandoned: Vec<PendingPublish> = self.queued_publishes.drain(..).collect();
        abandoned.extend(self.awaiting_puback.drain().map(|(_, publish)| publish));
        abandoned
    }

    pub fn is_empty(&self) -> bool {
        self.queued_publishes.is_empty()
            && self.queued_subscribes.is_empty()
            && self.queued_unsubscribes.is_empty()
            && self.awaiting_puback.is_empty()
            && self.awaiting_suback.is_empty()
            && self.awaiting_unsuback.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, PubAck};

    fn pending(qos: QoS) -> PendingPublish {
        PendingPublish::from_packet(&MqttPacket::new("t", b"x".to_vec(), qos), Instant::now())
    }

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            TransportRoute::ConnectionAcknowledged {
                session_present: true
            }
        );
    }

    #[test]
    fn test_route_puback_and_outgoing() {
        let event = Event::Incoming(Packet::PubAck(PubAck {
            pkid: 7,
            reason: PubAckReason::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            TransportRoute::PublishAcknowledged {
                pkid: 7,
                success: true
            }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            TransportRoute::PingSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(3))),
            TransportRoute::SubscribeSent(3)
        );
    }

    #[test]
    fn test_qos0_publish_completes_on_send() {
        let mut tracker = RequestTracker::new();
        let publish = pending(QoS::AtMostOnce);
        tracker.queue_publish(publish.clone());

        assert_eq!(tracker.publish_sent(0), Some(publish));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_qos1_publish_waits_for_ack() {
        let mut tracker = RequestTracker::new();
        let first = pending(QoS::AtLeastOnce);
        let second = pending(QoS::ExactlyOnce);
        tracker.queue_publish(first.clone());
        tracker.queue_publish(second.clone());

        assert_eq!(tracker.publish_sent(1), None);
        assert_eq!(tracker.publish_sent(2), None);
        assert_eq!(tracker.in_flight_ids().len(), 2);

        assert_eq!(tracker.publish_acked(2), Some(second));
        assert_eq!(tracker.publish_acked(1), Some(first));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_subscribe_pairs_in_order() {
        let mut tracker = RequestTracker::new();
        let now = Instant::now();
        tracker.queue_subscribe(PendingSubscribe {
            topics: vec![("a".to_string(), QoS::AtMostOnce)],
            sent_at: now,
        });
        tracker.queue_subscribe(PendingSubscribe {
            topics: vec![("b".to_string(), QoS::AtLeastOnce)],
            sent_at: now,
        });

        tracker.subscribe_sent(10);
        tracker.subscribe_sent(11);
        assert_eq!(tracker.subscribe_acked(11).unwrap().topics[0].0, "b");
        assert_eq!(tracker.subscribe_acked(10).unwrap().topics[0].0, "a");
        assert!(tracker.subscribe_acked(10).is_none());
    }

    #[test]
    fn test_clear_returns_abandoned_publishes() {
        let mut tracker = RequestTracker::new();
        tracker.queue_publish(pending(QoS::AtLeastOnce));
        tracker.queue_publish(pending(QoS::AtLeastOnce));
        tracker.publish_sent(4);
        tracker.queue_unsubscribe(PendingUnsubscribe {
            topic: "t".to_string(),
            sent_at: Instant::now(),
        });

        assert_eq!(tracker.clear().len(), 2);
        assert!(tracker.is_empty());
    }
}
