//! Typed per-filter message streams

use crate::event::{CourierEventKind, EventSink};
use crate::message::{AdapterError, ListenerToken, MqttPacket};
use tokio::sync::mpsc;
use tracing::warn;

pub(crate) type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, AdapterError> + Send + Sync>;

/// Live messages for one topic filter.
///
/// Payloads that no adapter can decode are reported as
/// `MessageReceiveFailure` and skipped. Dropping the stream (or calling
/// [`TopicStream::cancel`]) detaches its listener.
pub struct TopicStream<T> {
    rx: mpsc::UnboundedReceiver<MqttPacket>,
    token: ListenerToken,
    decode: Decoder<T>,
    events: EventSink,
}

impl<T> TopicStream<T> {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<MqttPacket>,
        token: ListenerToken,
        decode: Decoder<T>,
        events: EventSink,
    ) -> Self {
        Self {
            rx,
            token,
            decode,
            events,
        }
    }

    pub fn filter(&self) -> &str {
        self.token.filter()
    }

    /// Next decoded message; `None` once the stream is detached
    pub async fn recv(&mut self) -> Option<T> {
        self.recv_with_topic().await.map(|(_, value)| value)
    }

    /// Next decoded message with the concrete topic it arrived on
    pub async fn recv_with_topic(&mut self) -> Option<(String, T)> {
        loop {
            let packet = self.rx.recv().await?;
            if let Some(value) = self.decode_packet(&packet) {
                return Some((packet.topic, value));
            }
        }
    }

    /// Non-blocking variant of [`TopicStream::recv_with_topic`]
    pub fn try_recv_with_topic(&mut self) -> Option<(String, T)> {
        while let Ok(packet) = self.rx.try_recv() {
            if let Some(value) = self.decode_packet(&packet) {
                return Some((packet.topic, value));
            }
        }
        None
    }

    pub fn cancel(self) {
        self.token.cancel();
    }

    fn decode_packet(&self, packet: &MqttPacket) -> Option<T> {
        match (self.decode)(&packet.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    topic = %packet.topic,
                    size_bytes = packet.size(),
                    error = %e,
                    "Dropping undecodable message"
                );
                self.events.emit(CourierEventKind::MessageReceiveFailure {
                    topic: packet.topic.clone(),
                    error: e.to_string(),
                    size_bytes: packet.size(),
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageAdaptersCoordinator, MessageReceiver, QoS, ReceiverConfig};
    use std::sync::Arc;

    fn stream_for<T>(
        receiver: &MessageReceiver,
        filter: &str,
        decode: Decoder<T>,
    ) -> (TopicStream<T>, mpsc::UnboundedReceiver<crate::event::CourierEvent>) {
        let (events, events_rx) = EventSink::channel();
        let (token, rx) = receiver.attach(filter);
        (TopicStream::new(rx, token, decode, events), events_rx)
    }

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Price {
        amount: u32,
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_reported_and_skipped() {
        let receiver = MessageReceiver::start(None, ReceiverConfig::default());
        let adapters = Arc::new(MessageAdaptersCoordinator::default());
        let decoder: Decoder<Price> = Box::new(move |payload| adapters.decode(payload));
        let (mut stream, mut events) = stream_for(&receiver, "prices/+", decoder);
        receiver.sync().await;

        receiver.message_arrived(MqttPacket::new("prices/a", b"not json".to_vec(), QoS::AtMostOnce));
        receiver.message_arrived(MqttPacket::new(
            "prices/b",
            br#"{"amount": 7}"#.to_vec(),
            QoS::AtMostOnce,
        ));

        let (topic, price) = stream.recv_with_topic().await.unwrap();
        assert_eq!(topic, "prices/b");
        assert_eq!(price, Price { amount: 7 });

        let failure = events.try_recv().unwrap();
        assert_eq!(failure.name(), "message_receive_failure");
    }

    #[tokio::test]
    async fn test_cancel_detaches_listener() {
        let receiver = MessageReceiver::start(None, ReceiverConfig::default());
        let decoder: Decoder<Vec<u8>> = Box::new(|payload| Ok(payload.to_vec()));
        let (stream, _events) = stream_for(&receiver, "news", decoder);
        assert_eq!(stream.filter(), "news");
        stream.cancel();
        receiver.sync().await;
    }
}
