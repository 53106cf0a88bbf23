//! Flattening of typed events into the named property maps host apps log
//!
//! Subscribe and unsubscribe events fan out into one entry per topic.

use crate::event::{CourierEvent, CourierEventKind};
use crate::message::QoS;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    pub name: &'static str,
    pub properties: Map<String, Value>,
}

impl BridgeEvent {
    fn bare(name: &'static str) -> Self {
        Self {
            name,
            properties: Map::new(),
        }
    }

    fn with(name: &'static str, properties: Value) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { name, properties }
    }
}

fn topics_with_qos(
    name: &'static str,
    topics: &[(String, QoS)],
    extra: impl Fn(&mut Map<String, Value>),
) -> Vec<BridgeEvent> {
    topics
        .iter()
        .map(|(topic, qos)| {
            let mut event = BridgeEvent::with(name, json!({ "topic": topic, "qos": qos.as_u8() }));
            extra(&mut event.properties);
            event
        })
        .collect()
}

fn topics_only(
    name: &'static str,
    topics: &[String],
    extra: impl Fn(&mut Map<String, Value>),
) -> Vec<BridgeEvent> {
    topics
        .iter()
        .map(|topic| {
            let mut event = BridgeEvent::with(name, json!({ "topic": topic }));
            extra(&mut event.properties);
            event
        })
        .collect()
}

/// Map one event to the entries reported to the host
pub fn map_event(event: &CourierEvent) -> Vec<BridgeEvent> {
    use CourierEventKind::*;

    let single = match &event.kind {
        AuthStart { source } => BridgeEvent::with("Courier Auth Start", json!({ "source": source })),
        AuthSuccess {
            host,
            port,
            elapsed_ms,
        } => BridgeEvent::with(
            "Courier Auth Success",
            json!({ "host": host, "port": port, "timeTaken": elapsed_ms }),
        ),
        AuthFailure { error, elapsed_ms } => BridgeEvent::with(
            "Courier Auth Failure",
            json!({ "reason": error.to_string(), "timeTaken": elapsed_ms }),
        ),
        ConnectionAttempt => BridgeEvent::bare("Mqtt Connect Attempt"),
        ConnectionSuccess { elapsed_ms } => {
            BridgeEvent::with("Mqtt Connect Success", json!({ "timeTaken": elapsed_ms }))
        }
        ConnectionFailure { elapsed_ms, error } => BridgeEvent::with(
            "Mqtt Connect Failure",
            json!({ "reason": format!("{:?}", error.kind), "timeTaken": elapsed_ms }),
        ),
        ConnectionLost {
            elapsed_ms, error, ..
        } => BridgeEvent::with(
            "Mqtt Connection Lost",
            json!({ "reason": format!("{:?}", error.kind), "timeTaken": elapsed_ms }),
        ),
        ConnectionDisconnect => BridgeEvent::bare("Mqtt Disconnect"),
        CourierDisconnect { clear_state } => {
            BridgeEvent::with("Courier Disconnect", json!({ "ClearState": clear_state }))
        }
        Reconnect => BridgeEvent::bare("Mqtt Reconnect"),
        ConnectDiscarded { reason } => {
            BridgeEvent::with("Mqtt Connect Discarded", json!({ "reason": reason }))
        }

        SubscribeAttempt { topics } => {
            return topics_with_qos("Mqtt Subscribe Attempt", topics, |_| {})
        }
        SubscribeSuccess { topics, elapsed_ms } => {
            return topics_with_qos("Mqtt Subscribe Success", topics, |props| {
                props.insert("timeTaken".into(), json!(elapsed_ms));
            })
        }
        SubscribeFailure {
            topics,
            error,
            elapsed_ms,
        } => {
            return topics_with_qos("Mqtt Subscribe Failure", topics, |props| {
                props.insert("timeTaken".into(), json!(elapsed_ms));
                props.insert("reason".into(), json!(error));
            })
        }
        UnsubscribeAttempt { topics } => {
            return topics_only("Mqtt Unsubscribe Attempt", topics, |_| {})
        }
        UnsubscribeSuccess { topics, elapsed_ms } => {
            return topics_only("Mqtt Unsubscribe Success", topics, |props| {
                props.insert("timeTaken".into(), json!(elapsed_ms));
            })
        }
        UnsubscribeFailure {
            topics,
            error,
            elapsed_ms,
        } => {
            return topics_only("Mqtt Unsubscribe Failure", topics, |props| {
                props.insert("timeTaken".into(), json!(elapsed_ms));
                props.insert("reason".into(), json!(error));
            })
        }

        Ping { host } => BridgeEvent::with("Mqtt Ping Initiated", json!({ "host": host })),
        PongReceived { elapsed_ms } => {
            BridgeEvent::with("Mqtt Ping Success", json!({ "timeTaken": elapsed_ms }))
        }
        PingFailure { elapsed_ms, error } => BridgeEvent::with(
            "Mqtt Ping Failure",
            json!({ "timeTaken": elapsed_ms, "reason": error }),
        ),

        MessageReceive { topic, size_bytes } => BridgeEvent::with(
            "Mqtt Message Receive",
            json!({ "topic": topic, "sizeBytes": size_bytes }),
        ),
        MessageReceiveFailure {
            topic,
            error,
            size_bytes,
        } => BridgeEvent::with(
            "Mqtt Message Receive Failure",
            json!({ "topic": topic, "reason": error, "sizeBytes": size_bytes }),
        ),
        MessageSend {
            topic,
            qos,
            size_bytes,
        } => BridgeEvent::with(
            "Mqtt Message Send Attempt",
            json!({ "topic": topic, "qos": qos.as_u8(), "sizeBytes": size_bytes }),
        ),
        MessageSendSuccess {
            topic,
            qos,
            size_bytes,
        } => BridgeEvent::with(
            "Mqtt Message Send Success",
            json!({ "topic": topic, "qos": qos.as_u8(), "sizeBytes": size_bytes }),
        ),
        MessageSendFailure {
            topic,
            qos,
            error,
            size_bytes,
        } => BridgeEvent::with(
            "Mqtt Message Send Failure",
            json!({
                "topic": topic,
                "qos": qos.as_u8(),
                "reason": error,
                "sizeBytes": size_bytes
            }),
        ),

        AppForeground => BridgeEvent::bare("App Foreground"),
        AppBackground => BridgeEvent::bare("App Background"),
        ConnectionAvailable => BridgeEvent::bare("Network Available"),
        ConnectionUnavailable => BridgeEvent::bare("Network Unavailable"),
    };
    vec![single]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportErrorKind};

    fn names(kind: CourierEventKind) -> Vec<&'static str> {
        map_event(&CourierEvent::new(kind))
            .into_iter()
            .map(|event| event.name)
            .collect()
    }

    #[test]
    fn test_subscribe_events_fan_out_per_topic() {
        let events = map_event(&CourierEvent::new(CourierEventKind::SubscribeSuccess {
            topics: vec![
                ("a".to_string(), QoS::AtMostOnce),
                ("b".to_string(), QoS::AtLeastOnce),
            ],
            elapsed_ms: 12,
        }));

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, "Mqtt Subscribe Success");
        assert_eq!(events[1].properties["topic"], json!("b"));
        assert_eq!(events[1].properties["qos"], json!(1));
        assert_eq!(events[1].properties["timeTaken"], json!(12));
    }

    #[test]
    fn test_connection_failure_reports_reason_kind() {
        let events = map_event(&CourierEvent::new(CourierEventKind::ConnectionFailure {
            elapsed_ms: 30,
            error: TransportError::new(TransportErrorKind::Timeout, "no CONNACK"),
        }));
        assert_eq!(events[0].name, "Mqtt Connect Failure");
        assert_eq!(events[0].properties["reason"], json!("Timeout"));
    }

    #[test]
    fn test_lifecycle_names() {
        assert_eq!(names(CourierEventKind::ConnectionAvailable), vec!["Network Available"]);
        assert_eq!(names(CourierEventKind::ConnectionUnavailable), vec!["Network Unavailable"]);
        assert_eq!(names(CourierEventKind::Reconnect), vec!["Mqtt Reconnect"]);
        assert!(names(CourierEventKind::UnsubscribeAttempt { topics: vec![] }).is_empty());
    }
}
