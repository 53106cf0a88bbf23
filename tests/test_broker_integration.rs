//! Integration tests against a real MQTT broker
//!
//! Assumes a broker (e.g. mosquitto) listening on localhost:1883 without
//! authentication. Run with `cargo test -- --ignored`.

mod test_helpers;

use courier_mqtt::auth::StaticAuthenticator;
use courier_mqtt::message::QoS;
use courier_mqtt::testing::RecordingEventHandler;
use courier_mqtt::transport::ConnectOptions;
use courier_mqtt::{ConnectionState, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::eventually_within;
use tokio::time::timeout;

const BROKER_HOST: &str = "localhost";
const BROKER_PORT: u16 = 1883;

fn live_session(client_id: &str) -> (SessionManager, Arc<RecordingEventHandler>) {
    let options = ConnectOptions::new(BROKER_HOST, BROKER_PORT, client_id).with_keep_alive(10);
    let events = Arc::new(RecordingEventHandler::new());
    let session = SessionManager::builder(Arc::new(StaticAuthenticator::new(options)))
        .event_handler(events.clone())
        .build()
        .expect("session should build");
    (session, events)
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_connects_to_real_broker() {
    let (session, events) = live_session("courier-it-connect");

    session.connect();

    assert!(
        eventually_within(Duration::from_secs(10), || session.connection_state()
            == ConnectionState::Connected)
        .await
    );
    assert_eq!(events.count("connection_success"), 1);

    session.disconnect();
    session.sync().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_publish_reaches_subscriber_through_broker() {
    let (subscriber, _) = live_session("courier-it-sub");
    let (publisher, publisher_events) = live_session("courier-it-pub");

    subscriber.connect();
    subscriber
        .subscribe([("courier/it/echo", QoS::AtLeastOnce)])
        .unwrap();
    let mut stream = subscriber.receive_bytes("courier/it/#").unwrap();
    assert!(
        eventually_within(Duration::from_secs(10), || subscriber.connection_state()
            == ConnectionState::Connected)
        .await
    );
    // Let the SUBACK land before publishing
    tokio::time::sleep(Duration::from_millis(500)).await;

    publisher.connect();
    publisher
        .publish_bytes("courier/it/echo", b"ping".to_vec(), QoS::AtLeastOnce)
        .unwrap();

    let received = timeout(Duration::from_secs(10), stream.recv_with_topic())
        .await
        .expect("message should arrive")
        .expect("stream should stay open");
    assert_eq!(received, ("courier/it/echo".to_string(), b"ping".to_vec()));
    assert!(
        eventually_within(Duration::from_secs(5), || publisher_events
            .count("message_send_success")
            >= 1)
        .await
    );

    subscriber.destroy();
    publisher.destroy();
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_unreachable_broker_reports_connection_failure() {
    let options = ConnectOptions::new("127.0.0.1", 9, "courier-it-unreachable");
    let events = Arc::new(RecordingEventHandler::new());
    let session = SessionManager::builder(Arc::new(StaticAuthenticator::new(options)))
        .event_handler(events.clone())
        .build()
        .unwrap();

    session.connect();

    assert!(
        eventually_within(Duration::from_secs(10), || events.count("connection_failure") >= 1)
            .await
    );
    assert_ne!(session.connection_state(), ConnectionState::Connected);
    session.destroy();
}
