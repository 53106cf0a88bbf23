//! Subscription store durability and invariants

use courier_mqtt::message::QoS;
use courier_mqtt::store::{open_database, temporary_database, SubscriptionState, SubscriptionStore};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Subscribe(String, QoS),
    Unsubscribe(String),
    Ack(String),
    Clear,
}

fn qos() -> impl Strategy<Value = QoS> {
    prop_oneof![
        Just(QoS::AtMostOnce),
        Just(QoS::AtLeastOnce),
        Just(QoS::ExactlyOnce)
    ]
}

fn op() -> impl Strategy<Value = Op> {
    let topic = prop_oneof![Just("a"), Just("a/b"), Just("c/+"), Just("d/#")].prop_map(String::from);
    prop_oneof![
        4 => (topic.clone(), qos()).prop_map(|(t, q)| Op::Subscribe(t, q)),
        3 => topic.clone().prop_map(Op::Unsubscribe),
        2 => topic.prop_map(Op::Ack),
        1 => Just(Op::Clear),
    ]
}

/// Expected state computed without the store
fn model(ops: &[Op]) -> SubscriptionState {
    let mut subscriptions = HashMap::new();
    let mut pending = HashSet::new();
    for op in ops {
        match op {
            Op::Subscribe(topic, qos) => {
                pending.remove(topic);
                subscriptions.insert(topic.clone(), *qos);
            }
            Op::Unsubscribe(topic) => {
                subscriptions.remove(topic);
                pending.insert(topic.clone());
            }
            Op::Ack(topic) => {
                pending.remove(topic);
            }
            Op::Clear => {
                subscriptions.clear();
                pending.clear();
            }
        }
    }
    SubscriptionState {
        subscriptions,
        pending_unsubscriptions: pending,
    }
}

fn apply(store: &SubscriptionStore, op: &Op) {
    match op {
        Op::Subscribe(topic, qos) => store.subscribe(&[(topic.clone(), *qos)]).unwrap(),
        Op::Unsubscribe(topic) => store.unsubscribe(&[topic.clone()]).unwrap(),
        Op::Ack(topic) => store.unsubscribe_acked(&[topic.clone()]).unwrap(),
        Op::Clear => store.clear_all_subscriptions().unwrap(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn store_matches_model_and_survives_reopen(ops in prop::collection::vec(op(), 0..30)) {
        let dir = TempDir::new().unwrap();
        let expected = model(&ops);

        {
            let db = open_database(dir.path()).unwrap();
            let store = SubscriptionStore::open(&db, "props").unwrap();
            for op in &ops {
                apply(&store, op);
                let snapshot = store.snapshot();
                for topic in snapshot.subscriptions.keys() {
                    prop_assert!(!snapshot.pending_unsubscriptions.contains(topic));
                }
            }
            prop_assert_eq!(store.snapshot(), expected.clone());
        }

        let db = open_database(dir.path()).unwrap();
        let reopened = SubscriptionStore::open(&db, "props").unwrap();
        prop_assert_eq!(reopened.snapshot(), expected);
    }
}

#[test]
fn test_client_ids_are_isolated() {
    let db = temporary_database().unwrap();
    let alice = SubscriptionStore::open(&db, "alice").unwrap();
    let bob = SubscriptionStore::open(&db, "bob").unwrap();

    alice.subscribe(&[("shared".to_string(), QoS::AtLeastOnce)]).unwrap();
    bob.subscribe(&[("shared".to_string(), QoS::AtMostOnce)]).unwrap();
    alice.clear_all_subscriptions().unwrap();

    assert!(alice.subscriptions().is_empty());
    assert_eq!(bob.subscriptions().get("shared"), Some(&QoS::AtMostOnce));
}

#[test]
fn test_pending_flag_check() {
    let db = temporary_database().unwrap();
    let store = SubscriptionStore::open(&db, "client").unwrap();

    store.subscribe(&[("x".to_string(), QoS::AtLeastOnce)]).unwrap();
    assert!(!store.is_currently_pending_unsubscribe("x"));

    store.unsubscribe(&["x".to_string()]).unwrap();
    assert!(store.is_currently_pending_unsubscribe("x"));

    store.unsubscribe_acked(&["x".to_string()]).unwrap();
    assert!(!store.is_currently_pending_unsubscribe("x"));
}
