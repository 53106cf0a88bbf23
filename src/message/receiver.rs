//! Incoming message delivery queue
//!
//! Runs on its own task, separate from the transport loop, so a slow
//! subscriber never delays keep-alive traffic. Listeners attach to a topic
//! filter and receive packets over a channel; QoS 1/2 packets are persisted
//! first and flushed to whichever listeners are attached, then deleted.

use super::MqttPacket;
use crate::store::IncomingMessagePersistence;
use crate::topic;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// How long undelivered messages are kept; zero disables persistence
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl ReceiverConfig {
    pub fn persistence_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

enum ReceiverCommand {
    Arrived(MqttPacket),
    Attach {
        id: u64,
        filter: String,
        sender: mpsc::UnboundedSender<MqttPacket>,
    },
    Detach {
        id: u64,
    },
    ClearPersisted,
    Sync(oneshot::Sender<()>),
}

/// Handle to the delivery queue
#[derive(Clone)]
pub struct MessageReceiver {
    tx: mpsc::UnboundedSender<ReceiverCommand>,
    next_listener_id: Arc<AtomicU64>,
}

impl MessageReceiver {
    /// Spawn the delivery task; must be called inside a Tokio runtime
    pub fn start(store: Option<IncomingMessagePersistence>, config: ReceiverConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = crate::persistence_span!(persistence = config.persistence_enabled());
        let worker = ReceiverWorker::new(store, config);
        tokio::spawn(worker.run(rx).instrument(span));
        Self {
            tx,
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn message_arrived(&self, packet: MqttPacket) {
        let _ = self.tx.send(ReceiverCommand::Arrived(packet));
    }

    /// Attach a listener; persisted messages matching `filter` are flushed to it
    pub fn attach(&self, filter: &str) -> (ListenerToken, mpsc::UnboundedReceiver<MqttPacket>) {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = self.tx.send(ReceiverCommand::Attach {
            id,
            filter: filter.to_string(),
            sender,
        });
        let token = ListenerToken {
            id,
            filter: filter.to_string(),
            tx: self.tx.clone(),
            active: true,
        };
        (token, receiver)
    }

    pub fn clear_persisted_messages(&self) {
        let _ = self.tx.send(ReceiverCommand::ClearPersisted);
    }

    /// Resolves once every command queued before this call has been handled
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ReceiverCommand::Sync(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Cancellation handle for an attached listener; detaches on drop
pub struct ListenerToken {
    id: u64,
    filter: String,
    tx: mpsc::UnboundedSender<ReceiverCommand>,
    active: bool,
}

impl ListenerToken {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cancel(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.tx.send(ReceiverCommand::Detach { id: self.id });
        }
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        self.detach();
    }
}

struct Listener {
    filter: String,
    sender: mpsc::UnboundedSender<MqttPacket>,
}

struct ReceiverWorker {
    store: Option<IncomingMessagePersistence>,
    config: ReceiverConfig,
    listeners: HashMap<u64, Listener>,
    active_listeners: HashMap<String, usize>,
    cleanup_at: Option<Instant>,
}

impl ReceiverWorker {
    fn new(store: Option<IncomingMessagePersistence>, config: ReceiverConfig) -> Self {
        let store = store.filter(|_| config.persistence_enabled());
        let cleanup_at = store
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|_| Instant::now() + config.cleanup_interval);
        Self {
            store,
            config,
            listeners: HashMap::new(),
            active_listeners: HashMap::new(),
            cleanup_at,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ReceiverCommand>) {
        loop {
            let cleanup_at = self.cleanup_at;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until_opt(cleanup_at), if cleanup_at.is_some() => {
                    self.cleanup();
                }
            }
        }
        debug!("Message receiver stopped");
    }

    fn handle(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::Arrived(packet) => self.message_arrived(packet),
            ReceiverCommand::Attach { id, filter, sender } => {
                *self.active_listeners.entry(filter.clone()).or_insert(0) += 1;
                self.listeners.insert(id, Listener { filter, sender });
                self.flush();
            }
            ReceiverCommand::Detach { id } => self.detach(id),
            ReceiverCommand::ClearPersisted => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete_all_messages() {
                        warn!(error = %e, "Failed to clear persisted incoming messages");
                    }
                }
            }
            ReceiverCommand::Sync(done) => {
                let _ = done.send(());
            }
        }
    }

    fn detach(&mut self, id: u64) {
        if let Some(listener) = self.listeners.remove(&id) {
            if let Some(count) = self.active_listeners.get_mut(&listener.filter) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.active_listeners.remove(&listener.filter);
                }
            }
        }
    }

    fn message_arrived(&mut self, packet: MqttPacket) {
        let persist = self.store.is_some() && packet.qos.is_persistent();
        if !persist {
            if !self.publish(&packet) {
                debug!(topic = %packet.topic, "No listener attached, dropping message");
            }
            return;
        }

        let saved = match &self.store {
            Some(store) => store.save_message(&packet),
            None => return,
        };
        match saved {
            Ok(()) => self.flush(),
            Err(e) => {
                warn!(topic = %packet.topic, error = %e, "Failed to persist incoming message, delivering in memory");
                self.publish(&packet);
            }
        }
    }

    /// Send to every listener whose filter matches; true if any accepted it
    fn publish(&mut self, packet: &MqttPacket) -> bool {
        let mut delivered = false;
        let mut closed = Vec::new();
        for (id, listener) in &self.listeners {
            if !topic::matches(&listener.filter, &packet.topic) {
                continue;
            }
            if listener.sender.send(packet.clone()).is_ok() {
                delivered = true;
            } else {
                closed.push(*id);
            }
        }
        for id in closed {
            self.detach(id);
        }
        delivered
    }

    fn flush(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let filters: Vec<String> = self
            .active_listeners
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(filter, _)| filter.clone())
            .collect();

        if !filters.is_empty() {
            match store.get_messages_matching(&filters) {
                Ok(pending) => {
                    let delivered: Vec<String> = pending
                        .iter()
                        .filter(|packet| self.publish(packet))
                        .map(|packet| packet.id.clone())
                        .collect();
                    if !delivered.is_empty() {
                        match store.delete_messages(&delivered) {
                            Ok(count) => debug!(count, "Delivered persisted messages"),
                            Err(e) => warn!(error = %e, "Failed to delete delivered messages"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to load persisted messages"),
            }
        }

        self.schedule_cleanup();
    }

    /// Push the cleanup pass back to `cleanup_interval` from now
    fn schedule_cleanup(&mut self) {
        self.cleanup_at = Some(Instant::now() + self.config.cleanup_interval);
    }

    fn cleanup(&mut self) {
        self.cleanup_at = None;
        let Some(store) = self.store.clone() else {
            return;
        };

        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match store.delete_messages_older_than(cutoff) {
            Ok(removed) if removed > 0 => info!(removed, "Expired undelivered messages"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Incoming message cleanup failed, will retry"),
        }

        if !store.is_empty() {
            self.schedule_cleanup();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QoS;
    use crate::store::temporary_database;

    fn persistent_receiver() -> (MessageReceiver, IncomingMessagePersistence) {
        let db = temporary_database().unwrap();
        let store = IncomingMessagePersistence::open(&db, "client").unwrap();
        let receiver = MessageReceiver::start(
            Some(store.clone()),
            ReceiverConfig {
                ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(10),
            },
        );
        (receiver, store)
    }

    #[tokio::test]
    async fn test_live_listener_receives_qos0_without_persistence() {
        let (receiver, store) = persistent_receiver();
        let (_token, mut rx) = receiver.attach("chat");

        receiver.message_arrived(MqttPacket::new("chat", b"hi".to_vec(), QoS::AtMostOnce));
        receiver.sync().await;

        assert_eq!(rx.recv().await.unwrap().payload, b"hi".to_vec());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_qos1_without_listener_is_persisted_then_flushed_on_attach() {
        let (receiver, store) = persistent_receiver();
        receiver.message_arrived(MqttPacket::new("news", b"x".to_vec(), QoS::AtLeastOnce));
        receiver.sync().await;
        assert_eq!(store.len(), 1);

        let (_token, mut rx) = receiver.attach("news");
        receiver.sync().await;

        assert_eq!(rx.recv().await.unwrap().payload, b"x".to_vec());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_listener_flushes_matching_topics() {
        let (receiver, store) = persistent_receiver();
        receiver.message_arrived(MqttPacket::new("orders/1", b"a".to_vec(), QoS::AtLeastOnce));
        receiver.message_arrived(MqttPacket::new("other", b"b".to_vec(), QoS::AtLeastOnce));
        receiver.sync().await;

        let (_token, mut rx) = receiver.attach("orders/+");
        receiver.sync().await;

        assert_eq!(rx.recv().await.unwrap().topic, "orders/1");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_listener_stops_receiving() {
        let (receiver, store) = persistent_receiver();
        let (token, _rx) = receiver.attach("t");
        token.cancel();
        receiver.sync().await;

        receiver.message_arrived(MqttPacket::new("t", b"later".to_vec(), QoS::AtLeastOnce));
        receiver.sync().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_disabled_drops_unheard_messages() {
        let db = temporary_database().unwrap();
        let store = IncomingMessagePersistence::open(&db, "client").unwrap();
        let receiver = MessageReceiver::start(Some(store.clone()), ReceiverConfig::default());

        receiver.message_arrived(MqttPacket::new("t", b"x".to_vec(), QoS::AtLeastOnce));
        receiver.sync().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clear_persisted_messages() {
        let (receiver, store) = persistent_receiver();
        receiver.message_arrived(MqttPacket::new("t", b"x".to_vec(), QoS::ExactlyOnce));
        receiver.clear_persisted_messages();
        receiver.sync().await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_cleaned_up() {
        let db = temporary_database().unwrap();
        let store = IncomingMessagePersistence::open(&db, "client").unwrap();
        let mut stale = MqttPacket::new("t", b"old".to_vec(), QoS::AtLeastOnce);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(120);

        let receiver = MessageReceiver::start(
            Some(store.clone()),
            ReceiverConfig {
                ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(10),
            },
        );
        receiver.message_arrived(stale);
        receiver.sync().await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        receiver.sync().await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_waits_for_quiet_period_after_last_flush() {
        let (receiver, store) = persistent_receiver();
        let mut stale = MqttPacket::new("t", b"old".to_vec(), QoS::AtLeastOnce);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(120);
        receiver.message_arrived(stale);
        receiver.sync().await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        receiver.message_arrived(MqttPacket::new("t", b"new".to_vec(), QoS::AtLeastOnce));
        receiver.sync().await;

        // Ten seconds after the first flush, but only five after the second
        tokio::time::sleep(Duration::from_secs(5)).await;
        receiver.sync().await;
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        receiver.sync().await;
        let remaining = store.get_all_messages(&[]).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, b"new".to_vec());
    }
}
