//! Multicast dispatch of events to observers
//!
//! Handlers live in two tiers: plain observers, invoked in registration
//! order, and at most one composed client invoked after all of them so
//! that a nested client sees terminal state last.

use super::CourierEvent;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &CourierEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&CourierEvent) + Send + Sync,
{
    fn on_event(&self, event: &CourierEvent) {
        self(event)
    }
}

pub type HandlerId = u64;

#[derive(Default)]
struct Handlers {
    next_id: HandlerId,
    observers: Vec<(HandlerId, Arc<dyn EventHandler>)>,
    composed: Option<Arc<dyn EventHandler>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Handlers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.observers.push((id, handler));
        id
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.observers.len();
        handlers.observers.retain(|(handler_id, _)| *handler_id != id);
        handlers.observers.len() != before
    }

    /// Install (or clear) the composed client observer
    pub fn set_composed_client(&self, client: Option<Arc<dyn EventHandler>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.composed = client;
    }

    pub fn handler_count(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.observers.len() + usize::from(handlers.composed.is_some())
    }

    pub fn dispatch(&self, event: &CourierEvent) {
        // Snapshot so handlers may register or remove handlers re-entrantly
        let (observers, composed) = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            let observers: Vec<Arc<dyn EventHandler>> = handlers
                .observers
                .iter()
                .map(|(_, handler)| handler.clone())
                .collect();
            (observers, handlers.composed.clone())
        };

        trace!(event = event.name(), observers = observers.len(), "Dispatching event");
        for observer in observers {
            observer.on_event(event);
        }
        if let Some(client) = composed {
            client.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CourierEventKind;
    use std::sync::Mutex;

    fn recorder(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(move |event: &CourierEvent| {
            log.lock()
                .unwrap()
                .push(format!("{label}:{}", event.name()));
        })
    }

    #[test]
    fn test_composed_client_invoked_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();

        bus.set_composed_client(Some(recorder(log.clone(), "composed")));
        bus.add_event_handler(recorder(log.clone(), "first"));
        bus.add_event_handler(recorder(log.clone(), "second"));

        bus.dispatch(&CourierEvent::new(CourierEventKind::ConnectionAttempt));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:connection_attempt",
                "second:connection_attempt",
                "composed:connection_attempt"
            ]
        );
    }

    #[test]
    fn test_remove_event_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let id = bus.add_event_handler(recorder(log.clone(), "gone"));
        assert_eq!(bus.handler_count(), 1);

        assert!(bus.remove_event_handler(id));
        assert!(!bus.remove_event_handler(id));
        bus.dispatch(&CourierEvent::new(CourierEventKind::AppForeground));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.add_event_handler(Arc::new(move |_: &CourierEvent| {
            inner_bus.add_event_handler(Arc::new(|_: &CourierEvent| {}));
        }));

        bus.dispatch(&CourierEvent::new(CourierEventKind::AppBackground));
        assert_eq!(bus.handler_count(), 2);
    }
}
