//! Events delivered to subscribers and the subscriber registry.
//!
//! Delivery always happens on the dispatch consumer, in the order events were
//! queued. Every current subscriber sees every event it is interested in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    /// Data pushed by the terminal (serial-in callback).
    SerialInReceived { type_code: i32, value: String },
    /// Device link state reported by the native module.
    DeviceStateChanged { connected: bool, device_id: String },
    ConnectionStatusChanged { connected: bool },
    LogMessage { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SerialInReceived,
    DeviceStateChanged,
    ConnectionStatusChanged,
    LogMessage,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::SerialInReceived { .. } => EventKind::SerialInReceived,
            HubEvent::DeviceStateChanged { .. } => EventKind::DeviceStateChanged,
            HubEvent::ConnectionStatusChanged { .. } => EventKind::ConnectionStatusChanged,
            HubEvent::LogMessage { .. } => EventKind::LogMessage,
        }
    }

    pub(crate) fn log(message: impl Into<String>) -> Self {
        HubEvent::LogMessage {
            message: message.into(),
        }
    }
}

/// Handle returned by `subscribe*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

type Listener = Arc<dyn Fn(&HubEvent) + Send + Sync>;

struct Entry {
    kinds: Option<Vec<EventKind>>,
    listener: Listener,
}

impl Entry {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// Registry of event listeners keyed by subscription id.
#[derive(Default)]
pub struct Subscribers {
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(listener))
    }

    /// Subscribe to a subset of event kinds only.
    pub fn subscribe_to<F>(&self, kinds: &[EventKind], listener: F) -> SubscriptionId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kinds.to_vec()), Arc::new(listener))
    }

    /// Subscribe with an async receiver instead of a callback.
    ///
    /// Events are dropped once the receiver goes away; unsubscribe to release
    /// the registry slot.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan an event out to every interested listener.
    ///
    /// Listeners run outside the registry lock, so they may (un)subscribe.
    pub fn publish(&self, event: &HubEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .lock()
            .values()
            .filter(|e| e.wants(kind))
            .map(|e| e.listener.clone())
            .collect();

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = ?kind, "Event listener panicked");
            }
        }
    }

    fn insert(&self, kinds: Option<Vec<EventKind>>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.lock().insert(id, Entry { kinds, listener });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let subs = Subscribers::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        subs.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        subs.subscribe(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        subs.publish(&HubEvent::ConnectionStatusChanged { connected: true });
        subs.publish(&HubEvent::log("hello"));

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kind_filter() {
        let subs = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        subs.subscribe_to(&[EventKind::SerialInReceived], move |e| {
            seen2.lock().unwrap().push(e.clone());
        });

        subs.publish(&HubEvent::log("ignored"));
        subs.publish(&HubEvent::SerialInReceived {
            type_code: 3,
            value: "4.50".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), EventKind::SerialInReceived);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let subs = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = subs.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        subs.publish(&HubEvent::log("one"));
        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        subs.publish(&HubEvent::log("two"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let subs = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        subs.subscribe(|_| panic!("listener bug"));
        subs.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        subs.publish(&HubEvent::log("still delivered"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_subscription_receives_clone() {
        let subs = Subscribers::new();
        let (_id, mut rx) = subs.subscribe_channel();
        let event = HubEvent::DeviceStateChanged {
            connected: false,
            device_id: "PAX-01".into(),
        };
        subs.publish(&event);
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(HubEvent::SerialInReceived {
            type_code: 7,
            value: "OK".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "serial_in_received");
        assert_eq!(json["type_code"], 7);
        assert_eq!(json["value"], "OK");
    }
}
