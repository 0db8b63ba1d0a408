//! Per-shortcut fan-out of lifecycle events.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// A lifecycle notification for one shortcut
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub shortcut_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The process was spawned
    Started { pid: u32 },
    /// Hooks or spawn failed; nothing is running
    LaunchFailed { reason: String },
    /// The process finished on its own (or the host reported the app closed)
    End { status: i32 },
    /// The process was stopped by an explicit kill
    Killed,
}

impl Event {
    pub fn new(shortcut_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            shortcut_id: shortcut_id.into(),
            kind,
        }
    }

    /// True for the events that end a run
    pub fn is_stop(&self) -> bool {
        matches!(self.kind, EventKind::End { .. } | EventKind::Killed)
    }
}

/// Receiving end of a subscription. Ends when the shortcut is unsubscribed.
#[derive(Debug)]
pub struct Subscription {
    rx: UnboundedReceiver<Event>,
}

impl Subscription {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Delivers events to whoever is subscribed to the shortcut at publish time.
///
/// There is no replay: a subscriber only sees events published after it
/// subscribed.
#[derive(Debug, Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<String, Vec<UnboundedSender<Event>>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for a shortcut id
    pub fn subscribe(&self, shortcut_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(shortcut_id.to_string())
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    /// Call `callback` for every event of a shortcut until it is unsubscribed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_event<F>(&self, shortcut_id: &str, callback: F) -> JoinHandle<()>
    where
        F: Fn(&Event) + Send + 'static,
    {
        let mut subscription = self.subscribe(shortcut_id);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(&event);
            }
        })
    }

    /// Drop every subscriber of a shortcut, returning how many there were
    pub fn unsubscribe(&self, shortcut_id: &str) -> usize {
        self.subscribers
            .lock()
            .remove(shortcut_id)
            .map_or(0, |senders| senders.len())
    }

    /// Send an event to all current subscribers of its shortcut.
    ///
    /// Closed subscribers are pruned. Returns the number of deliveries.
    pub fn publish(&self, event: &Event) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&event.shortcut_id) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            subscribers.remove(&event.shortcut_id);
        }
        delivered
    }

    /// Number of live subscribers for a shortcut
    pub fn subscriber_count(&self, shortcut_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(shortcut_id)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_event_wire_format() {
        let event = Event::new("s1", EventKind::End { status: 0 });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"shortcutId": "s1", "type": "end", "status": 0})
        );
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert!(back.is_stop());

        let killed = serde_json::to_value(Event::new("s1", EventKind::Killed)).unwrap();
        assert_eq!(killed, serde_json::json!({"shortcutId": "s1", "type": "killed"}));
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let mut first = broadcaster.subscribe("s1");
        let mut second = broadcaster.subscribe("s1");
        let mut other = broadcaster.subscribe("s2");

        let event = Event::new("s1", EventKind::Started { pid: 42 });
        assert_eq!(broadcaster.publish(&event), 2);

        assert_eq!(first.recv().await, Some(event.clone()));
        assert_eq!(second.recv().await, Some(event));
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let broadcaster = EventBroadcaster::new();
        assert_eq!(broadcaster.publish(&Event::new("s1", EventKind::Killed)), 0);

        let mut late = broadcaster.subscribe("s1");
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_streams() {
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe("s1");
        assert_eq!(broadcaster.subscriber_count("s1"), 1);

        assert_eq!(broadcaster.unsubscribe("s1"), 1);
        assert_eq!(sub.recv().await, None);
        assert_eq!(broadcaster.publish(&Event::new("s1", EventKind::Killed)), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let broadcaster = EventBroadcaster::new();
        let dropped = broadcaster.subscribe("s1");
        let mut kept = broadcaster.subscribe("s1");
        drop(dropped);

        assert_eq!(broadcaster.publish(&Event::new("s1", EventKind::Killed)), 1);
        assert!(kept.recv().await.is_some());
        assert_eq!(broadcaster.subscriber_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_on_event_callback() {
        let broadcaster = EventBroadcaster::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = broadcaster.on_event("s1", move |event| {
            seen_clone.lock().push(event.kind.clone());
        });

        broadcaster.publish(&Event::new("s1", EventKind::End { status: 3 }));
        broadcaster.unsubscribe("s1");
        task.await.unwrap();

        assert_eq!(*seen.lock(), vec![EventKind::End { status: 3 }]);
    }
}
