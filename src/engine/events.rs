//! In-process observability event bus
//!
//! Single producer side, many consumers. Publish is non-blocking: a slow
//! subscriber's full channel loses the event rather than stalling the
//! request path. Subscribers never call back into producers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RouteSuccess,
    RouteError,
    StreamStarted,
    KeyRotationExpired,
    ActivityCompleted,
    Escalation,
    Heartbeat,
    HealthChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RouteSuccess => "route_success",
            EventKind::RouteError => "route_error",
            EventKind::StreamStarted => "stream_started",
            EventKind::KeyRotationExpired => "key_rotation_expired",
            EventKind::ActivityCompleted => "activity_completed",
            EventKind::Escalation => "escalation",
            EventKind::Heartbeat => "heartbeat",
            EventKind::HealthChanged => "health_changed",
        }
    }
}

/// One bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub detail: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, detail: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            request_id: None,
            detail,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A live subscription; events arrive on `rx`.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

/// Broadcast-only fan-out bus.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a consumer with the given channel depth.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .insert(id, tx);
        Subscription { id, rx }
    }

    /// Drop a subscriber; its channel closes once the sender is gone.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .remove(&id);
    }

    /// Fan out to every subscriber without blocking. Full or closed
    /// channels lose the event.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Events lost to slow subscribers since start.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(4);
        let mut b = bus.subscribe(4);

        bus.publish(Event::new(EventKind::Heartbeat, serde_json::json!({})));

        assert_eq!(a.rx.recv().await.unwrap().kind, EventKind::Heartbeat);
        assert_eq!(b.rx.recv().await.unwrap().kind, EventKind::Heartbeat);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1);

        bus.publish(Event::new(EventKind::Heartbeat, serde_json::json!({"n": 1})));
        bus.publish(Event::new(EventKind::Heartbeat, serde_json::json!({"n": 2})));

        assert_eq!(bus.dropped_count(), 1);
        let first = sub.rx.recv().await.unwrap();
        assert_eq!(first.detail["n"], 1);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(4);
        bus.unsubscribe(sub.id);
        assert!(sub.rx.recv().await.is_none());
    }
}
