//! In-process event bus (component E).
//!
//! Two topics — `log_added` and `registry_updated` — delivered synchronously
//! and unordered across subscribers. A panicking subscriber must not prevent
//! delivery to the rest, so each call is isolated with `catch_unwind`
//! (the teacher's `ContractEnforcer` takes a similarly defensive stance
//! around user-supplied callbacks in `contracts.rs`). There is no durable
//! buffering and no backpressure: slow or absent subscribers simply miss
//! events that were published before they attached.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A derived view of a capture record plus transport metadata, published on
/// the `log_added` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub capture_id: String,
    pub server_name: String,
    pub session_id: String,
    pub method: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub http_status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// The two action kinds described in §6 of the specification.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    LogAdded(LogEntry),
    RegistryUpdated,
}

pub type Subscriber = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// Synchronous fan-out publisher. Cheaply cloneable; every clone shares the
/// same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<(u64, Subscriber)>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

/// An opaque handle returned by `on`, needed to `off` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.write().push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sid, _)| *sid != id.0);
    }

    /// Deliver to every current subscriber. A subscriber that panics is
    /// caught and logged; the remaining subscribers still run.
    pub fn publish(&self, event: GatewayEvent) {
        let subscribers = self.subscribers.read().clone();
        for (id, handler) in subscribers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                tracing::warn!(subscriber_id = id, "event subscriber panicked; isolated");
            }
        }
    }

    pub fn publish_log(&self, entry: LogEntry) {
        self.publish(GatewayEvent::LogAdded(entry));
    }

    pub fn publish_registry_updated(&self) {
        self.publish(GatewayEvent::RegistryUpdated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_entry() -> LogEntry {
        LogEntry {
            capture_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            server_name: "echo".to_string(),
            session_id: "stateless".to_string(),
            method: "ping".to_string(),
            direction: Direction::Request,
            timestamp: Utc::now(),
            http_status: 0,
            duration_ms: 0,
            error_message: None,
            envelope: None,
        }
    }

    #[test]
    fn delivers_to_all_subscribers_unordered() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.on(move |_event| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish_log(sample_entry());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let hit = Arc::new(AtomicUsize::new(0));
        bus.on(|_event| panic!("boom"));
        let hit2 = hit.clone();
        bus.on(move |_event| {
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_log(sample_entry());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_stops_delivery() {
        let bus = EventBus::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let id = bus.on(move |_event| {
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        bus.off(id);
        bus.publish_log(sample_entry());
        assert_eq!(hit.load(Ordering::SeqCst), 0);
    }
}
