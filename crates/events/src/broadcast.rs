//! Per-order status fan-out (one topic per order id).
//!
//! Delivery is **at-most-once and best-effort**: a disconnected or lagging
//! subscriber misses events published in the meantime and must re-fetch the
//! current order record on reconnect. The broadcaster is not a durable log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use medipaw_core::AggregateId;

/// A state-change notification delivered to subscribers of one order's topic.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub order_id: AggregateId,
    /// Stable event name (e.g. "order.payment_confirmed").
    pub event_type: String,
    /// Snapshot of the fields subscribers render (statuses, totals).
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

/// Publish-only capability handed to the fulfillment workflow.
///
/// The workflow depends on this seam, not on a concrete transport. Publishing
/// is fire-and-forget: it must never block and never fail the caller, so a
/// slow or absent subscriber cannot delay a state transition.
pub trait StatusSink: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

impl<S> StatusSink for Arc<S>
where
    S: StatusSink + ?Sized,
{
    fn publish(&self, update: StatusUpdate) {
        (**self).publish(update)
    }
}

/// Topic-per-order broadcaster over lossy `tokio::sync::broadcast` channels.
///
/// Any number of subscribers (the customer's browser, an admin dashboard) may
/// join a topic. Channels are bounded; once a receiver lags past the channel
/// capacity it observes a lag error and must re-fetch, which is exactly the
/// reconnect contract above.
#[derive(Debug)]
pub struct OrderTopics {
    topics: Mutex<HashMap<AggregateId, broadcast::Sender<StatusUpdate>>>,
    capacity: usize,
}

impl OrderTopics {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Join the topic for one order. The topic is created on first subscribe.
    pub fn subscribe(&self, order_id: AggregateId) -> broadcast::Receiver<StatusUpdate> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(order_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of live topics (used by tests and diagnostics).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for OrderTopics {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StatusSink for OrderTopics {
    fn publish(&self, update: StatusUpdate) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(tx) = topics.get(&update.order_id) {
            // A send with no live receivers is a successful no-op (lossy fan-out;
            // no backpressure on the state machine).
            let _ = tx.send(update.clone());

            // Prune topics whose last subscriber disconnected.
            if tx.receiver_count() == 0 {
                topics.remove(&update.order_id);
            }
        }
    }
}
