//! Trip-scoped location tracking handles.
//!
//! A `TrackingSubscription` owns one subscription on the location source and
//! releases it when dropped, so repeated start/stop cycles cannot leak listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Device location provider.
pub trait LocationSource: Send + Sync {
    fn subscribe(&self, ticket_id: &str, trip_id: Uuid) -> u64;
    fn unsubscribe(&self, subscription: u64);
}

pub struct TrackingSubscription {
    source: Arc<dyn LocationSource>,
    id: u64,
    trip_id: Uuid,
}

impl TrackingSubscription {
    pub fn trip_id(&self) -> Uuid {
        self.trip_id
    }
}

impl Drop for TrackingSubscription {
    fn drop(&mut self) {
        self.source.unsubscribe(self.id);
    }
}

/// At most one live subscription per ticket.
pub struct TripTracking {
    source: Arc<dyn LocationSource>,
    active: Mutex<HashMap<String, TrackingSubscription>>,
}

impl TripTracking {
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        Self {
            source,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking `trip_id` for the ticket, replacing any earlier subscription.
    pub fn begin(&self, ticket_id: &str, trip_id: Uuid) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .get(ticket_id)
            .is_some_and(|current| current.trip_id == trip_id)
        {
            return;
        }

        let id = self.source.subscribe(ticket_id, trip_id);
        let replaced = active.insert(
            ticket_id.to_string(),
            TrackingSubscription {
                source: self.source.clone(),
                id,
                trip_id,
            },
        );
        tracing::info!(ticket_id, %trip_id, replaced = replaced.is_some(), "Trip tracking started");
    }

    /// Stop tracking for the ticket. No-op when nothing is tracked.
    pub fn end(&self, ticket_id: &str) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ticket_id);
        if let Some(subscription) = removed {
            tracing::info!(ticket_id, trip_id = %subscription.trip_id, "Trip tracking stopped");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Location source that only records subscriptions in the log. Used when the
/// host platform provides no tracking bridge.
#[derive(Default)]
pub struct LoggingLocationSource {
    next_id: AtomicU64,
    live: AtomicU64,
}

impl LoggingLocationSource {
    pub fn live_subscriptions(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

impl LocationSource for LoggingLocationSource {
    fn subscribe(&self, ticket_id: &str, trip_id: Uuid) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(ticket_id, %trip_id, subscription = id, "Location subscription opened");
        id
    }

    fn unsubscribe(&self, subscription: u64) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(subscription, "Location subscription closed");
    }
}
