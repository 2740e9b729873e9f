//! Generic persisted, ordered, retryable work list.
//!
//! The in-memory list is the working copy; every mutation is followed by a write
//! of the full serialized list under one key. Only a processing pass removes
//! items and only one pass runs at a time, so producers appending during a pass
//! never shift the pass cursor.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::action::QueueItem;
use crate::services::kv::{KeyValueStore, KvError};

/// Keys that indicate photo or file content. Queue entries must never carry them.
pub const FORBIDDEN_PAYLOAD_KEYS: [&str; 4] = ["photo", "photos", "local_uri", "file"];

/// Behaviour the queue needs from the entries it stores.
pub trait QueueEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn attempts(&self) -> u32;

    /// Record one failed attempt.
    fn record_failure(&mut self, at: DateTime<Utc>, backoff: Duration);

    /// Short identifier for logs.
    fn label(&self) -> String;

    /// Structural check applied to entries read back from storage.
    fn is_well_formed(&self) -> bool {
        true
    }
}

impl QueueEntry for QueueItem {
    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn record_failure(&mut self, at: DateTime<Utc>, backoff: Duration) {
        self.attempts += 1;
        self.last_attempted_at = Some(at);
        self.next_retry_delay_ms = Some(u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX));
    }

    fn label(&self) -> String {
        format!("{}:{}:{}", self.kind(), self.ticket_id, self.id)
    }

    fn is_well_formed(&self) -> bool {
        !self.ticket_id.trim().is_empty()
    }
}

/// Exponential backoff: `base * 2^(attempts-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub succeeded: usize,
    pub retained: usize,
    pub evicted: usize,
    /// Shortest backoff recorded for an item left in the queue.
    pub next_retry_in: Option<Duration>,
}

/// Held for the duration of a pass; releases the queue on drop, including unwinds.
struct PassToken<'a>(&'a AtomicBool);

impl<'a> PassToken<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassToken(flag))
    }
}

impl Drop for PassToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DurableQueue<T: QueueEntry> {
    key: String,
    store: Arc<dyn KeyValueStore>,
    items: Mutex<Vec<T>>,
    in_pass: AtomicBool,
    policy: RetryPolicy,
    failed: FailedList<T>,
}

impl<T: QueueEntry> DurableQueue<T> {
    /// Load the queue stored under `key`, dropping malformed entries.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        policy: RetryPolicy,
        failed_capacity: usize,
    ) -> Result<Self, QueueError> {
        let key = key.into();
        let items = load_sanitized(store.as_ref(), &key, T::is_well_formed).await?;
        let failed = FailedList::new(store.clone(), format!("{key}_failed"), failed_capacity);

        tracing::info!(queue = %key, depth = items.len(), "Loaded durable queue");

        Ok(Self {
            key,
            store,
            items: Mutex::new(items),
            in_pass: AtomicBool::new(false),
            policy,
            failed,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn failed(&self) -> &FailedList<T> {
        &self.failed
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.items.lock().await.clone()
    }

    /// Whether a pass currently holds this queue.
    pub fn is_processing(&self) -> bool {
        self.in_pass.load(Ordering::Acquire)
    }

    /// Append `item` and persist the full list. Entries referencing photo or
    /// file content are refused and never written.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let value = serde_json::to_value(&item)?;
        if let Some(key) = find_forbidden_key(&value) {
            tracing::warn!(
                queue = %self.key,
                item = %item.label(),
                key = %key,
                "Rejected queue entry carrying file content"
            );
            return Err(QueueError::BinaryPayload(key));
        }

        let mut items = self.items.lock().await;
        items.push(item);
        if let Err(e) = self.persist(&items).await {
            items.pop();
            return Err(e);
        }

        metrics::gauge!("queue_depth", "queue" => self.key.clone()).set(items.len() as f64);
        tracing::debug!(queue = %self.key, depth = items.len(), "Enqueued item");
        Ok(())
    }

    /// Run one full pass over the queue. Returns `None` without touching
    /// anything when another pass already holds the queue.
    pub async fn process<F, Fut, E>(&self, mut executor: F) -> Result<Option<PassReport>, QueueError>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let Some(_token) = PassToken::acquire(&self.in_pass) else {
            tracing::debug!(queue = %self.key, "Pass already in progress, skipping");
            return Ok(None);
        };

        let mut report = PassReport::default();
        let mut evicted = Vec::new();
        let mut mutated = false;
        let mut cursor = 0;

        loop {
            let item = match self.items.lock().await.get(cursor) {
                Some(item) => item.clone(),
                None => break,
            };
            let label = item.label();

            let outcome = executor(item).await;
            let mut items = self.items.lock().await;
            mutated = true;

            match outcome {
                Ok(()) => {
                    // The next item slides into this slot.
                    items.remove(cursor);
                    report.succeeded += 1;
                    tracing::info!(queue = %self.key, item = %label, "Queue item completed");
                }
                Err(e) => {
                    let entry = &mut items[cursor];
                    let attempts = entry.attempts() + 1;
                    let backoff = self.policy.backoff.delay_for(attempts);
                    entry.record_failure(Utc::now(), backoff);

                    if attempts >= self.policy.max_retry {
                        let dropped = items.remove(cursor);
                        report.evicted += 1;
                        tracing::error!(
                            queue = %self.key,
                            item = %label,
                            attempts,
                            error = %e,
                            "Queue item exceeded retry budget, dropping"
                        );
                        evicted.push((dropped, e.to_string()));
                    } else {
                        report.retained += 1;
                        report.next_retry_in = Some(match report.next_retry_in {
                            Some(current) => current.min(backoff),
                            None => backoff,
                        });
                        tracing::warn!(
                            queue = %self.key,
                            item = %label,
                            attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Queue item failed, will retry on a later pass"
                        );
                        cursor += 1;
                    }
                }
            }
        }

        let mut first_error = None;

        // Evicted items reach the failed list before the snapshot is written.
        // One the failed list refuses goes back on the queue.
        for (item, reason) in evicted {
            metrics::counter!("queue_items_evicted_total", "queue" => self.key.clone()).increment(1);
            let label = item.label();
            if let Err(e) = self.failed.push(item.clone(), reason).await {
                tracing::error!(
                    queue = %self.key,
                    item = %label,
                    error = %e,
                    "Could not record evicted item, keeping it queued"
                );
                self.items.lock().await.push(item);
                first_error.get_or_insert(e);
            }
        }

        if mutated {
            let items = self.items.lock().await;
            match self.persist(&items).await {
                Ok(()) => {
                    metrics::gauge!("queue_depth", "queue" => self.key.clone()).set(items.len() as f64);
                }
                Err(e) => {
                    tracing::error!(queue = %self.key, error = %e, "Failed to persist queue after pass");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::debug!(
            queue = %self.key,
            succeeded = report.succeeded,
            retained = report.retained,
            evicted = report.evicted,
            "Queue pass finished"
        );
        Ok(Some(report))
    }

    async fn persist(&self, items: &[T]) -> Result<(), QueueError> {
        let document = serde_json::to_string(items)?;
        self.store.set(&self.key, &document).await?;
        Ok(())
    }
}

/// Read a JSON list stored under `key`, keeping only entries that deserialize and
/// pass `is_valid`. When anything was dropped, the cleaned list is written back.
pub async fn load_sanitized<T, V>(
    store: &dyn KeyValueStore,
    key: &str,
    is_valid: V,
) -> Result<Vec<T>, QueueError>
where
    T: Serialize + DeserializeOwned,
    V: Fn(&T) -> bool,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(Vec::new());
    };

    let entries = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Array(entries)) => entries,
        Ok(_) | Err(_) => {
            tracing::error!(key, "Persisted queue document is not a JSON list, resetting");
            store.set(key, "[]").await?;
            return Ok(Vec::new());
        }
    };

    let total = entries.len();
    let mut kept = Vec::with_capacity(total);
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<T>(entry) {
            Ok(item) if is_valid(&item) => kept.push(item),
            Ok(_) => tracing::warn!(key, index, "Dropping structurally invalid queue entry"),
            Err(e) => tracing::warn!(key, index, error = %e, "Dropping malformed queue entry"),
        }
    }

    if kept.len() != total {
        tracing::warn!(key, dropped = total - kept.len(), "Writing back sanitized queue");
        store.set(key, &serde_json::to_string(&kept)?).await?;
    }
    Ok(kept)
}

/// Depth-first search for a forbidden key anywhere in the value graph.
pub fn find_forbidden_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => map.iter().find_map(|(key, nested)| {
            if FORBIDDEN_PAYLOAD_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                Some(key.clone())
            } else {
                find_forbidden_key(nested)
            }
        }),
        serde_json::Value::Array(values) => values.iter().find_map(find_forbidden_key),
        _ => None,
    }
}

/// Entry in a failed list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedEntry<T> {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub item: T,
}

/// Insert `item` at the front and trim to `capacity`, returning what fell off the end.
pub fn push_bounded<T>(list: &mut Vec<T>, item: T, capacity: usize) -> Vec<T> {
    list.insert(0, item);
    if list.len() > capacity {
        list.split_off(capacity)
    } else {
        Vec::new()
    }
}

/// Persisted, newest-first overflow list for entries that used up their retries.
/// Beyond `capacity` the oldest entries are discarded.
pub struct FailedList<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    capacity: usize,
    lock: Mutex<()>,
    _entry: PhantomData<fn() -> T>,
}

impl<T> FailedList<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity,
            lock: Mutex::new(()),
            _entry: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, item: T, reason: impl Into<String>) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<FailedEntry<T>> =
            load_sanitized(self.store.as_ref(), &self.key, |_| true).await?;

        let dropped = push_bounded(
            &mut entries,
            FailedEntry {
                failed_at: Utc::now(),
                reason: reason.into(),
                item,
            },
            self.capacity,
        );
        if !dropped.is_empty() {
            tracing::warn!(
                key = %self.key,
                dropped = dropped.len(),
                capacity = self.capacity,
                "Failed list full, discarding oldest entries"
            );
        }

        self.store
            .set(&self.key, &serde_json::to_string(&entries)?)
            .await?;
        Ok(())
    }

    /// Entries newest first.
    pub async fn entries(&self) -> Result<Vec<FailedEntry<T>>, QueueError> {
        let _guard = self.lock.lock().await;
        load_sanitized(self.store.as_ref(), &self.key, |_| true).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue entries must not carry file content (found key `{0}`)")]
    BinaryPayload(String),
}
