//! Drains the ticket-lifecycle action queue against the backend.
//!
//! Passes run on app start, on every offline→online transition, when a producer
//! asks for one while online, and once more when the shortest backoff recorded
//! by the previous pass elapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::action::{ActionKind, QueueItem, TicketAction};
use crate::services::durable_queue::{DurableQueue, PassReport, QueueError};
use crate::services::kv::{KeyValueStore, KvError};
use crate::services::ticket_api::{ApiError, TicketApiClient, TicketStatus, TicketStatusUpdate};
use crate::services::tracking::TripTracking;

pub const ACTION_QUEUE_KEY: &str = "offline_action_queue";
pub const SELECTED_TICKET_KEY: &str = "selected_ticket";

/// Executes one kind of queued action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, item: &QueueItem) -> Result<(), ActionError>;
}

/// Executor registry keyed by action kind.
#[derive(Default, Clone)]
pub struct ActionHandlers {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Handlers for all four kinds, backed by the ticket API.
    pub fn backend(
        api: Arc<TicketApiClient>,
        selected: Arc<SelectedTicketCache>,
        tracking: Arc<TripTracking>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleHandler {
            api: api.clone(),
            selected,
            tracking,
        });
        Self::new()
            .with(ActionKind::Start, lifecycle.clone())
            .with(ActionKind::Stop, lifecycle.clone())
            .with(ActionKind::Cancel, lifecycle)
            .with(ActionKind::Extras, Arc::new(ExtrasHandler { api }))
    }

    pub async fn dispatch(&self, item: &QueueItem) -> Result<(), ActionError> {
        let kind = item.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(ActionError::NoHandler(kind))?;
        handler.execute(item).await
    }
}

/// Locally cached projection of the ticket the worker is currently on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedTicket {
    pub ticket_id: String,
    pub trip_id: Uuid,
    pub started_at: DateTime<Utc>,
}

pub struct SelectedTicketCache {
    store: Arc<dyn KeyValueStore>,
}

impl SelectedTicketCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<Option<SelectedTicket>, KvError> {
        let Some(raw) = self.store.get(SELECTED_TICKET_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(selected) => Ok(Some(selected)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable selected ticket cache");
                self.store.remove(SELECTED_TICKET_KEY).await?;
                Ok(None)
            }
        }
    }

    pub async fn set(&self, selected: &SelectedTicket) -> Result<(), KvError> {
        let document = serde_json::to_string(selected).map_err(std::io::Error::from)?;
        self.store.set(SELECTED_TICKET_KEY, &document).await
    }

    /// Clear the cache if it still points at `ticket_id`.
    pub async fn clear_if(&self, ticket_id: &str) -> Result<(), KvError> {
        if self.get().await?.is_some_and(|s| s.ticket_id == ticket_id) {
            self.store.remove(SELECTED_TICKET_KEY).await?;
        }
        Ok(())
    }
}

/// Start, stop and cancel: ticket status updates with trip linkage.
struct LifecycleHandler {
    api: Arc<TicketApiClient>,
    selected: Arc<SelectedTicketCache>,
    tracking: Arc<TripTracking>,
}

#[async_trait]
impl ActionHandler for LifecycleHandler {
    async fn execute(&self, item: &QueueItem) -> Result<(), ActionError> {
        let ticket_id = item.ticket_id.as_str();
        match &item.action {
            TicketAction::Start(payload) => {
                let update = TicketStatusUpdate {
                    status: TicketStatus::Started,
                    trip_id: Some(payload.trip_id),
                    changed_at: payload.started_at,
                    location: payload.location,
                    reason: None,
                };
                self.api.update_ticket_status(ticket_id, &update).await?;
                self.selected
                    .set(&SelectedTicket {
                        ticket_id: ticket_id.to_string(),
                        trip_id: payload.trip_id,
                        started_at: payload.started_at,
                    })
                    .await?;
                self.tracking.begin(ticket_id, payload.trip_id);
            }
            TicketAction::Stop(payload) => {
                let update = TicketStatusUpdate {
                    status: TicketStatus::Stopped,
                    trip_id: payload.trip_id,
                    changed_at: payload.stopped_at,
                    location: payload.location,
                    reason: None,
                };
                self.api.update_ticket_status(ticket_id, &update).await?;
                self.selected.clear_if(ticket_id).await?;
                self.tracking.end(ticket_id);
            }
            TicketAction::Cancel(payload) => {
                let update = TicketStatusUpdate {
                    status: TicketStatus::Cancelled,
                    trip_id: None,
                    changed_at: payload.cancelled_at,
                    location: None,
                    reason: payload.reason.clone(),
                };
                self.api.update_ticket_status(ticket_id, &update).await?;
                self.selected.clear_if(ticket_id).await?;
                self.tracking.end(ticket_id);
            }
            TicketAction::Extras(_) => {
                return Err(ActionError::KindMismatch {
                    handler: "lifecycle",
                    found: ActionKind::Extras,
                })
            }
        }
        Ok(())
    }
}

struct ExtrasHandler {
    api: Arc<TicketApiClient>,
}

#[async_trait]
impl ActionHandler for ExtrasHandler {
    async fn execute(&self, item: &QueueItem) -> Result<(), ActionError> {
        let TicketAction::Extras(payload) = &item.action else {
            return Err(ActionError::KindMismatch {
                handler: "extras",
                found: item.kind(),
            });
        };
        self.api.post_extras(&item.ticket_id, payload).await?;
        Ok(())
    }
}

pub struct ActionQueueProcessor {
    queue: DurableQueue<QueueItem>,
    handlers: ActionHandlers,
    kick: Notify,
}

impl ActionQueueProcessor {
    pub fn new(queue: DurableQueue<QueueItem>, handlers: ActionHandlers) -> Self {
        Self {
            queue,
            handlers,
            kick: Notify::new(),
        }
    }

    pub fn queue(&self) -> &DurableQueue<QueueItem> {
        &self.queue
    }

    /// Queue an action for `ticket_id`.
    pub async fn enqueue(&self, ticket_id: &str, action: TicketAction) -> Result<QueueItem, QueueError> {
        let item = QueueItem::new(ticket_id, action);
        self.queue.enqueue(item.clone()).await?;
        metrics::counter!("action_queue_enqueued_total", "kind" => item.kind().to_string()).increment(1);
        tracing::info!(ticket_id, kind = %item.kind(), item_id = %item.id, "Ticket action queued");
        Ok(item)
    }

    /// One pass over the queue through the registered handlers.
    pub async fn run_pass(&self) -> Result<Option<PassReport>, QueueError> {
        let handlers = &self.handlers;
        self.queue
            .process(move |item: QueueItem| async move {
                let result = handlers.dispatch(&item).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        ticket_id = %item.ticket_id,
                        kind = %item.kind(),
                        summary = %e.summary(),
                        "Ticket action failed"
                    );
                }
                result
            })
            .await
    }

    /// Ask the running loop for a pass. Ignored while offline.
    pub fn request_pass(&self) {
        self.kick.notify_one();
    }

    /// Drive the queue from connectivity events until the monitor goes away.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = *connectivity.borrow_and_update();
            let mut retry_at: Option<Instant> = None;

            if online {
                tracing::info!("Processing action queue on startup");
                retry_at = self.pass_and_schedule().await;
            }

            loop {
                let deadline = retry_at;
                let retry_timer = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::info!("Connectivity source closed, action processor stopping");
                            break;
                        }
                        let now_online = *connectivity.borrow_and_update();
                        let restored = now_online && !online;
                        online = now_online;
                        if restored {
                            tracing::info!("Connectivity restored, processing action queue");
                            retry_at = self.pass_and_schedule().await;
                        }
                    }
                    _ = self.kick.notified() => {
                        if online {
                            retry_at = self.pass_and_schedule().await;
                        }
                    }
                    _ = retry_timer => {
                        retry_at = None;
                        if online {
                            tracing::debug!("Backoff elapsed, retrying action queue");
                            retry_at = self.pass_and_schedule().await;
                        }
                    }
                }
            }
        })
    }

    async fn pass_and_schedule(&self) -> Option<Instant> {
        match self.run_pass().await {
            Ok(Some(report)) => report.next_retry_in.map(|delay| Instant::now() + delay),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(error = %e, "Action queue pass failed");
                None
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Backend call failed: {0}")]
    Api(#[from] ApiError),

    #[error("Local cache update failed: {0}")]
    Cache(#[from] KvError),

    #[error("No executor registered for {0} actions")]
    NoHandler(ActionKind),

    #[error("The {handler} executor cannot run {found} actions")]
    KindMismatch {
        handler: &'static str,
        found: ActionKind,
    },
}

impl ActionError {
    pub fn summary(&self) -> String {
        match self {
            ActionError::Api(e) => e.summary(),
            ActionError::Cache(_) => "Could not update local ticket state".to_string(),
            ActionError::NoHandler(_) | ActionError::KindMismatch { .. } => {
                "This action is not supported offline".to_string()
            }
        }
    }
}
