use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::photo_job::LocationSnapshot;

/// Ticket lifecycle action kinds handled by the action queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    Start,
    Stop,
    Cancel,
    Extras,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartPayload {
    /// Generated when the action is created so every retry links the same trip.
    pub trip_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<LocationSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopPayload {
    #[serde(default)]
    pub trip_id: Option<Uuid>,
    pub stopped_at: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<LocationSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelPayload {
    #[serde(default)]
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraCharge {
    pub code: String,
    pub quantity: f64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtrasPayload {
    pub items: Vec<ExtraCharge>,
    /// Free-form form answers forwarded verbatim to the backend.
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Typed action, serialized as `{"kind": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TicketAction {
    Start(StartPayload),
    Stop(StopPayload),
    Cancel(CancelPayload),
    Extras(ExtrasPayload),
}

impl TicketAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            TicketAction::Start(_) => ActionKind::Start,
            TicketAction::Stop(_) => ActionKind::Stop,
            TicketAction::Cancel(_) => ActionKind::Cancel,
            TicketAction::Extras(_) => ActionKind::Extras,
        }
    }

    /// Start action with a freshly generated trip id.
    pub fn start(location: Option<LocationSnapshot>) -> Self {
        TicketAction::Start(StartPayload {
            trip_id: Uuid::new_v4(),
            started_at: Utc::now(),
            location,
        })
    }
}

/// One durable unit of deferred ticket-lifecycle work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: Uuid,
    pub ticket_id: String,
    pub action: TicketAction,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempted_at: Option<DateTime<Utc>>,
    /// Backoff computed after the last failure, kept for diagnostics and retry timers.
    #[serde(default)]
    pub next_retry_delay_ms: Option<u64>,
}

impl QueueItem {
    pub fn new(ticket_id: impl Into<String>, action: TicketAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id: ticket_id.into(),
            action,
            attempts: 0,
            created_at: Utc::now(),
            last_attempted_at: None,
            next_retry_delay_ms: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}
