use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a captured photo. Only `Pending` may transition, and only forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PhotoStatus {
    Pending,
    Uploaded,
    Failed,
}

impl PhotoStatus {
    pub fn can_transition_to(self, next: PhotoStatus) -> bool {
        matches!(
            (self, next),
            (PhotoStatus::Pending, PhotoStatus::Uploaded) | (PhotoStatus::Pending, PhotoStatus::Failed)
        )
    }
}

/// Ledger row for one captured photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketPhoto {
    pub id: String,
    pub ticket_id: String,
    pub queue_order: u32,
    pub local_uri: String,
    pub status: PhotoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketPhoto {
    /// Fresh pending row with a new id.
    pub fn pending(ticket_id: &str, queue_order: u32, local_uri: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ticket_id: ticket_id.to_string(),
            queue_order,
            local_uri: local_uri.to_string(),
            status: PhotoStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome recorded for one photo in one upload attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditStatus {
    Uploaded,
    Retrying,
    Failed,
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadAuditLog {
    pub id: i64,
    pub ticket_id: String,
    pub photo_id: String,
    pub queue_order: u32,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Audit entry before the ledger assigns its id.
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub ticket_id: String,
    pub photo_id: String,
    pub queue_order: u32,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewAuditLog {
    pub fn for_photo(photo: &TicketPhoto, status: AuditStatus, error_message: Option<String>) -> Self {
        Self {
            ticket_id: photo.ticket_id.clone(),
            photo_id: photo.id.clone(),
            queue_order: photo.queue_order,
            status,
            error_message,
            timestamp: Utc::now(),
        }
    }
}
