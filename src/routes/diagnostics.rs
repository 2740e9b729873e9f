use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::action::{
    CancelPayload, ExtraCharge, ExtrasPayload, QueueItem, StopPayload, TicketAction,
};
use crate::models::photo_job::{LocationSnapshot, PhotoUploadJob};
use crate::models::ticket_photo::{TicketPhoto, UploadAuditLog};
use crate::services::action_processor::SelectedTicket;
use crate::services::capture::CaptureError;
use crate::services::durable_queue::{FailedEntry, QueueError};
use crate::services::worker::WorkerState;

/// JSON error body with the status it maps to.
pub struct RouteError {
    status: StatusCode,
    message: String,
}

impl RouteError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!(error = %e, "Diagnostics request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<QueueError> for RouteError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::BinaryPayload(key) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("payload must not carry file content (`{key}`)"),
            ),
            other => Self::internal(other),
        }
    }
}

impl From<CaptureError> for RouteError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::NoPhotos => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            CaptureError::Queue(q) => q.into(),
            CaptureError::Ledger(l) => Self::internal(l),
        }
    }
}

fn invalid(report: garde::Report) -> RouteError {
    RouteError::new(StatusCode::BAD_REQUEST, report.to_string())
}

/// GET /api/v1/tickets/{ticket_id}/photos: pending ledger rows in upload order.
pub async fn pending_photos(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Json<Vec<TicketPhoto>>, RouteError> {
    let photos = state
        .ledger
        .get_pending_photos(&ticket_id)
        .await
        .map_err(RouteError::internal)?;
    Ok(Json(photos))
}

/// GET /api/v1/tickets/{ticket_id}/audit
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Json<Vec<UploadAuditLog>>, RouteError> {
    let entries = state
        .ledger
        .get_audit_log_by_ticket(&ticket_id)
        .await
        .map_err(RouteError::internal)?;
    Ok(Json(entries))
}

#[derive(Serialize)]
pub struct ActionQueueView {
    pub depth: usize,
    pub processing: bool,
    pub items: Vec<QueueItem>,
    pub failed: Vec<FailedEntry<QueueItem>>,
}

#[derive(Serialize)]
pub struct PhotoQueueView {
    pub depth: usize,
    pub jobs: Vec<PhotoUploadJob>,
    pub failed: Vec<FailedEntry<PhotoUploadJob>>,
}

#[derive(Serialize)]
pub struct QueuesResponse {
    pub connected: bool,
    pub worker: WorkerState,
    pub selected_ticket: Option<SelectedTicket>,
    pub actions: ActionQueueView,
    pub photo_jobs: PhotoQueueView,
}

/// GET /api/v1/queues: queue contents, failed lists and worker state.
pub async fn queues(State(state): State<AppState>) -> Result<Json<QueuesResponse>, RouteError> {
    let action_queue = state.actions.queue();
    let items = action_queue.snapshot().await;
    let actions = ActionQueueView {
        depth: items.len(),
        processing: action_queue.is_processing(),
        items,
        failed: action_queue.failed().entries().await?,
    };

    let jobs = state.jobs.load().await?;
    let photo_jobs = PhotoQueueView {
        depth: jobs.len(),
        jobs,
        failed: state.jobs.failed_entries().await?,
    };

    let selected_ticket = state.selected.get().await.map_err(RouteError::internal)?;

    Ok(Json(QueuesResponse {
        connected: state.connectivity.is_connected(),
        worker: state.worker.state(),
        selected_ticket,
        actions,
        photo_jobs,
    }))
}

/// Client-facing action shape. Timestamps and the trip id are assigned when
/// the action is queued, so every retry reuses them.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    Start {
        #[serde(default)]
        location: Option<LocationSnapshot>,
    },
    Stop {
        #[serde(default)]
        trip_id: Option<Uuid>,
        #[serde(default)]
        location: Option<LocationSnapshot>,
    },
    Cancel {
        #[serde(default)]
        reason: Option<String>,
    },
    Extras {
        items: Vec<ExtraCharge>,
        #[serde(default)]
        details: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueActionRequest {
    #[garde(length(min = 1, max = 128))]
    pub ticket_id: String,

    #[garde(skip)]
    #[serde(flatten)]
    pub action: ActionRequest,
}

/// POST /api/v1/actions: queue a ticket action; kicks a pass when online.
pub async fn enqueue_action(
    State(state): State<AppState>,
    Json(request): Json<EnqueueActionRequest>,
) -> Result<(StatusCode, Json<QueueItem>), RouteError> {
    request.validate().map_err(invalid)?;
    let now = Utc::now();

    let action = match request.action {
        ActionRequest::Start { location } => TicketAction::start(location),
        ActionRequest::Stop { trip_id, location } => {
            let trip_id = match trip_id {
                Some(id) => Some(id),
                None => state
                    .selected
                    .get()
                    .await
                    .map_err(RouteError::internal)?
                    .filter(|s| s.ticket_id == request.ticket_id)
                    .map(|s| s.trip_id),
            };
            TicketAction::Stop(StopPayload {
                trip_id,
                stopped_at: now,
                location,
            })
        }
        ActionRequest::Cancel { reason } => TicketAction::Cancel(CancelPayload {
            reason,
            cancelled_at: now,
        }),
        ActionRequest::Extras { items, details } => {
            TicketAction::Extras(ExtrasPayload { items, details })
        }
    };

    let item = state.actions.enqueue(&request.ticket_id, action).await?;
    if state.connectivity.is_connected() {
        state.actions.request_pass();
    }
    Ok((StatusCode::ACCEPTED, Json(item)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitPhotosRequest {
    #[garde(length(min = 1, max = 128))]
    pub ticket_id: String,

    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    #[garde(length(min = 1, max = 50), inner(length(min = 1)))]
    pub photo_uris: Vec<String>,

    #[garde(skip)]
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[garde(dive)]
    #[serde(default)]
    pub location: Option<LocationSnapshot>,
}

/// POST /api/v1/photo-jobs: submit one capture phase.
pub async fn submit_photos(
    State(state): State<AppState>,
    Json(request): Json<SubmitPhotosRequest>,
) -> Result<(StatusCode, Json<PhotoUploadJob>), RouteError> {
    request.validate().map_err(invalid)?;
    let job = state
        .capture
        .submit_phase(
            &request.ticket_id,
            &request.user_id,
            request.photo_uris,
            request.timestamp.unwrap_or_else(Utc::now),
            request.location,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub is_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    pub is_connected: bool,
    pub changed: bool,
}

/// POST /api/v1/connectivity: push a reachability change from the host.
pub async fn report_connectivity(
    State(state): State<AppState>,
    Json(request): Json<ConnectivityRequest>,
) -> Json<ConnectivityResponse> {
    let changed = state.connectivity.report(request.is_connected);
    if changed && request.is_connected && matches!(state.jobs.len().await, Ok(n) if n > 0) {
        state.worker.ensure_running();
    }
    Json(ConnectivityResponse {
        is_connected: request.is_connected,
        changed,
    })
}
