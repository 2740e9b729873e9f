pub mod diagnostics;
pub mod health;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Health and diagnostics API over the shared state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/tickets/{ticket_id}/photos",
            get(diagnostics::pending_photos),
        )
        .route(
            "/api/v1/tickets/{ticket_id}/audit",
            get(diagnostics::audit_trail),
        )
        .route("/api/v1/queues", get(diagnostics::queues))
        .route("/api/v1/actions", post(diagnostics::enqueue_action))
        .route("/api/v1/photo-jobs", post(diagnostics::submit_photos))
        .route("/api/v1/connectivity", post(diagnostics::report_connectivity))
        .with_state(state)
}
