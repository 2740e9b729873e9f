use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: queue, worker and pipeline metrics in Prometheus text format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the metrics the services emit.
pub fn describe() {
    metrics::describe_gauge!("queue_depth", "Items held in a durable queue");
    metrics::describe_counter!(
        "queue_items_evicted_total",
        "Queue items dropped after exhausting their retry budget"
    );
    metrics::describe_counter!("action_queue_enqueued_total", "Ticket actions queued");
    metrics::describe_gauge!("photo_queue_depth", "Photo upload jobs waiting");
    metrics::describe_counter!("photo_jobs_submitted_total", "Capture phases submitted");
    metrics::describe_counter!("photo_jobs_uploaded_total", "Photo jobs uploaded");
    metrics::describe_counter!("photo_jobs_retried_total", "Photo job attempts that will be retried");
    metrics::describe_counter!("photo_jobs_failed_total", "Photo jobs moved to the failed list");
    metrics::describe_counter!("photo_jobs_dropped_total", "Invalid photo jobs dropped");
    metrics::describe_counter!("photos_uploaded_total", "Individual photos uploaded");
    metrics::describe_histogram!("photo_job_duration_seconds", "Time spent on one photo job attempt");
}
