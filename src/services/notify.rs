use uuid::Uuid;

/// Best-effort progress reporting for upload jobs. Implementations must not fail
/// or block the worker.
pub trait NotificationSink: Send + Sync {
    fn progress(&self, job_id: Uuid, ticket_id: &str, done: usize, total: usize);

    fn finished(&self, job_id: Uuid, ticket_id: &str, success: bool, message: &str);
}

/// Emits notifications as log events.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn progress(&self, job_id: Uuid, ticket_id: &str, done: usize, total: usize) {
        tracing::info!(%job_id, ticket_id, "Uploading photos {done}/{total}");
    }

    fn finished(&self, job_id: Uuid, ticket_id: &str, success: bool, message: &str) {
        if success {
            tracing::info!(%job_id, ticket_id, "{message}");
        } else {
            tracing::warn!(%job_id, ticket_id, "{message}");
        }
    }
}
