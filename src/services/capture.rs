use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::ledger::{LedgerError, PhotoLedger};
use crate::models::photo_job::{LocationSnapshot, PhotoUploadJob};
use crate::services::durable_queue::QueueError;
use crate::services::photo_jobs::PhotoJobQueue;
use crate::services::worker::UploadWorker;

/// Entry point for finished capture phases.
pub struct CaptureService {
    ledger: Arc<PhotoLedger>,
    jobs: Arc<PhotoJobQueue>,
    worker: Arc<UploadWorker>,
    /// Serializes slot allocation and the matching enqueue.
    allocate: Mutex<()>,
}

impl CaptureService {
    pub fn new(ledger: Arc<PhotoLedger>, jobs: Arc<PhotoJobQueue>, worker: Arc<UploadWorker>) -> Self {
        Self {
            ledger,
            jobs,
            worker,
            allocate: Mutex::new(()),
        }
    }

    /// Record one phase's photos as pending ledger rows, enqueue the upload job
    /// and make sure the worker is running.
    pub async fn submit_phase(
        &self,
        ticket_id: &str,
        user_id: &str,
        photo_uris: Vec<String>,
        timestamp: DateTime<Utc>,
        location: Option<LocationSnapshot>,
    ) -> Result<PhotoUploadJob, CaptureError> {
        if photo_uris.is_empty() {
            return Err(CaptureError::NoPhotos);
        }

        let job = {
            let _guard = self.allocate.lock().await;
            let rows = self.ledger.insert_batch(ticket_id, &photo_uris).await?;
            let start = rows.first().map_or(0, |row| row.queue_order);
            let job = PhotoUploadJob::new(ticket_id, user_id, photo_uris, timestamp, location, start);

            if let Err(e) = self.jobs.enqueue(job.clone()).await {
                tracing::warn!(ticket_id, error = %e, "Photo job not queued, releasing ledger rows");
                if let Err(le) = self.ledger.release_batch(ticket_id, &rows).await {
                    tracing::error!(ticket_id, error = %le, "Failed to release ledger rows");
                }
                return Err(e.into());
            }
            job
        };

        metrics::counter!("photo_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            ticket_id,
            photos = job.photo_uris.len(),
            start_order = job.photo_start_index,
            "Capture phase submitted"
        );

        if self.worker.ensure_running().is_some() {
            tracing::debug!("Upload worker restarted by capture");
        }
        Ok(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("A capture phase needs at least one photo")]
    NoPhotos,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
