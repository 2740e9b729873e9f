//! Background photo upload worker.
//!
//! Drains the photo job queue one job at a time. The loop polls with a fixed
//! delay, backs off while the queue is empty, and stops itself after more than
//! `max_empty_polls` consecutive empty observations. Producers restart it via
//! [`UploadWorker::ensure_running`].

use garde::Validate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::ledger::{LedgerError, PhotoLedger};
use crate::models::photo_job::PhotoUploadJob;
use crate::models::ticket_photo::{AuditStatus, NewAuditLog, PhotoStatus, TicketPhoto};
use crate::services::notify::NotificationSink;
use crate::services::photo_jobs::PhotoJobQueue;
use crate::services::pipeline::{remove_if_exists, PhotoPipeline, PipelineError, SourceDisposal};
use crate::services::ticket_api::{ApiError, TicketApiClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Polling { empty_polls: u32 },
    Active,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Delay after an empty observation, multiplied by the consecutive empty count.
    pub idle_backoff: Duration,
    pub max_empty_polls: u32,
    pub max_retry: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            idle_backoff: Duration::from_secs(5),
            max_empty_polls: 3,
            max_retry: 5,
        }
    }
}

/// How a single job attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Uploaded,
    Retrying { attempts: u32 },
    Failed,
    Dropped,
}

/// Totals for one run of the loop, from start until `Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerRun {
    pub jobs_processed: u32,
    pub empty_observations: u32,
}

pub struct UploadWorker {
    jobs: Arc<PhotoJobQueue>,
    ledger: Arc<PhotoLedger>,
    pipeline: Arc<PhotoPipeline>,
    api: Arc<TicketApiClient>,
    notifier: Arc<dyn NotificationSink>,
    config: WorkerConfig,
    state: watch::Sender<WorkerState>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl UploadWorker {
    pub fn new(
        jobs: Arc<PhotoJobQueue>,
        ledger: Arc<PhotoLedger>,
        pipeline: Arc<PhotoPipeline>,
        api: Arc<TicketApiClient>,
        notifier: Arc<dyn NotificationSink>,
        config: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            jobs,
            ledger,
            pipeline,
            api,
            notifier,
            config,
            state,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn jobs(&self) -> &Arc<PhotoJobQueue> {
        &self.jobs
    }

    /// Start the loop unless it is already running. Returns the handle of a
    /// newly spawned loop.
    pub fn ensure_running(self: &Arc<Self>) -> Option<JoinHandle<WorkerRun>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.stop_requested.store(false, Ordering::Release);

        let worker = Arc::clone(self);
        Some(tokio::spawn(async move { worker.run().await }))
    }

    /// Ask the loop to stop at the next iteration boundary. In-flight work finishes.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    async fn run(&self) -> WorkerRun {
        let mut run = WorkerRun::default();
        let mut empty_polls = 0u32;
        self.state.send_replace(WorkerState::Polling { empty_polls });
        tracing::info!("Upload worker started");

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                tracing::info!("Upload worker stop requested");
                self.state.send_replace(WorkerState::Stopped);
                self.running.store(false, Ordering::Release);
                return run;
            }

            tokio::time::sleep(self.config.poll_interval).await;

            let head = match self.jobs.head().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load photo job queue");
                    None
                }
            };

            let Some(job) = head else {
                empty_polls += 1;
                run.empty_observations += 1;

                if empty_polls > self.config.max_empty_polls {
                    self.state.send_replace(WorkerState::Stopped);
                    self.running.store(false, Ordering::Release);

                    // A producer may have enqueued after the last observation and
                    // found the loop still marked as running.
                    if self.has_jobs().await
                        && self
                            .running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        empty_polls = 0;
                        self.state.send_replace(WorkerState::Polling { empty_polls });
                        continue;
                    }

                    tracing::info!(
                        empty_observations = run.empty_observations,
                        "Upload worker idle, stopping"
                    );
                    return run;
                }

                self.state.send_replace(WorkerState::Polling { empty_polls });
                tracing::debug!(empty_polls, "Photo job queue empty");
                tokio::time::sleep(self.config.idle_backoff * empty_polls).await;
                continue;
            };

            empty_polls = 0;
            self.state.send_replace(WorkerState::Active);
            let outcome = self.process_job(job).await;
            run.jobs_processed += 1;
            tracing::debug!(?outcome, "Photo job attempt finished");
            self.state.send_replace(WorkerState::Polling { empty_polls });
        }
    }

    async fn has_jobs(&self) -> bool {
        matches!(self.jobs.len().await, Ok(n) if n > 0)
    }

    /// One attempt at the given job, including all bookkeeping for its outcome.
    pub async fn process_job(&self, mut job: PhotoUploadJob) -> JobOutcome {
        if let Err(report) = job.validate() {
            tracing::warn!(job_id = %job.id, errors = %report, "Dropping invalid photo job");
            if let Err(e) = self.jobs.remove(job.id).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to drop invalid photo job");
            }
            metrics::counter!("photo_jobs_dropped_total").increment(1);
            return JobOutcome::Dropped;
        }

        tracing::info!(
            job_id = %job.id,
            ticket_id = %job.ticket_id,
            photos = job.photo_uris.len(),
            attempts = job.attempts,
            "Processing photo job"
        );
        let start = Instant::now();
        let mut processed = Vec::with_capacity(job.photo_uris.len());
        let result = self.upload(&job, &mut processed).await;
        metrics::histogram!("photo_job_duration_seconds").record(start.elapsed().as_secs_f64());

        // Processed copies are rebuilt on every attempt.
        for path in &processed {
            if let Err(e) = remove_if_exists(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete processed photo");
            }
        }

        match result {
            Ok(()) => {
                self.complete(&job).await;
                JobOutcome::Uploaded
            }
            Err(e) => {
                job.attempts += 1;
                let attempts = job.attempts;
                let exhausted = attempts >= self.config.max_retry;
                tracing::error!(
                    job_id = %job.id,
                    ticket_id = %job.ticket_id,
                    attempts,
                    error = %e,
                    "Photo job failed"
                );
                self.notifier
                    .finished(job.id, &job.ticket_id, false, &e.summary());

                let audit_status = if exhausted {
                    AuditStatus::Failed
                } else {
                    AuditStatus::Retrying
                };
                let reason = e.to_string();
                if let Err(le) = self.record_failure(&job, audit_status, &reason).await {
                    tracing::error!(job_id = %job.id, error = %le, "Failed to record job failure in ledger");
                }

                if exhausted {
                    metrics::counter!("photo_jobs_failed_total").increment(1);
                    if let Err(qe) = self.jobs.fail(job, reason).await {
                        tracing::error!(error = %qe, "Failed to move photo job to failed list");
                    }
                    JobOutcome::Failed
                } else {
                    metrics::counter!("photo_jobs_retried_total").increment(1);
                    if let Err(qe) = self.jobs.requeue_tail(job).await {
                        tracing::error!(error = %qe, "Failed to requeue photo job");
                    }
                    JobOutcome::Retrying { attempts }
                }
            }
        }
    }

    async fn upload(&self, job: &PhotoUploadJob, processed: &mut Vec<PathBuf>) -> Result<(), JobError> {
        for uri in &job.photo_uris {
            if !tokio::fs::try_exists(uri).await.map_err(PipelineError::from)? {
                return Err(JobError::MissingSource(uri.clone()));
            }
        }

        let total = job.photo_uris.len();
        for (index, uri) in job.photo_uris.iter().enumerate() {
            let target = target_name(&job.ticket_id, job.queue_order(index));
            let photo = self
                .pipeline
                .process(
                    Path::new(uri),
                    &target,
                    job.timestamp,
                    job.location.as_ref(),
                    SourceDisposal::Keep,
                )
                .await?;
            processed.push(photo.path);
            self.notifier
                .progress(job.id, &job.ticket_id, index + 1, total);
        }

        self.api
            .upload_photos(&job.ticket_id, &job.user_id, processed)
            .await?;
        Ok(())
    }

    async fn complete(&self, job: &PhotoUploadJob) {
        match self.jobs.remove(job.id).await {
            Ok(_) => {}
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "Failed to remove uploaded job"),
        }
        metrics::counter!("photo_jobs_uploaded_total").increment(1);
        metrics::counter!("photos_uploaded_total").increment(job.photo_uris.len() as u64);

        for uri in &job.photo_uris {
            if let Err(e) = remove_if_exists(Path::new(uri)).await {
                tracing::warn!(uri, error = %e, "Failed to delete raw capture");
            }
        }

        match self.job_rows(job).await {
            Ok(rows) => {
                for row in rows {
                    if let Err(e) = self.settle_uploaded(&row).await {
                        tracing::error!(photo_id = %row.id, error = %e, "Failed to settle uploaded photo");
                    }
                }
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "Failed to read ledger rows"),
        }

        tracing::info!(job_id = %job.id, ticket_id = %job.ticket_id, "Photo job uploaded");
        self.notifier.finished(
            job.id,
            &job.ticket_id,
            true,
            &format!("Uploaded {} photo(s)", job.photo_uris.len()),
        );
    }

    async fn settle_uploaded(&self, row: &TicketPhoto) -> Result<(), LedgerError> {
        let row = self.ledger.update_status(&row.id, PhotoStatus::Uploaded).await?;
        self.ledger
            .insert_audit_log(&NewAuditLog::for_photo(&row, AuditStatus::Uploaded, None))
            .await?;
        self.ledger.delete_photo(&row.id).await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &PhotoUploadJob,
        status: AuditStatus,
        reason: &str,
    ) -> Result<(), LedgerError> {
        for row in self.job_rows(job).await? {
            let row = if status == AuditStatus::Failed {
                self.ledger.update_status(&row.id, PhotoStatus::Failed).await?
            } else {
                row
            };
            self.ledger
                .insert_audit_log(&NewAuditLog::for_photo(&row, status, Some(reason.to_string())))
                .await?;
        }
        Ok(())
    }

    async fn job_rows(&self, job: &PhotoUploadJob) -> Result<Vec<TicketPhoto>, LedgerError> {
        let mut rows = Vec::with_capacity(job.photo_uris.len());
        for index in 0..job.photo_uris.len() {
            if let Some(row) = self
                .ledger
                .find_photo(&job.ticket_id, job.queue_order(index))
                .await?
            {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

/// File name of the processed copy for one upload slot.
fn target_name(ticket_id: &str, queue_order: u32) -> String {
    let safe: String = ticket_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}_{queue_order}.jpg")
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Photo file is missing: {0}")]
    MissingSource(String),

    #[error("Photo processing failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Upload failed: {0}")]
    Api(#[from] ApiError),
}

impl JobError {
    pub fn summary(&self) -> String {
        match self {
            JobError::MissingSource(_) => "A captured photo is missing from the device".to_string(),
            JobError::Pipeline(_) => "A photo could not be processed".to_string(),
            JobError::Api(e) => e.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names_are_filesystem_safe() {
        assert_eq!(target_name("T-1", 3), "T-1_3.jpg");
        assert_eq!(target_name("a/b c", 0), "a_b_c_0.jpg");
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(WorkerState::Polling { empty_polls: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "polling", "empty_polls": 2 }));
        let json = serde_json::to_value(WorkerState::Stopped).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "stopped" }));
    }

    #[test]
    fn missing_source_summary_is_terse() {
        let err = JobError::MissingSource("/data/raw/1.jpg".into());
        assert_eq!(err.summary(), "A captured photo is missing from the device");
    }
}
