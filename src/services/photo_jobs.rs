use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::photo_job::PhotoUploadJob;
use crate::services::durable_queue::{
    find_forbidden_key, load_sanitized, FailedEntry, FailedList, QueueError,
};
use crate::services::kv::KeyValueStore;

pub const PHOTO_QUEUE_KEY: &str = "photo_upload_queue";
pub const PHOTO_FAILED_KEY: &str = "photo_upload_failed";

/// Persisted FIFO of photo upload jobs. Every operation is a read-modify-write
/// of the whole document under one process-local lock.
pub struct PhotoJobQueue {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
    failed: FailedList<PhotoUploadJob>,
}

impl PhotoJobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, failed_capacity: usize) -> Self {
        let failed = FailedList::new(store.clone(), PHOTO_FAILED_KEY, failed_capacity);
        Self {
            store,
            lock: Mutex::new(()),
            failed,
        }
    }

    /// Current jobs in order. Entries that no longer deserialize are dropped
    /// and the cleaned document written back.
    pub async fn load(&self) -> Result<Vec<PhotoUploadJob>, QueueError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.load().await?.len())
    }

    pub async fn head(&self) -> Result<Option<PhotoUploadJob>, QueueError> {
        Ok(self.load().await?.into_iter().next())
    }

    pub async fn enqueue(&self, job: PhotoUploadJob) -> Result<(), QueueError> {
        if let Some(key) = find_forbidden_key(&serde_json::to_value(&job)?) {
            tracing::warn!(job_id = %job.id, key = %key, "Rejected photo job carrying file content");
            return Err(QueueError::BinaryPayload(key));
        }

        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;
        jobs.push(job);
        self.write(&jobs).await?;
        tracing::debug!(depth = jobs.len(), "Photo job enqueued");
        Ok(())
    }

    /// Remove the job with `id`. Returns whether it was present.
    pub async fn remove(&self, id: Uuid) -> Result<bool, QueueError> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.write(&jobs).await?;
        Ok(true)
    }

    /// Move `job` (with its updated attempt count) to the back of the queue.
    pub async fn requeue_tail(&self, job: PhotoUploadJob) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await?;
        jobs.retain(|j| j.id != job.id);
        jobs.push(job);
        self.write(&jobs).await
    }

    /// Take `job` out of the queue and record it in the failed list.
    pub async fn fail(&self, job: PhotoUploadJob, reason: impl Into<String>) -> Result<(), QueueError> {
        {
            let _guard = self.lock.lock().await;
            let mut jobs = self.read().await?;
            jobs.retain(|j| j.id != job.id);
            self.write(&jobs).await?;
        }
        self.failed.push(job, reason).await
    }

    pub async fn failed_entries(&self) -> Result<Vec<FailedEntry<PhotoUploadJob>>, QueueError> {
        self.failed.entries().await
    }

    async fn read(&self) -> Result<Vec<PhotoUploadJob>, QueueError> {
        load_sanitized(self.store.as_ref(), PHOTO_QUEUE_KEY, |_| true).await
    }

    async fn write(&self, jobs: &[PhotoUploadJob]) -> Result<(), QueueError> {
        self.store
            .set(PHOTO_QUEUE_KEY, &serde_json::to_string(jobs)?)
            .await?;
        metrics::gauge!("photo_queue_depth").set(jobs.len() as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryStore;
    use chrono::Utc;

    fn job(ticket: &str) -> PhotoUploadJob {
        PhotoUploadJob::new(ticket, "U-1", vec![format!("/tmp/{ticket}.jpg")], Utc::now(), None, 0)
    }

    #[tokio::test]
    async fn fifo_order_with_tail_requeue() {
        let queue = PhotoJobQueue::new(Arc::new(MemoryStore::new()), 20);
        let (a, b) = (job("A"), job("B"));
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();

        let mut head = queue.head().await.unwrap().unwrap();
        assert_eq!(head.id, a.id);

        head.attempts = 1;
        queue.requeue_tail(head).await.unwrap();

        let jobs = queue.load().await.unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert_eq!(jobs[1].attempts, 1);
    }

    #[tokio::test]
    async fn corrupted_entries_are_dropped_and_written_back() {
        let store = Arc::new(MemoryStore::new());
        let good = job("A");
        let document = format!(
            "[{}, {{\"ticket_id\": 7}}, \"garbage\"]",
            serde_json::to_string(&good).unwrap()
        );
        store.set(PHOTO_QUEUE_KEY, &document).await.unwrap();

        let queue = PhotoJobQueue::new(store.clone(), 20);
        assert_eq!(queue.load().await.unwrap(), vec![good.clone()]);

        let persisted = store.get(PHOTO_QUEUE_KEY).await.unwrap().unwrap();
        let reparsed: Vec<PhotoUploadJob> = serde_json::from_str(&persisted).unwrap();
        assert_eq!(reparsed, vec![good]);
    }

    #[tokio::test]
    async fn failed_jobs_leave_the_queue() {
        let queue = PhotoJobQueue::new(Arc::new(MemoryStore::new()), 20);
        let a = job("A");
        queue.enqueue(a.clone()).await.unwrap();

        queue.fail(a.clone(), "gave up").await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 0);
        let failed = queue.failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item.id, a.id);
        assert_eq!(failed[0].reason, "gave up");
    }

    #[tokio::test]
    async fn concurrent_producers_do_not_lose_jobs() {
        let queue = Arc::new(PhotoJobQueue::new(Arc::new(MemoryStore::new()), 20));
        let submits = (0..10).map(|i| {
            let queue = queue.clone();
            async move { queue.enqueue(job(&format!("T-{i}"))).await }
        });

        for result in futures::future::join_all(submits).await {
            tokio_test::assert_ok!(result);
        }
        assert_eq!(queue.len().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn remove_reports_absence() {
        let queue = PhotoJobQueue::new(Arc::new(MemoryStore::new()), 20);
        assert!(!queue.remove(Uuid::new_v4()).await.unwrap());
    }
}
