use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::ledger::{LedgerError, PhotoLedger};
use crate::models::action::QueueItem;
use crate::services::{
    action_processor::{ActionHandlers, ActionQueueProcessor, SelectedTicketCache, ACTION_QUEUE_KEY},
    capture::CaptureService,
    connectivity::ConnectivityMonitor,
    durable_queue::{BackoffPolicy, DurableQueue, QueueError, RetryPolicy},
    geocode::{GeocodeError, ReverseGeocoder},
    kv::{FileStore, KeyValueStore, KvError, RedisStore},
    notify::{NotificationSink, TracingNotifier},
    photo_jobs::PhotoJobQueue,
    pipeline::{PhotoPipeline, PipelineConfig},
    ticket_api::{ApiError, TicketApiClient},
    tracking::{LocationSource, LoggingLocationSource, TripTracking},
    worker::{UploadWorker, WorkerConfig},
};

/// Shared application state passed to all route handlers and binaries.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<PhotoLedger>,
    pub store: Arc<dyn KeyValueStore>,
    pub actions: Arc<ActionQueueProcessor>,
    pub selected: Arc<SelectedTicketCache>,
    pub tracking: Arc<TripTracking>,
    pub jobs: Arc<PhotoJobQueue>,
    pub worker: Arc<UploadWorker>,
    pub capture: Arc<CaptureService>,
    pub connectivity: Arc<ConnectivityMonitor>,
}

impl AppState {
    /// Open the configured stores and build every service on top of them.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let store: Arc<dyn KeyValueStore> = match &config.redis_url {
            Some(url) => {
                tracing::info!("Using Redis for queue documents");
                Arc::new(RedisStore::new(url)?)
            }
            None => {
                tracing::info!(dir = %config.kv_dir().display(), "Using file store for queue documents");
                Arc::new(FileStore::new(config.kv_dir())?)
            }
        };

        tracing::info!("Opening photo ledger");
        let ledger = PhotoLedger::open(&config.database_url()).await?;

        Self::assemble(
            config,
            store,
            ledger,
            Arc::new(LoggingLocationSource::default()),
            Arc::new(TracingNotifier),
        )
        .await
    }

    /// Build the services over already opened stores.
    pub async fn assemble(
        config: &AppConfig,
        store: Arc<dyn KeyValueStore>,
        ledger: PhotoLedger,
        location_source: Arc<dyn LocationSource>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, StartupError> {
        let ledger = Arc::new(ledger);
        let api = Arc::new(TicketApiClient::new(&config.api_base_url, config.api_token.clone())?);

        let retry = RetryPolicy {
            max_retry: config.max_retry,
            backoff: BackoffPolicy::new(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
        };
        let queue: DurableQueue<QueueItem> = DurableQueue::open(
            store.clone(),
            ACTION_QUEUE_KEY,
            retry,
            config.failed_list_capacity,
        )
        .await?;

        let selected = Arc::new(SelectedTicketCache::new(store.clone()));
        let tracking = Arc::new(TripTracking::new(location_source));
        let handlers = ActionHandlers::backend(api.clone(), selected.clone(), tracking.clone());
        let actions = Arc::new(ActionQueueProcessor::new(queue, handlers));

        let geocoder = if config.overlay_enabled {
            Some(Arc::new(ReverseGeocoder::new(
                &config.geocode_url,
                config.geocode_attempts,
                config.geocode_retry_delay(),
            )?))
        } else {
            None
        };
        let pipeline = Arc::new(PhotoPipeline::new(
            PipelineConfig {
                max_width: config.photo_max_width,
                quality: config.photo_quality,
                overlay_enabled: config.overlay_enabled,
                output_dir: config.photo_dir(),
                gallery_dir: config.gallery_dir.clone(),
            },
            geocoder,
        ));

        let jobs = Arc::new(PhotoJobQueue::new(store.clone(), config.failed_list_capacity));
        let worker = Arc::new(UploadWorker::new(
            jobs.clone(),
            ledger.clone(),
            pipeline,
            api,
            notifier,
            WorkerConfig {
                poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
                idle_backoff: Duration::from_millis(config.worker_idle_backoff_ms),
                max_empty_polls: config.worker_max_empty_polls,
                max_retry: config.max_retry,
            },
        ));
        let capture = Arc::new(CaptureService::new(ledger.clone(), jobs.clone(), worker.clone()));

        Ok(Self {
            ledger,
            store,
            actions,
            selected,
            tracking,
            jobs,
            worker,
            capture,
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Key-value store unavailable: {0}")]
    Store(#[from] KvError),

    #[error("Photo ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Action queue could not be loaded: {0}")]
    Queue(#[from] QueueError),

    #[error("Backend client could not be built: {0}")]
    Api(#[from] ApiError),

    #[error("Geocoder client could not be built: {0}")]
    Geocode(#[from] GeocodeError),
}
