//! Test helper utilities: state assembly, HTTP server, polling

use fieldsync::app_state::AppState;
use fieldsync::config::AppConfig;
use fieldsync::db::ledger::PhotoLedger;
use fieldsync::routes;
use fieldsync::services::kv::MemoryStore;
use fieldsync::services::notify::NotificationSink;
use fieldsync::services::tracking::LoggingLocationSource;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Notification recorded by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Progress { done: usize, total: usize },
    Finished { success: bool, message: String },
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, Notification)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, job_id: Uuid) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn progress(&self, job_id: Uuid, _ticket_id: &str, done: usize, total: usize) {
        self.events
            .lock()
            .unwrap()
            .push((job_id, Notification::Progress { done, total }));
    }

    fn finished(&self, job_id: Uuid, _ticket_id: &str, success: bool, message: &str) {
        self.events.lock().unwrap().push((
            job_id,
            Notification::Finished {
                success,
                message: message.to_string(),
            },
        ));
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub locations: Arc<LoggingLocationSource>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Full service graph over in-memory stores.
pub async fn build_app(config: &AppConfig) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let locations = Arc::new(LoggingLocationSource::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let ledger = PhotoLedger::in_memory().await.expect("in-memory ledger");

    let state = AppState::assemble(
        config,
        store.clone(),
        ledger,
        locations.clone(),
        notifier.clone(),
    )
    .await
    .expect("assemble state");

    TestApp {
        state,
        store,
        locations,
        notifier,
    }
}

/// Serve the diagnostics API on an ephemeral port and return its base URL.
pub async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, routes::api_router(state))
            .await
            .expect("test server");
    });
    format!("http://{addr}")
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
