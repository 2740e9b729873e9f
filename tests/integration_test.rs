//! Action queue, connectivity and diagnostics API against a mocked backend.

mod fixtures;
mod helpers;

use fieldsync::models::action::{CancelPayload, ExtraCharge, ExtrasPayload, TicketAction};
use fieldsync::services::action_processor::SelectedTicket;
use fixtures::*;
use helpers::*;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn actions_queued_offline_run_when_connectivity_returns() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/ticket/T-1/status"))
        .and(body_partial_json(json!({ "status": "started" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ticket/T-1/extras"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&test_config(&server.uri(), dir.path(), &[])).await;
    let state = &app.state;
    state.connectivity.report(false);
    let processor = state.actions.clone().spawn(state.connectivity.subscribe());

    let start = state
        .actions
        .enqueue("T-1", TicketAction::start(Some(site_location())))
        .await
        .unwrap();
    state
        .actions
        .enqueue(
            "T-1",
            TicketAction::Extras(ExtrasPayload {
                items: vec![ExtraCharge {
                    code: "LADDER".into(),
                    quantity: 1.0,
                    note: None,
                }],
                details: Default::default(),
            }),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.actions.queue().len().await, 2);

    state.connectivity.report(true);
    assert!(
        eventually(Duration::from_secs(5), || async move {
            state.actions.queue().is_empty().await
        })
        .await
    );

    let TicketAction::Start(payload) = &start.action else {
        panic!("expected a start action");
    };
    let selected: Option<SelectedTicket> = state.selected.get().await.unwrap();
    assert_eq!(selected.map(|s| s.trip_id), Some(payload.trip_id));
    assert_eq!(state.tracking.active_count(), 1);
    assert_eq!(app.locations.live_subscriptions(), 1);

    processor.abort();
}

#[tokio::test]
async fn persistent_backend_failure_evicts_after_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/ticket/T-2/status"))
        .respond_with(ResponseTemplate::new(503))
        .expect(5)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&test_config(&server.uri(), dir.path(), &[])).await;
    let state = &app.state;
    let processor = state.actions.clone().spawn(state.connectivity.subscribe());

    let item = state
        .actions
        .enqueue(
            "T-2",
            TicketAction::Cancel(CancelPayload {
                reason: Some("duplicate".into()),
                cancelled_at: chrono::Utc::now(),
            }),
        )
        .await
        .unwrap();
    state.actions.request_pass();

    // Retries after the first one are driven by the backoff timer alone.
    let failed = state.actions.queue().failed();
    assert!(
        eventually(Duration::from_secs(5), || async move {
            failed.entries().await.map(|e| e.len() == 1).unwrap_or(false)
        })
        .await
    );

    assert!(state.actions.queue().is_empty().await);
    let entry = &failed.entries().await.unwrap()[0];
    assert_eq!(entry.item.id, item.id);
    assert_eq!(entry.item.attempts, 5);

    processor.abort();
}

#[tokio::test]
async fn queued_actions_survive_a_restart() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), &[]);

    let first = build_app(&config).await;
    first.state.connectivity.report(false);
    first
        .state
        .actions
        .enqueue(
            "T-3",
            TicketAction::Cancel(CancelPayload {
                reason: None,
                cancelled_at: chrono::Utc::now(),
            }),
        )
        .await
        .unwrap();

    let reopened = fieldsync::services::durable_queue::DurableQueue::<
        fieldsync::models::action::QueueItem,
    >::open(
        first.store.clone(),
        fieldsync::services::action_processor::ACTION_QUEUE_KEY,
        Default::default(),
        20,
    )
    .await
    .unwrap();
    let items = reopened.snapshot().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].ticket_id, "T-3");
    assert!(!reopened.is_processing());
}

#[tokio::test]
async fn http_surface_accepts_actions_and_reports_queues() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&test_config(&server.uri(), dir.path(), &[])).await;
    app.state.connectivity.report(false);
    let base_url = serve(app.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base_url}/api/v1/actions"))
        .json(&json!({ "ticket_id": "T-4", "kind": "cancel", "reason": "customer absent" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let response = client
        .post(format!("{base_url}/api/v1/actions"))
        .json(&json!({
            "ticket_id": "T-4",
            "kind": "extras",
            "items": [],
            "details": { "photo": "base64..." }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    let response = client
        .post(format!("{base_url}/api/v1/actions"))
        .json(&json!({ "ticket_id": "", "kind": "start" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let queues: serde_json::Value = client
        .get(format!("{base_url}/api/v1/queues"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queues["connected"], json!(false));
    assert_eq!(queues["actions"]["depth"], json!(1));
    assert_eq!(queues["actions"]["items"][0]["action"]["kind"], json!("cancel"));
    assert_eq!(queues["photo_jobs"]["depth"], json!(0));
    assert_eq!(queues["worker"]["state"], json!("stopped"));
}

#[tokio::test]
async fn photo_submission_is_visible_in_the_ledger() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    // Keep the worker asleep so the rows stay pending.
    let config = test_config(
        &server.uri(),
        dir.path(),
        &[("WORKER_POLL_INTERVAL_MS", "60000")],
    );
    let app = build_app(&config).await;
    let base_url = serve(app.state.clone()).await;
    let client = reqwest::Client::new();

    for batch in [vec!["/captures/a.jpg", "/captures/b.jpg"], vec!["/captures/c.jpg"]] {
        let response = client
            .post(format!("{base_url}/api/v1/photo-jobs"))
            .json(&json!({ "ticket_id": "T-5", "user_id": "U-1", "photo_uris": batch }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
    }

    let photos: Vec<serde_json::Value> = client
        .get(format!("{base_url}/api/v1/tickets/T-5/photos"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let orders: Vec<u64> = photos
        .iter()
        .map(|p| p["queue_order"].as_u64().unwrap())
        .collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(photos[2]["local_uri"], json!("/captures/c.jpg"));

    let jobs = app.state.jobs.load().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[1].photo_start_index, 2);

    let response = client
        .post(format!("{base_url}/api/v1/photo-jobs"))
        .json(&json!({ "ticket_id": "T-5", "user_id": "U-1", "photo_uris": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    app.state.worker.request_stop();
}

#[tokio::test]
async fn health_reports_ok_for_in_memory_stores() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&test_config(&server.uri(), dir.path(), &[])).await;
    let base_url = serve(app.state.clone()).await;

    let body: serde_json::Value = reqwest::get(format!("{base_url}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["checks"]["ledger"]["status"], json!("ok"));
}
