//! Integration tests for queued execution: routes answer `202` with a job
//! reference and the worker runtime executes the drained messages.

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;
use services_plane::worker::{MemoryJobQueue, jobs};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{SERVICES, TestApp, test_config};

async fn queued_app() -> (TestApp, Arc<MemoryJobQueue>) {
    let queue = Arc::new(MemoryJobQueue::new());
    let mut config = test_config();
    config.worker.enqueue_enabled = true;
    let app = TestApp::build(config, {
        let queue = queue.clone();
        move |builder| builder.enqueuer(queue)
    })
    .await;
    (app, queue)
}

#[tokio::test]
async fn test_long_running_routes_are_queued() {
    let (app, queue) = queued_app().await;
    let connected = app.connect_example("user-1").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap().to_string();

    let refresh = app
        .post(
            &format!("{SERVICES}/connections/{connection_id}/refresh"),
            json!({}),
        )
        .await;
    let renew = app
        .post(
            &format!("{SERVICES}/subscriptions/sub_1/renew"),
            json!({ "ttl_seconds": 3600 }),
        )
        .await;
    let sync = app
        .post(&format!("{SERVICES}/sync/{connection_id}/run"), json!({}))
        .await;
    let webhook = app
        .post_raw(
            &format!("{SERVICES}/webhooks/acme"),
            &[("x-delivery-id", "d-1")],
            br#"{"event":"ping"}"#,
        )
        .await;
    let retention = app
        .post(
            &format!("{SERVICES}/activity/retention/cleanup"),
            json!({ "async": true }),
        )
        .await;

    for response in [&refresh, &renew, &sync, &webhook, &retention] {
        assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.text());
        assert_eq!(response.json()["queued"], true);
    }
    assert_eq!(refresh.json()["job_id"], jobs::REFRESH);
    assert_eq!(
        queue.job_ids(),
        vec![
            jobs::REFRESH,
            jobs::SUBSCRIPTION_RENEW,
            jobs::SYNC_INCREMENTAL,
            jobs::WEBHOOK_PROCESS,
            jobs::ACTIVITY_RETENTION,
        ]
    );
}

#[tokio::test]
async fn test_inline_retention_still_runs_when_not_requested_async() {
    let (app, queue) = queued_app().await;

    let response = app
        .post(&format!("{SERVICES}/activity/retention/cleanup"), json!({}))
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    assert_eq!(response.json()["deleted"], 0);
    assert!(queue.messages().is_empty());
}

#[tokio::test]
async fn test_idempotency_key_dedupes_queued_jobs() {
    let (app, queue) = queued_app().await;
    let uri = format!("{SERVICES}/connections/conn_x/refresh");

    let first = app
        .post_with(&uri, &[("idempotency-key", "refresh-1")], json!({}))
        .await;
    let second = app
        .post_with(&uri, &[("idempotency-key", "refresh-1")], json!({}))
        .await;

    assert_eq!(first.status, StatusCode::ACCEPTED);
    assert_eq!(second.status, StatusCode::ACCEPTED);
    assert_eq!(second.json()["message_id"], first.json()["message_id"]);
    assert_eq!(queue.messages().len(), 1);
}

#[tokio::test]
async fn test_runtime_executes_drained_messages() {
    let (app, queue) = queued_app().await;
    let connected = app.connect_example("user-1").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap().to_string();

    app.post(
        &format!("{SERVICES}/connections/{connection_id}/refresh"),
        json!({}),
    )
    .await;
    app.post(&format!("{SERVICES}/sync/{connection_id}/run"), json!({}))
        .await;
    app.post_raw(
        &format!("{SERVICES}/webhooks/acme"),
        &[("x-delivery-id", "d-2")],
        br#"{"event":"ping"}"#,
    )
    .await;

    let messages = queue.drain();
    assert_eq!(messages.len(), 3);

    let refreshed = app
        .state
        .runtime
        .handle_execution_message(&messages[0])
        .await
        .expect("refresh job");
    assert_eq!(refreshed["credential"]["version"], 2);

    let synced = app
        .state
        .runtime
        .handle_execution_message(&messages[1])
        .await
        .expect("sync job");
    assert_eq!(synced["fetched"], 1);
    assert_eq!(synced["cursor"]["cursor"], "cursor-1");

    let processed = app
        .state
        .runtime
        .handle_execution_message(&messages[2])
        .await
        .expect("webhook job");
    assert_eq!(processed["status"], 202);
    assert_eq!(processed["outcome"]["delivery"]["delivery_id"], "d-2");

    // Replaying a message is safe: the ledger reports the duplicate.
    let replayed = app
        .state
        .runtime
        .handle_execution_message(&messages[2])
        .await
        .expect("webhook replay");
    assert_eq!(replayed["status"], 200);
    assert_eq!(replayed["outcome"]["duplicate"], true);
}

#[tokio::test]
async fn test_runtime_reports_missing_targets() {
    let (app, queue) = queued_app().await;

    app.post(
        &format!("{SERVICES}/subscriptions/sub_missing/renew"),
        json!({}),
    )
    .await;
    let message = queue.drain().remove(0);

    let err = app
        .state
        .runtime
        .handle_execution_message(&message)
        .await
        .expect_err("unknown subscription");
    assert!(err.message.contains("sub_missing"), "{}", err.message);
}
