//! Integration tests for the services surface: connection lifecycle,
//! capability decisions, authorization and client idempotency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::{Method, StatusCode};
use metrics::{
    Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use serde_json::json;
use services_plane::auth::{StaticAuthorizer, permissions};
use services_plane::models::status::InstallationStatus;
use services_plane::scope::ScopeRef;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{SERVICES, TestApp, request, test_config};

#[tokio::test]
async fn test_probes_answer_without_credentials() {
    let app = TestApp::new().await;

    let health = app.get("/healthz").await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.json()["status"], "ok");

    let ready = app.get("/readyz").await;
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(ready.json()["status"], "ready");

    let root = app.get("/").await;
    assert_eq!(root.json()["service"], "services-plane");
}

#[tokio::test]
async fn test_example_connection_lifecycle() {
    let app = TestApp::new().await;

    let connected = app.connect_example("user-1").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap().to_string();
    assert_eq!(connected["connection"]["provider_id"], "example");
    assert_eq!(connected["connection"]["external_account_id"], "acct-user-1");
    assert_eq!(connected["connection"]["status"], "active");
    assert_eq!(connected["credential"]["version"], 1);
    assert_eq!(connected["grants"]["granted_grants"], json!(["records:read"]));

    let grants = app
        .get(&format!("{SERVICES}/connections/{connection_id}/grants"))
        .await;
    assert_eq!(grants.status, StatusCode::OK);
    assert_eq!(grants.json()["granted_grants"], json!(["records:read"]));

    let read = app
        .post(
            &format!("{SERVICES}/capabilities/example/records.read/invoke"),
            json!({ "scope_type": "user", "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK, "{}", read.text());
    assert_eq!(read.json()["allowed"], true);
    assert_eq!(read.json()["mode"], "allow");

    let write = app
        .post(
            &format!("{SERVICES}/capabilities/example/records.write/invoke"),
            json!({ "scope_type": "user", "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(write.status, StatusCode::OK);
    assert_eq!(write.json()["allowed"], false);
    assert_eq!(write.json()["mode"], "warn");
    assert_eq!(
        write.json()["metadata"]["missing_grants"],
        json!(["records:write"])
    );

    let refreshed = app
        .post(
            &format!("{SERVICES}/connections/{connection_id}/refresh"),
            json!({}),
        )
        .await;
    assert_eq!(refreshed.status, StatusCode::OK, "{}", refreshed.text());
    assert_eq!(refreshed.json()["credential"]["version"], 2);
    assert_eq!(refreshed.json()["connection"]["status"], "active");

    let revoke_uri = format!("{SERVICES}/connections/{connection_id}/revoke");
    let first = app.post(&revoke_uri, json!({ "reason": "offboarding" })).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.json()["connection"]["status"], "disconnected");

    let second = app.post(&revoke_uri, json!({ "reason": "offboarding" })).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.json()["connection"], first.json()["connection"]);

    let detail = app
        .get(&format!("{SERVICES}/connections/{connection_id}"))
        .await;
    assert_eq!(detail.json()["connection"]["status"], "disconnected");
    assert!(detail.json()["credential"].is_null());
}

#[tokio::test]
async fn test_blocked_capability_without_connection_is_missing_permissions() {
    let app = TestApp::new().await;

    let response = app
        .post(
            &format!("{SERVICES}/capabilities/example/records.read/invoke"),
            json!({ "scope_type": "user", "scope_id": "nobody" }),
        )
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.error_code(), "missing_permissions");
    assert_eq!(
        response.json()["error"]["details"]["missing_grants"],
        json!(["records:read"])
    );
}

#[tokio::test]
async fn test_denied_authorization_code_is_unauthorized() {
    let app = TestApp::new().await;
    let begin = app
        .post(
            &format!("{SERVICES}/connections/example/begin"),
            json!({ "scope_type": "user", "scope_id": "user-2" }),
        )
        .await;
    let state = begin.json()["state"].as_str().unwrap().to_string();

    let callback = app
        .get(&format!(
            "{SERVICES}/connections/example/callback?code=denied&state={state}&scope_type=user&scope_id=user-2"
        ))
        .await;

    assert_eq!(callback.status, StatusCode::UNAUTHORIZED);
    assert_eq!(callback.error_code(), "unauthorized");

    let listed = app.get(&format!("{SERVICES}/connections")).await;
    assert_eq!(listed.json()["total"], 0);
}

#[tokio::test]
async fn test_callback_requires_code_and_reports_provider_errors() {
    let app = TestApp::new().await;

    let missing = app
        .get(&format!(
            "{SERVICES}/connections/example/callback?state=s-1&scope_id=user-1"
        ))
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.error_code(), "validation_error");

    let declined = app
        .get(&format!(
            "{SERVICES}/connections/example/callback?error=access_denied&state=s-1"
        ))
        .await;
    assert_eq!(declined.status, StatusCode::BAD_REQUEST);
    assert!(
        declined.json()["error"]["message"]
            .as_str()
            .unwrap()
            .contains("access_denied")
    );
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .post(
            &format!("{SERVICES}/connections/nope/begin"),
            json!({ "scope_id": "user-1" }),
        )
        .await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.error_code(), "not_found");
}

#[tokio::test]
async fn test_connections_list_envelope_reports_filters() {
    let app = TestApp::new().await;
    app.connect_example("user-a").await;
    app.connect_example("user-b").await;

    let all = app.get(&format!("{SERVICES}/connections?limit=1")).await;
    let body = all.json();
    assert_eq!(all.status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["has_more"], true);
    assert_eq!(body["next_offset"], 1);

    let filtered = app
        .get(&format!(
            "{SERVICES}/connections?provider_id=example&scope_id=user-b"
        ))
        .await
        .json();
    assert_eq!(filtered["total"], 1);
    assert_eq!(filtered["items"][0]["scope_id"], "user-b");
    assert_eq!(filtered["filter_applied"]["provider_id"], "example");
    assert_eq!(filtered["filter_applied"]["scope_id"], "user-b");
}

#[tokio::test]
async fn test_actor_headers_supply_default_scope() {
    let app = TestApp::new().await;

    let begin = app
        .post_with(
            &format!("{SERVICES}/connections/example/begin"),
            &[("x-actor-id", "actor-7")],
            json!({}),
        )
        .await;
    assert_eq!(begin.status, StatusCode::OK, "{}", begin.text());
    let state = begin.json()["state"].as_str().unwrap().to_string();

    let callback = app
        .send(request(
            Method::GET,
            &format!("{SERVICES}/connections/example/callback?code=c-7&state={state}"),
            &[("x-actor-id", "actor-7")],
            None,
        ))
        .await;
    assert_eq!(callback.status, StatusCode::OK, "{}", callback.text());
    assert_eq!(callback.json()["connection"]["scope_type"], "user");
    assert_eq!(callback.json()["connection"]["scope_id"], "actor-7");
}

#[tokio::test]
async fn test_denied_permission_returns_forbidden_envelope() {
    let app = TestApp::build(test_config(), |builder| {
        builder.authorizer(Arc::new(StaticAuthorizer::deny([permissions::VIEW])))
    })
    .await;

    let response = app
        .send(request(
            Method::GET,
            &format!("{SERVICES}/providers"),
            &[("x-request-id", "req-42")],
            None,
        ))
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    let body = response.json();
    assert_eq!(body["error"]["code"], "forbidden");
    assert_eq!(body["error"]["retryable"], false);
    assert_eq!(body["error"]["request_id"], "req-42");
    assert_eq!(response.headers["x-request-id"], "req-42");

    // Other permissions are unaffected.
    let begin = app
        .post(
            &format!("{SERVICES}/connections/example/begin"),
            json!({ "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(begin.status, StatusCode::OK);
}

#[tokio::test]
async fn test_idempotency_key_replays_and_detects_conflicts() {
    let app = TestApp::new().await;
    let uri = format!("{SERVICES}/connections/example/begin");
    let headers = [("idempotency-key", "begin-1")];
    let payload = json!({ "scope_type": "user", "scope_id": "user-1" });

    let first = app.post_with(&uri, &headers, payload.clone()).await;
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.get("idempotent-replayed").is_none());

    let second = app.post_with(&uri, &headers, payload).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.headers["idempotent-replayed"], "true");
    assert_eq!(second.body, first.body);

    let conflict = app
        .post_with(
            &uri,
            &headers,
            json!({ "scope_type": "user", "scope_id": "user-2" }),
        )
        .await;
    assert_eq!(conflict.status, StatusCode::CONFLICT);
    assert_eq!(conflict.error_code(), "conflict");

    // Keys are scoped per actor.
    let other_actor = app
        .post_with(
            &uri,
            &[("idempotency-key", "begin-1"), ("x-actor-id", "someone")],
            json!({ "scope_type": "user", "scope_id": "user-2" }),
        )
        .await;
    assert_eq!(other_actor.status, StatusCode::OK);
}

#[tokio::test]
async fn test_failed_responses_are_not_cached_for_replay() {
    let app = TestApp::new().await;
    let uri = format!("{SERVICES}/connections/missing/revoke");
    let headers = [("idempotency-key", "revoke-1")];

    let first = app.post_with(&uri, &headers, json!({})).await;
    let second = app.post_with(&uri, &headers, json!({})).await;

    assert_eq!(first.status, StatusCode::NOT_FOUND);
    assert_eq!(second.status, StatusCode::NOT_FOUND);
    assert!(second.headers.get("idempotent-replayed").is_none());
}

#[tokio::test]
async fn test_required_idempotency_key_rejects_mutations_without_it() {
    let mut config = test_config();
    config.api.require_idempotency_key = true;
    let app = TestApp::with_config(config).await;

    let rejected = app
        .post(
            &format!("{SERVICES}/connections/example/begin"),
            json!({ "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.error_code(), "validation_error");

    // Reads never need a key.
    let listed = app.get(&format!("{SERVICES}/providers")).await;
    assert_eq!(listed.status, StatusCode::OK);
}

#[tokio::test]
async fn test_operator_tokens_guard_the_api_but_not_probes() {
    let mut config = test_config();
    config.operator_tokens = vec!["op-secret".to_string()];
    let app = TestApp::with_config(config).await;

    let anonymous = app.get(&format!("{SERVICES}/providers")).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.error_code(), "unauthorized");

    let wrong = app
        .send(request(
            Method::GET,
            &format!("{SERVICES}/providers"),
            &[("authorization", "Bearer nope")],
            None,
        ))
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let authorized = app
        .send(request(
            Method::GET,
            &format!("{SERVICES}/providers"),
            &[("authorization", "Bearer op-secret")],
            None,
        ))
        .await;
    assert_eq!(authorized.status, StatusCode::OK);
    assert_eq!(authorized.json()["items"][0]["id"], "example");

    assert_eq!(app.get("/healthz").await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_counts_connections_and_outbox() {
    let app = TestApp::new().await;
    app.connect_example("user-1").await;

    let status = app.get(&format!("{SERVICES}/status")).await;
    assert_eq!(status.status, StatusCode::OK, "{}", status.text());
    let body = status.json();
    assert_eq!(body["providers"], json!(["example"]));
    assert_eq!(body["activity"]["fallback_buffered"], 0);
}

#[tokio::test]
async fn test_failed_sync_stops_at_attempt_cap_until_restarted() {
    let mut config = test_config();
    config.sync.max_attempts = 2;
    let app = TestApp::with_config(config).await;
    let connected = app.connect_example("user-1").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap().to_string();
    // Without an active credential every run fails.
    app.post(
        &format!("{SERVICES}/connections/{connection_id}/revoke"),
        json!({}),
    )
    .await;
    let run_uri = format!("{SERVICES}/sync/{connection_id}/run");
    let status_uri = format!("{SERVICES}/sync/{connection_id}/status");

    let first = app.post(&run_uri, json!({})).await;
    assert_eq!(first.status, StatusCode::CONFLICT);
    let job = app.get(&status_uri).await.json()["jobs"][0].clone();
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 1);
    assert!(job["next_attempt_at"].is_string());

    app.post(&run_uri, json!({})).await;
    let job = app.get(&status_uri).await.json()["jobs"][0].clone();
    assert_eq!(job["attempts"], 2);
    assert!(job["next_attempt_at"].is_null());

    let refused = app.post(&run_uri, json!({})).await;
    assert_eq!(refused.status, StatusCode::CONFLICT);
    assert!(refused.text().contains("request a restart"), "{}", refused.text());
    let job = app.get(&status_uri).await.json()["jobs"][0].clone();
    assert_eq!(job["attempts"], 2);

    app.post(&run_uri, json!({ "restart": true })).await;
    let job = app.get(&status_uri).await.json()["jobs"][0].clone();
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 1);
    assert!(job["next_attempt_at"].is_string());
}

/// Records counter increments by metric name.
#[derive(Default)]
struct CounterTally {
    counts: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl CounterTally {
    fn get(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }
}

struct TallyCounter(Arc<AtomicU64>);

impl CounterFn for TallyCounter {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::SeqCst);
    }

    fn absolute(&self, value: u64) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }
}

impl Recorder for CounterTally {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let count = self
            .counts
            .lock()
            .unwrap()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Counter::from_arc(Arc::new(TallyCounter(count)))
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

#[test]
fn test_idempotency_replays_and_conflicts_are_counted_once() {
    let tally = CounterTally::default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    metrics::with_local_recorder(&tally, || {
        runtime.block_on(async {
            let app = TestApp::new().await;
            let uri = format!("{SERVICES}/connections/example/begin");
            let headers = [("idempotency-key", "begin-count")];
            let payload = json!({ "scope_type": "user", "scope_id": "user-1" });

            app.post_with(&uri, &headers, payload.clone()).await;
            let replay = app.post_with(&uri, &headers, payload).await;
            assert_eq!(replay.headers["idempotent-replayed"], "true");
            let conflict = app
                .post_with(&uri, &headers, json!({ "scope_id": "user-2" }))
                .await;
            assert_eq!(conflict.status, StatusCode::CONFLICT);
        })
    });

    assert_eq!(tally.get("services_idempotency_replays_total"), 1);
    assert_eq!(tally.get("services_idempotency_conflicts_total"), 1);
}

#[tokio::test]
async fn test_installation_upsert_leaves_unchanged_rows_alone() {
    let app = TestApp::new().await;
    let installations = &app.state.repos.installations;
    let scope = ScopeRef::org("org-1");

    let active = installations
        .upsert("example", &scope, "app", InstallationStatus::Active, json!({ "seats": 5 }))
        .await
        .unwrap();
    let repeated = installations
        .upsert("example", &scope, "app", InstallationStatus::Active, json!({ "seats": 5 }))
        .await
        .unwrap();
    assert_eq!(repeated, active);

    let uninstalled = installations
        .upsert("example", &scope, "app", InstallationStatus::Uninstalled, json!({}))
        .await
        .unwrap();
    assert_eq!(uninstalled.status, "uninstalled");
    assert!(uninstalled.revoked_at.is_some());

    let again = installations
        .upsert(
            "example",
            &scope,
            "bot",
            InstallationStatus::Uninstalled,
            json!({ "note": "late webhook" }),
        )
        .await
        .unwrap();
    assert_eq!(again, uninstalled);

    let reactivated = installations
        .upsert("example", &scope, "app", InstallationStatus::Active, json!({}))
        .await;
    assert!(reactivated.is_err());
}
