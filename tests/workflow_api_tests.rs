//! Integration tests for the workflow surface: mapping lifecycle, sync
//! planning and runs, the conflict ledger, schema drift and callback
//! diagnostics.

use axum::http::{Method, StatusCode};
use serde_json::{Value, json};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{TestApp, WORKFLOW, request};

fn scope() -> Value {
    json!({ "type": "user", "id": "user-1" })
}

fn issue_spec(schema_ref: &str) -> Value {
    json!({
        "spec_id": "issues",
        "provider_id": "example",
        "scope": scope(),
        "source_object": "issue",
        "target_model": "task",
        "schema_ref": schema_ref,
        "rules": [
            { "source_path": "title", "target_path": "name", "transform": "trim", "required": true },
            { "source_path": "state", "target_path": "status", "default": "open" }
        ]
    })
}

fn version_body(version: u64) -> Value {
    json!({ "provider_id": "example", "scope": scope(), "version": version })
}

fn binding() -> Value {
    json!({
        "id": "bind-issues",
        "provider_id": "example",
        "scope": scope(),
        "connection_id": "conn-1",
        "mapping_spec_id": "issues",
        "source_object": "issue",
        "target_model": "task",
        "direction": "import"
    })
}

fn change(external_id: &str, version: &str) -> Value {
    json!({
        "source_object": "issue",
        "external_id": external_id,
        "source_version": version,
        "payload": { "title": format!(" issue {external_id} ") },
        "cursor": format!("c-{external_id}-{version}")
    })
}

async fn plan(app: &TestApp, mode: &str) -> Value {
    let response = app
        .post(
            &format!("{WORKFLOW}/sync/plan"),
            json!({ "binding": binding(), "mode": mode }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    response.json()
}

async fn run(app: &TestApp, plan: Value, changes: Vec<Value>) -> Value {
    let response = app
        .post(
            &format!("{WORKFLOW}/sync/run"),
            json!({ "plan": plan, "changes": changes }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    response.json()
}

async fn publish_issue_spec(app: &TestApp) {
    let created = app.post(&format!("{WORKFLOW}/mappings"), issue_spec("issue.v1")).await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.text());
    for action in ["validate", "publish"] {
        let response = app
            .post(
                &format!("{WORKFLOW}/mappings/spec/issues/{action}"),
                version_body(1),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{action}: {}", response.text());
    }
}

#[tokio::test]
async fn test_mapping_lifecycle_transitions() {
    let app = TestApp::new().await;

    let created = app.post(&format!("{WORKFLOW}/mappings"), issue_spec("issue.v1")).await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.text());
    let draft = created.json();
    assert_eq!(draft["version"], 1);
    assert_eq!(draft["status"], "draft");

    let early = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/publish"),
            version_body(1),
        )
        .await;
    assert_eq!(early.status, StatusCode::CONFLICT);
    assert_eq!(early.error_code(), "conflict");

    let validated = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/validate"),
            version_body(1),
        )
        .await;
    assert_eq!(validated.json()["status"], "validated");

    let published = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/publish"),
            version_body(1),
        )
        .await;
    assert_eq!(published.status, StatusCode::OK);
    assert_eq!(published.json()["status"], "published");
    assert!(published.json()["published_at"].is_string());

    let mut edited = issue_object("issue.v1");
    edited.insert("version".to_string(), json!(1));
    let edit = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/update"),
            Value::Object(edited),
        )
        .await;
    assert_eq!(edit.status, StatusCode::CONFLICT);

    let latest = app
        .get(&format!(
            "{WORKFLOW}/mappings/spec/issues?provider_id=example&scope_type=user&scope_id=user-1"
        ))
        .await;
    assert_eq!(latest.status, StatusCode::OK, "{}", latest.text());
    assert_eq!(latest.json()["status"], "published");

    let unpublished = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/unpublish"),
            version_body(1),
        )
        .await;
    assert_eq!(unpublished.json()["status"], "validated");

    let next = app.post(&format!("{WORKFLOW}/mappings"), issue_spec("issue.v2")).await;
    assert_eq!(next.json()["version"], 2);

    let listed = app
        .get(&format!("{WORKFLOW}/mappings?provider_id=example"))
        .await;
    assert_eq!(listed.json()["total"], 1);
    assert_eq!(listed.json()["items"][0]["version"], 2);

    let v1 = app
        .get(&format!(
            "{WORKFLOW}/mappings/spec/issues/versions/1?provider_id=example&scope_id=user-1"
        ))
        .await;
    assert_eq!(v1.json()["status"], "validated");

    let missing = app
        .get(&format!(
            "{WORKFLOW}/mappings/spec/issues/versions/9?provider_id=example&scope_id=user-1"
        ))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

/// `issue_spec` as a map so tests can override single fields.
fn issue_object(schema_ref: &str) -> serde_json::Map<String, Value> {
    match issue_spec(schema_ref) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_invalid_draft_cannot_be_validated() {
    let app = TestApp::new().await;
    let mut spec = issue_object("issue.v1");
    spec.insert(
        "rules".to_string(),
        json!([{ "source_path": "title", "target_path": "name", "transform": "reverse" }]),
    );

    let created = app.post(&format!("{WORKFLOW}/mappings"), Value::Object(spec)).await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.text());

    let response = app
        .post(
            &format!("{WORKFLOW}/mappings/spec/issues/validate"),
            version_body(1),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_code(), "validation_error");
    assert_eq!(
        response.json()["error"]["details"]["issues"][0]["code"],
        "unknown_transform"
    );
}

#[tokio::test]
async fn test_validate_and_preview_do_not_store() {
    let app = TestApp::new().await;
    let mut spec = issue_object("");
    spec.insert(
        "rules".to_string(),
        json!([
            { "source_path": "title", "target_path": "name" },
            { "source_path": "summary", "target_path": "name" }
        ]),
    );

    let report = app
        .post(&format!("{WORKFLOW}/mappings/validate"), Value::Object(spec))
        .await
        .json();
    let codes: Vec<&str> = report["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|issue| issue["code"].as_str())
        .collect();
    assert!(codes.contains(&"duplicate_target"), "{codes:?}");
    assert!(codes.contains(&"missing_schema_ref"), "{codes:?}");

    let preview = app
        .post(
            &format!("{WORKFLOW}/mappings/preview"),
            json!({
                "spec": issue_spec("issue.v1"),
                "samples": [{ "title": "  First  " }, { "state": "closed" }]
            }),
        )
        .await;
    assert_eq!(preview.status, StatusCode::OK, "{}", preview.text());
    let preview = preview.json();
    assert_eq!(preview["records"][0], json!({ "name": "First", "status": "open" }));
    assert_eq!(preview["report"], json!({ "total": 2, "mapped": 1, "failed": 1 }));
    assert_eq!(preview["issues"][0]["code"], "missing_required");

    let listed = app.get(&format!("{WORKFLOW}/mappings")).await;
    assert_eq!(listed.json()["total"], 0);
}

#[tokio::test]
async fn test_apply_run_checkpoints_and_records_stale_conflicts() {
    let app = TestApp::new().await;
    publish_issue_spec(&app).await;

    let first_plan = plan(&app, "apply").await;
    assert!(first_plan["from_checkpoint_id"].is_null());
    let first = run(&app, first_plan, vec![change("1", "0002")]).await;
    assert_eq!(first["result"]["status"], "succeeded");
    assert_eq!(first["result"]["processed_count"], 1);
    let checkpoint = &first["result"]["next_checkpoint"];
    assert_eq!(checkpoint["sequence"], 1);
    assert_eq!(checkpoint["cursor"], "c-1-0002");

    let stored = app
        .get(&format!(
            "{WORKFLOW}/sync/checkpoints/{}",
            checkpoint["id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(stored.status, StatusCode::OK);
    assert_eq!(stored.json()["binding_id"], "bind-issues");

    let second_plan = plan(&app, "apply").await;
    assert_eq!(second_plan["from_checkpoint_id"], checkpoint["id"]);
    assert_ne!(
        second_plan["idempotency_seed"],
        first["plan"]["idempotency_seed"]
    );
    let second = run(
        &app,
        second_plan,
        vec![change("1", "0001"), change("2", "0001")],
    )
    .await;
    assert_eq!(second["result"]["processed_count"], 1);
    assert_eq!(second["result"]["conflict_count"], 1);
    assert_eq!(second["result"]["next_checkpoint"]["sequence"], 2);

    let conflicts = app
        .get(&format!("{WORKFLOW}/sync/conflicts?provider_id=example&status=pending"))
        .await
        .json();
    assert_eq!(conflicts["total"], 1);
    let conflict = &conflicts["items"][0];
    assert_eq!(conflict["external_id"], "1");
    assert_eq!(conflict["run_id"], second["run_id"]);
    let conflict_id = conflict["id"].as_str().unwrap().to_string();

    let resolved = app
        .post(
            &format!("{WORKFLOW}/sync/conflicts/{conflict_id}/resolve"),
            json!({ "action": "resolve", "reason": "kept newer version", "resolved_by": "ops" }),
        )
        .await;
    assert_eq!(resolved.status, StatusCode::OK, "{}", resolved.text());
    let resolved = resolved.json();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolved_by"], "ops");
    assert!(resolved["resolved_at"].is_string());

    let retried = app
        .post(
            &format!("{WORKFLOW}/sync/conflicts/{conflict_id}/resolve"),
            json!({ "action": "retry" }),
        )
        .await
        .json();
    assert_eq!(retried["status"], "pending");
    assert!(retried["resolved_at"].is_null());

    let bad_status = app
        .get(&format!("{WORKFLOW}/sync/conflicts?status=exploded"))
        .await;
    assert_eq!(bad_status.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_integer_source_versions_order_numerically() {
    let app = TestApp::new().await;
    publish_issue_spec(&app).await;

    let first = run(&app, plan(&app, "apply").await, vec![change("1", "9")]).await;
    assert_eq!(first["result"]["processed_count"], 1);

    let newer = run(&app, plan(&app, "apply").await, vec![change("1", "10")]).await;
    assert_eq!(newer["result"]["processed_count"], 1);
    assert_eq!(newer["result"]["conflict_count"], 0);
    assert_eq!(newer["result"]["next_checkpoint"]["sequence"], 2);
    assert_eq!(newer["result"]["next_checkpoint"]["cursor"], "c-1-10");

    // "10" is now the last applied version, so "9" is stale.
    let older = run(&app, plan(&app, "apply").await, vec![change("1", "9")]).await;
    assert_eq!(older["result"]["processed_count"], 0);
    assert_eq!(older["result"]["conflict_count"], 1);
}

#[tokio::test]
async fn test_retried_conflict_can_then_be_resolved() {
    let app = TestApp::new().await;
    publish_issue_spec(&app).await;
    run(&app, plan(&app, "apply").await, vec![change("3", "2")]).await;
    let stale = run(&app, plan(&app, "apply").await, vec![change("3", "1")]).await;
    assert_eq!(stale["result"]["conflict_count"], 1);

    let conflicts = app
        .get(&format!("{WORKFLOW}/sync/conflicts?provider_id=example&status=pending"))
        .await
        .json();
    assert_eq!(conflicts["total"], 1);
    let conflict_id = conflicts["items"][0]["id"].as_str().unwrap().to_string();
    let uri = format!("{WORKFLOW}/sync/conflicts/{conflict_id}/resolve");

    let retried = app.post(&uri, json!({ "action": "retry" })).await;
    assert_eq!(retried.status, StatusCode::OK, "{}", retried.text());
    assert_eq!(retried.json()["status"], "pending");

    let resolved = app
        .post(&uri, json!({ "action": "resolve", "resolved_by": "ops" }))
        .await;
    assert_eq!(resolved.status, StatusCode::OK, "{}", resolved.text());
    let resolved = resolved.json();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolved_by"], "ops");
    assert!(resolved["resolved_at"].is_string());

    let pending = app
        .get(&format!("{WORKFLOW}/sync/conflicts?status=pending"))
        .await
        .json();
    assert_eq!(pending["total"], 0);
}

#[tokio::test]
async fn test_replayed_plan_skips_applied_changes() {
    let app = TestApp::new().await;
    let plan = plan(&app, "apply").await;

    let first = run(&app, plan.clone(), vec![change("7", "0001")]).await;
    let replay = run(&app, plan, vec![change("7", "0001")]).await;

    assert_eq!(first["result"]["processed_count"], 1);
    assert_eq!(replay["result"]["processed_count"], 0);
    assert_eq!(replay["result"]["skipped_count"], 1);
}

#[tokio::test]
async fn test_dry_run_leaves_no_checkpoint() {
    let app = TestApp::new().await;
    let plan = plan(&app, "dry_run").await;

    let record = run(&app, plan, vec![change("1", "0001")]).await;
    assert_eq!(record["result"]["processed_count"], 1);
    assert!(record["result"]["next_checkpoint"].is_null());

    let runs = app
        .get(&format!("{WORKFLOW}/sync/runs?provider_id=example"))
        .await
        .json();
    assert_eq!(runs["total"], 1);

    let fetched = app
        .get(&format!(
            "{WORKFLOW}/sync/runs/{}",
            record["run_id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(fetched.status, StatusCode::OK);
    assert_eq!(fetched.json()["plan"]["mode"], "dry_run");
}

#[tokio::test]
async fn test_resume_plans_from_the_previous_checkpoint() {
    let app = TestApp::new().await;
    let first = run(&app, plan(&app, "apply").await, vec![change("1", "0001")]).await;
    let run_id = first["run_id"].as_str().unwrap();

    let planned_only = app
        .post(&format!("{WORKFLOW}/sync/runs/{run_id}/resume"), json!({}))
        .await;
    assert_eq!(planned_only.status, StatusCode::OK, "{}", planned_only.text());
    let planned_only = planned_only.json();
    assert_eq!(planned_only["previous_run_id"], run_id);
    assert_eq!(
        planned_only["plan"]["from_checkpoint_id"],
        first["result"]["next_checkpoint"]["id"]
    );
    assert!(planned_only["run"].is_null());

    let executed = app
        .post(
            &format!("{WORKFLOW}/sync/runs/{run_id}/resume"),
            json!({ "changes": [change("2", "0001")] }),
        )
        .await
        .json();
    assert_eq!(executed["run"]["resumed_from"], run_id);
    assert_eq!(executed["run"]["result"]["next_checkpoint"]["sequence"], 2);

    let unknown = app
        .post(&format!("{WORKFLOW}/sync/runs/run_missing/resume"), json!({}))
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schema_drift_against_baseline() {
    let app = TestApp::new().await;
    app.post(&format!("{WORKFLOW}/mappings"), issue_spec("issue.v1"))
        .await;

    let before = app.get(&format!("{WORKFLOW}/sync/schema-drift")).await.json();
    assert_eq!(before["items"][0]["status"], "baseline_missing");

    let baseline = app
        .post(
            &format!("{WORKFLOW}/sync/schema-drift/baseline"),
            json!({ "provider_id": "example", "scope": scope(), "spec_id": "issues" }),
        )
        .await;
    assert_eq!(baseline.status, StatusCode::OK, "{}", baseline.text());
    assert_eq!(baseline.json()["schema_ref"], "issue.v1");
    assert!(!baseline.json()["captured_by"].as_str().unwrap().is_empty());

    let in_sync = app.get(&format!("{WORKFLOW}/sync/schema-drift")).await.json();
    assert_eq!(in_sync["items"][0]["status"], "in_sync");

    app.post(&format!("{WORKFLOW}/mappings"), issue_spec("issue.v2"))
        .await;
    let drifted = app.get(&format!("{WORKFLOW}/sync/schema-drift")).await.json();
    assert_eq!(drifted["items"][0]["status"], "drift_detected");
    assert_eq!(drifted["items"][0]["version"], 2);
    assert_eq!(drifted["items"][0]["baseline"]["version"], 1);

    let unknown = app
        .post(
            &format!("{WORKFLOW}/sync/schema-drift/baseline"),
            json!({ "provider_id": "example", "scope": scope(), "spec_id": "nope" }),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_connection_candidates_are_active_connections() {
    let app = TestApp::new().await;
    app.connect_example("user-1").await;
    app.connect_example("user-2").await;

    let all = app
        .get(&format!("{WORKFLOW}/connection-candidates?provider_id=example"))
        .await;
    assert_eq!(all.status, StatusCode::OK, "{}", all.text());
    let all = all.json();
    assert_eq!(all["total"], 2);
    assert_eq!(all["filter_applied"]["status"], "active");

    let one = app
        .get(&format!("{WORKFLOW}/connection-candidates?scope_id=user-2"))
        .await
        .json();
    assert_eq!(one["total"], 1);
    assert_eq!(one["items"][0]["scope_id"], "user-2");

    let invoked = app
        .post(
            &format!("{WORKFLOW}/capabilities/example/records.read/invoke"),
            json!({ "scope_type": "user", "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(invoked.status, StatusCode::OK, "{}", invoked.text());
    assert_eq!(invoked.json()["allowed"], true);
}

#[tokio::test]
async fn test_callback_diagnostics_resolve_against_request_host() {
    let app = TestApp::new().await;

    let status = app
        .send(request(
            Method::GET,
            &format!("{WORKFLOW}/callbacks/diagnostics/status"),
            &[("host", "services.test")],
            None,
        ))
        .await;
    assert_eq!(status.status, StatusCode::OK, "{}", status.text());
    let status = status.json();
    assert_eq!(status["strict"], false);
    assert_eq!(status["default_route"], "services.callback");
    let example = status["providers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["provider_id"] == "example")
        .cloned()
        .expect("example provider listed");
    assert_eq!(
        example["resolution"]["url"],
        "http://services.test/admin/api/services/connections/example/callback"
    );
    assert_eq!(example["resolution"]["source"], "route");

    let preview = app
        .send(request(
            Method::POST,
            &format!("{WORKFLOW}/callbacks/diagnostics/preview"),
            &[("x-forwarded-proto", "https"), ("x-forwarded-host", "edge.test")],
            Some(json!({ "provider_id": "example" })),
        ))
        .await;
    assert_eq!(preview.status, StatusCode::OK, "{}", preview.text());
    assert_eq!(
        preview.json()["url"],
        "https://edge.test/admin/api/services/connections/example/callback"
    );
    assert_eq!(preview.json()["absolute"], true);
}

#[tokio::test]
async fn test_strict_callbacks_fail_without_origin() {
    let mut config = test_utils::test_config();
    config.callbacks.strict = true;
    let app = TestApp::with_config(config).await;

    let preview = app
        .post(
            &format!("{WORKFLOW}/callbacks/diagnostics/preview"),
            json!({ "provider_id": "example" }),
        )
        .await;

    assert_eq!(preview.status, StatusCode::BAD_REQUEST);
    assert_eq!(preview.error_code(), "validation_error");
}
