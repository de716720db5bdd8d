//! Integration tests for the built-in OAuth2 packs against a mock token
//! endpoint: authorize URL, code exchange, refresh and upstream failures.

use axum::http::StatusCode;
use serde_json::{Value, json};
use services_plane::config::{AppConfig, OAuthClientConfig};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{SERVICES, TestApp, test_config};

const TOKEN_PATH: &str = "/login/oauth/access_token";

fn github_config(server: &MockServer) -> AppConfig {
    let mut config = test_config();
    config.extensions.enabled_provider_packs = vec!["github".to_string()];
    config.oauth_clients.insert(
        "github".to_string(),
        OAuthClientConfig {
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            authorize_url: None,
            token_url: Some(format!("{}{}", server.uri(), TOKEN_PATH)),
        },
    );
    config
}

async fn mock_code_exchange(server: &MockServer, code: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(format!("code={code}")))
        .and(body_string_contains("client_secret=secret-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_first",
            "refresh_token": "ghr_first",
            "token_type": "bearer",
            "expires_in": 28800,
            "scope": "repo,read:org",
            "account_id": "octocat"
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn begin(app: &TestApp, user: &str) -> String {
    let begin = app
        .post(
            &format!("{SERVICES}/connections/github/begin"),
            json!({ "scope_type": "user", "scope_id": user }),
        )
        .await;
    assert_eq!(begin.status, StatusCode::OK, "{}", begin.text());
    begin.json()["state"].as_str().unwrap().to_string()
}

async fn connect(app: &TestApp, user: &str, code: &str) -> Value {
    let state = begin(app, user).await;
    let callback = app
        .get(&format!(
            "{SERVICES}/connections/github/callback?code={code}&state={state}&scope_type=user&scope_id={user}"
        ))
        .await;
    assert_eq!(callback.status, StatusCode::OK, "{}", callback.text());
    callback.json()
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_enabled_pack_is_listed_with_capabilities() {
    let server = MockServer::start().await;
    let app = TestApp::with_config(github_config(&server)).await;

    let listed = app
        .get(&format!("{SERVICES}/providers?capability=org.members.read"))
        .await;

    assert_eq!(listed.status, StatusCode::OK);
    let body = listed.json();
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], "github");
}

#[tokio::test]
async fn test_begin_builds_authorize_url_and_replays_by_key() {
    let server = MockServer::start().await;
    let app = TestApp::with_config(github_config(&server)).await;
    let uri = format!("{SERVICES}/connections/github/begin");
    let headers = [("idempotency-key", "gh-begin-1"), ("host", "admin.test")];
    let payload = json!({ "scope_type": "user", "scope_id": "user-1" });

    let first = app.post_with(&uri, &headers, payload.clone()).await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.text());
    let body = first.json();
    let url = body["authorization_url"].as_str().unwrap();
    assert!(url.starts_with("https://github.com/login/oauth/authorize?"), "{url}");
    assert!(url.contains("client_id=client-1"));
    assert!(url.contains("response_type=code"));
    assert!(url.contains(&format!("state={}", body["state"].as_str().unwrap())));
    assert!(url.contains(
        "redirect_uri=http%3A%2F%2Fadmin.test%2Fadmin%2Fapi%2Fservices%2Fconnections%2Fgithub%2Fcallback"
    ));
    let mut requested = strings(&body["requested_grants"]);
    requested.sort();
    assert_eq!(requested, vec!["read:org", "repo"]);

    let replay = app.post_with(&uri, &headers, payload).await;
    assert_eq!(replay.headers["idempotent-replayed"], "true");
    assert_eq!(replay.body, first.body);

    let reused = app
        .post_with(
            &uri,
            &headers,
            json!({ "scope_type": "user", "scope_id": "user-2" }),
        )
        .await;
    assert_eq!(reused.status, StatusCode::CONFLICT);
    assert_eq!(reused.error_code(), "conflict");
}

#[tokio::test]
async fn test_callback_exchanges_code_and_gates_capabilities() {
    let server = MockServer::start().await;
    mock_code_exchange(&server, "gh-code-1").await;
    let app = TestApp::with_config(github_config(&server)).await;

    let connected = connect(&app, "user-1", "gh-code-1").await;
    assert_eq!(connected["connection"]["provider_id"], "github");
    assert_eq!(connected["connection"]["external_account_id"], "octocat");
    assert_eq!(connected["credential"]["version"], 1);
    assert_eq!(connected["credential"]["refreshable"], true);
    assert!(connected["credential"]["expires_at"].is_string());
    let mut granted = strings(&connected["grants"]["granted_grants"]);
    granted.sort();
    assert_eq!(granted, vec!["read:org", "repo"]);
    // The sealed token never leaves the service.
    assert!(!connected.to_string().contains("gho_first"));

    let read = app
        .post(
            &format!("{SERVICES}/capabilities/github/repo.read/invoke"),
            json!({ "scope_type": "user", "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK, "{}", read.text());
    assert_eq!(read.json()["allowed"], true);

    let write = app
        .post(
            &format!("{SERVICES}/capabilities/github/issues.write/invoke"),
            json!({ "scope_type": "user", "scope_id": "user-1" }),
        )
        .await;
    assert_eq!(write.status, StatusCode::FORBIDDEN);
    assert_eq!(write.error_code(), "missing_permissions");
    assert_eq!(
        write.json()["error"]["details"]["missing_grants"],
        json!(["write:discussion"])
    );
}

#[tokio::test]
async fn test_refresh_rotates_credential_through_token_endpoint() {
    let server = MockServer::start().await;
    mock_code_exchange(&server, "gh-code-2").await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=ghr_first"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_second",
            "token_type": "bearer",
            "expires_in": 28800,
            "scope": "repo,read:org"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::with_config(github_config(&server)).await;
    let connected = connect(&app, "user-1", "gh-code-2").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap();

    let refreshed = app
        .post(
            &format!("{SERVICES}/connections/{connection_id}/refresh"),
            json!({}),
        )
        .await;

    assert_eq!(refreshed.status, StatusCode::OK, "{}", refreshed.text());
    assert_eq!(refreshed.json()["credential"]["version"], 2);
    // The provider kept the previous refresh token.
    assert_eq!(refreshed.json()["credential"]["refreshable"], true);
    assert_eq!(refreshed.json()["connection"]["status"], "active");
}

#[tokio::test]
async fn test_rate_limited_refresh_degrades_and_records_bucket() {
    let server = MockServer::start().await;
    mock_code_exchange(&server, "gh-code-3").await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "42"))
        .mount(&server)
        .await;
    let app = TestApp::with_config(github_config(&server)).await;
    let connected = connect(&app, "user-1", "gh-code-3").await;
    let connection_id = connected["connection"]["id"].as_str().unwrap();

    let refreshed = app
        .post(
            &format!("{SERVICES}/connections/{connection_id}/refresh"),
            json!({}),
        )
        .await;
    assert_eq!(refreshed.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(refreshed.error_code(), "rate_limited");
    assert_eq!(refreshed.headers["retry-after"], "42");
    assert_eq!(refreshed.json()["error"]["retryable"], true);

    let detail = app
        .get(&format!("{SERVICES}/connections/{connection_id}"))
        .await
        .json();
    assert_eq!(detail["connection"]["status"], "degraded");
    assert!(detail["connection"]["last_error"].is_string());

    let buckets = app
        .get(&format!("{SERVICES}/rate-limits?provider_id=github"))
        .await
        .json();
    assert_eq!(buckets["total"], 1);
    assert_eq!(buckets["items"][0]["bucket_key"], "refresh");
    assert_eq!(buckets["items"][0]["retry_after"], 42);
}

#[tokio::test]
async fn test_token_endpoint_failures_map_to_error_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=expired"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "bad_verification_code",
            "error_description": "The code passed is incorrect or expired."
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=flaky"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let app = TestApp::with_config(github_config(&server)).await;

    let state = begin(&app, "user-1").await;
    let rejected = app
        .get(&format!(
            "{SERVICES}/connections/github/callback?code=expired&state={state}&scope_id=user-1"
        ))
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    assert_eq!(rejected.error_code(), "unauthorized");

    let unavailable = app
        .get(&format!(
            "{SERVICES}/connections/github/callback?code=flaky&state={state}&scope_id=user-1"
        ))
        .await;
    assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(unavailable.error_code(), "provider_unavailable");
    assert_eq!(unavailable.json()["error"]["retryable"], true);

    let listed = app
        .get(&format!("{SERVICES}/connections?provider_id=github"))
        .await;
    assert_eq!(listed.json()["total"], 0);
}

#[tokio::test]
async fn test_pack_without_client_credentials_is_not_registered() {
    let mut config = test_config();
    config.extensions.enabled_provider_packs = vec!["google".to_string()];
    let app = TestApp::with_config(config).await;

    let begin = app
        .post(
            &format!("{SERVICES}/connections/google/begin"),
            json!({ "scope_id": "user-1" }),
        )
        .await;

    assert_eq!(begin.status, StatusCode::NOT_FOUND);
    assert_eq!(begin.error_code(), "not_found");
}
