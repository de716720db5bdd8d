//! Test utilities shared by the integration suites.
//!
//! Every suite gets a fresh in-memory SQLite database with migrations applied
//! and drives the real router through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use anyhow::Result;
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use services_plane::{
    config::AppConfig,
    db,
    server::{AppState, AppStateBuilder, create_app},
};
use tower::ServiceExt;

/// Mount point of the services surface under the default admin base.
pub const SERVICES: &str = "/admin/api/services";
/// Mount point of the workflow surface.
pub const WORKFLOW: &str = "/workflow/services";

/// Developer-profile configuration over an in-memory database.
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    }
}

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = db::init_pool(&test_config()).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Router plus the state behind it, for assertions on stores and runtimes.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        Self::build(config, |builder| builder).await
    }

    /// Build with host overrides applied to the state builder.
    pub async fn build(
        config: AppConfig,
        customize: impl FnOnce(AppStateBuilder) -> AppStateBuilder,
    ) -> Self {
        let db = setup_test_db().await.expect("test database");
        let state = customize(AppStateBuilder::new(config, db))
            .build()
            .expect("application state");
        Self {
            router: create_app(state.clone()),
            state,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(request(Method::GET, uri, &[], None)).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.send(request(Method::POST, uri, &[], Some(body))).await
    }

    pub async fn post_with(&self, uri: &str, headers: &[(&str, &str)], body: Value) -> TestResponse {
        self.send(request(Method::POST, uri, headers, Some(body)))
            .await
    }

    /// Post raw bytes, as providers deliver webhooks.
    pub async fn post_raw(&self, uri: &str, headers: &[(&str, &str)], body: &[u8]) -> TestResponse {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body.to_vec())).expect("request"))
            .await
    }

    /// Runs the example provider's begin and callback flow for a user scope
    /// and returns the callback body.
    pub async fn connect_example(&self, user: &str) -> Value {
        let begin = self
            .post(
                &format!("{SERVICES}/connections/example/begin"),
                serde_json::json!({ "scope_type": "user", "scope_id": user }),
            )
            .await;
        assert_eq!(begin.status, StatusCode::OK, "begin: {}", begin.text());
        let state = begin.json()["state"].as_str().unwrap_or_default().to_string();

        let callback = self
            .get(&format!(
                "{SERVICES}/connections/example/callback?code=code-{user}&state={state}&scope_type=user&scope_id={user}"
            ))
            .await;
        assert_eq!(callback.status, StatusCode::OK, "callback: {}", callback.text());
        callback.json()
    }
}

pub fn request(
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request")
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `error.code` of an error envelope.
    pub fn error_code(&self) -> String {
        self.json()["error"]["code"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}
