//! # Tests for Handlers
//!
//! Unit tests for the stateless handlers and the body extractors.

use axum::{
    body::Body,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

use crate::handlers::{JsonBody, OptionalJson, healthz, root};
use crate::models::ServiceInfo;
use crate::worker::QueuedJob;

#[derive(Debug, Default, Deserialize, PartialEq)]
struct Probe {
    #[serde(default)]
    name: String,
}

fn request(body: &'static str) -> Request {
    Request::builder()
        .method("POST")
        .uri("/probe")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(info) = root().await;
    let expected = ServiceInfo::default();
    assert_eq!(info.service, "services-plane");
    assert_eq!(info.version, expected.version);
}

#[tokio::test]
async fn test_healthz_reports_ok() {
    let Json(body) = healthz().await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_json_body_parses_payload() {
    let JsonBody(probe) = JsonBody::<Probe>::from_request(request(r#"{"name":"a"}"#), &())
        .await
        .unwrap();
    assert_eq!(probe.name, "a");
}

#[tokio::test]
async fn test_json_body_requires_content() {
    let err = JsonBody::<Probe>::from_request(request("  "), &())
        .await
        .err()
        .unwrap();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(&*err.code, "validation_error");
}

#[tokio::test]
async fn test_json_body_rejects_malformed_json_with_envelope_code() {
    let err = JsonBody::<Probe>::from_request(request("{not json"), &())
        .await
        .err()
        .unwrap();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert!(err.message.contains("invalid JSON body"));
}

#[tokio::test]
async fn test_optional_json_defaults_on_empty_body() {
    let OptionalJson(probe) = OptionalJson::<Probe>::from_request(request(""), &())
        .await
        .unwrap();
    assert_eq!(probe, Probe::default());
}

#[tokio::test]
async fn test_optional_json_still_rejects_bad_json() {
    let result = OptionalJson::<Probe>::from_request(request("[1,"), &()).await;
    assert!(result.is_err());
}

#[test]
fn test_accepted_uses_202() {
    let response = super::accepted(QueuedJob {
        queued: true,
        job_id: "job_1".into(),
        message_id: "msg_1".into(),
    });
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}
