//! # Error Handling
//!
//! Domain errors carry an [`ErrorCategory`]; the HTTP layer maps them onto a
//! stable `{ "error": { code, message, details, retryable, request_id } }`
//! envelope.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

/// Error taxonomy shared by the facade, stores and processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Auth,
    Authz,
    NotFound,
    Conflict,
    RateLimit,
    Operation,
    Internal,
}

/// Categorized error returned by services and stores.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub category: ErrorCategory,
    /// Optional numeric status hint (e.g. 503 for provider outages).
    pub code: Option<u16>,
    pub message: String,
    pub details: Option<Value>,
    pub retry_after: Option<u64>,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: None,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authz, message)
    }

    /// Authorization failure carrying the grants that were missing.
    pub fn missing_permissions(missing_grants: Vec<String>) -> Self {
        Self::new(
            ErrorCategory::Authz,
            format!("missing required grants: {}", missing_grants.join(", ")),
        )
        .with_details(json!({ "missing_grants": missing_grants }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        let mut error = Self::new(ErrorCategory::RateLimit, message);
        error.retry_after = retry_after;
        error
    }

    /// Operation failure caused by an unavailable upstream provider.
    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Operation, message).with_code(503)
    }

    /// Deadline exceeded or cancelled while waiting on a dependency.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::provider_unavailable(message)
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Operation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    /// Build an error from an HTTP status reported by a handler or upstream.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let category = match status.as_u16() {
            400 | 422 => ErrorCategory::Validation,
            401 => ErrorCategory::Auth,
            403 => ErrorCategory::Authz,
            404 => ErrorCategory::NotFound,
            409 => ErrorCategory::Conflict,
            429 => ErrorCategory::RateLimit,
            _ => ErrorCategory::Internal,
        };
        Self::new(category, message).with_code(status.as_u16())
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the failure is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        map_error(self).retryable
    }
}

/// Error body emitted by every failing route.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip)]
    pub status: StatusCode,
    /// Stable error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<Value>>,
    /// Whether the client may retry the same request
    pub retryable: bool,
    /// Echo of the caller's `X-Request-ID`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Box<str>>,
    /// Suggested retry delay in seconds, emitted as `Retry-After`
    #[serde(skip_serializing)]
    pub retry_after: Option<u64>,
}

/// Wire wrapper: `{ "error": ApiError }`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

impl ApiError {
    /// Create a new API error; retryability follows the status (429 and 5xx).
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            request_id: telemetry::current_request_id().map(String::into_boxed_str),
            retry_after: None,
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// Map a categorized error onto its HTTP status, stable code and retryability.
pub fn map_error(error: &ServiceError) -> ApiError {
    let (status, code) = match error.category {
        ErrorCategory::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
        ErrorCategory::Auth => (StatusCode::UNAUTHORIZED, "unauthorized"),
        ErrorCategory::Authz if has_missing_grants(error.details.as_ref()) => {
            (StatusCode::FORBIDDEN, "missing_permissions")
        }
        ErrorCategory::Authz => (StatusCode::FORBIDDEN, "forbidden"),
        ErrorCategory::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorCategory::Conflict => (StatusCode::CONFLICT, "conflict"),
        ErrorCategory::RateLimit => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        ErrorCategory::Operation if is_provider_unavailable(error) => {
            (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
        }
        ErrorCategory::Operation => (StatusCode::CONFLICT, "conflict"),
        ErrorCategory::Internal => {
            let status = error
                .code
                .filter(|code| *code >= 500)
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, "internal_error")
        }
    };

    let mut api = ApiError::new(status, code, error.message.clone());
    api.retryable = matches!(error.category, ErrorCategory::RateLimit)
        || code == "provider_unavailable"
        || status.is_server_error();
    if let Some(details) = &error.details {
        api = api.with_details(details.clone());
    }
    if let Some(retry_after) = error.retry_after {
        api = api.with_retry_after(retry_after);
    }
    api
}

fn has_missing_grants(details: Option<&Value>) -> bool {
    details
        .and_then(|details| details.get("missing_grants"))
        .is_some_and(|grants| !grants.is_null())
}

fn is_provider_unavailable(error: &ServiceError) -> bool {
    match error.code {
        Some(code) => code == 503,
        None => error.message.to_ascii_lowercase().contains("provider"),
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let api = map_error(&error);
        if api.status.is_server_error() {
            tracing::error!(code = %api.code, error = %error.message, "Request failed");
        } else {
            tracing::debug!(code = %api.code, error = %error.message, "Request rejected");
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        let status = self.status;
        (status, headers, axum::Json(ErrorEnvelope { error: self })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);
        map_error(&ServiceError::internal("An internal error occurred"))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };
        map_error(&ServiceError::validation(message))
    }
}

impl From<sea_orm::DbErr> for ServiceError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::conflict("Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => {
                Self::not_found(format!("Record not found: {}", record))
            }
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::internal("Database service unavailable").with_code(503)
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::internal("Database error occurred")
            }
        }
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        ServiceError::from(error).into()
    }
}

fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(error: ApiError) -> Value {
        serde_json::to_value(ErrorEnvelope { error }).unwrap()
    }

    #[test]
    fn maps_every_category() {
        let cases = vec![
            (ServiceError::validation("bad"), 400, "validation_error", false),
            (ServiceError::unauthorized("who"), 401, "unauthorized", false),
            (
                ServiceError::missing_permissions(vec!["repo".into()]),
                403,
                "missing_permissions",
                false,
            ),
            (ServiceError::forbidden("no"), 403, "forbidden", false),
            (ServiceError::not_found("gone"), 404, "not_found", false),
            (ServiceError::conflict("dup"), 409, "conflict", false),
            (
                ServiceError::rate_limited("slow down", Some(30)),
                429,
                "rate_limited",
                true,
            ),
            (
                ServiceError::provider_unavailable("down"),
                503,
                "provider_unavailable",
                true,
            ),
            (
                ServiceError::operation("provider timed out"),
                503,
                "provider_unavailable",
                true,
            ),
            (ServiceError::operation("state mismatch"), 409, "conflict", false),
            (ServiceError::internal("boom"), 500, "internal_error", true),
            (
                ServiceError::internal("bad gateway").with_code(502),
                502,
                "internal_error",
                true,
            ),
        ];

        for (error, status, code, retryable) in cases {
            let api = map_error(&error);
            assert_eq!(api.status.as_u16(), status, "status for {code}");
            assert_eq!(&*api.code, code);
            assert_eq!(api.retryable, retryable, "retryable for {code}");
        }
    }

    #[test]
    fn explicit_code_wins_over_text_heuristic() {
        let error = ServiceError::operation("provider returned stale data").with_code(409);
        let api = map_error(&error);
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(&*api.code, "conflict");
    }

    #[test]
    fn envelope_shape_contains_code_and_retryable() {
        let body = envelope(map_error(&ServiceError::forbidden("denied")));
        assert_eq!(body["error"]["code"], "forbidden");
        assert_eq!(body["error"]["retryable"], false);
        assert_eq!(body["error"]["message"], "denied");
        assert!(body["error"].get("request_id").is_none());
    }

    #[tokio::test]
    async fn request_id_is_echoed_from_context() {
        let api = telemetry::with_request_context(
            telemetry::RequestContext {
                request_id: Some("req-7".to_string()),
            },
            async { map_error(&ServiceError::not_found("missing")) },
        )
        .await;
        assert_eq!(envelope(api)["error"]["request_id"], "req-7");
    }

    #[test]
    fn missing_permissions_carry_grants() {
        let api = map_error(&ServiceError::missing_permissions(vec![
            "repo".to_string(),
            "read:org".to_string(),
        ]));
        let body = envelope(api);
        assert_eq!(body["error"]["details"]["missing_grants"][1], "read:org");
    }

    #[test]
    fn retry_after_header_is_emitted() {
        let response = map_error(&ServiceError::rate_limited("slow", Some(60))).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn database_not_found_maps_to_404() {
        let error: ServiceError = sea_orm::DbErr::RecordNotFound("conn_1".to_string()).into();
        assert_eq!(error.category, ErrorCategory::NotFound);
        let api: ApiError = error.into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn from_status_preserves_server_codes() {
        let api = map_error(&ServiceError::from_status(
            StatusCode::BAD_GATEWAY,
            "handler failed",
        ));
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(&*api.code, "internal_error");
        assert!(api.retryable);
    }
}
