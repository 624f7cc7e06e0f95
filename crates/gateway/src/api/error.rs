//! Error shaping at the HTTP boundary.
//!
//! Clients get a status code and a generic message. Policy rules, downstream
//! error text, and internal paths stay in server logs and audit records.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use amb_domain::error::Error;

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label, message) = shape(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = %status, "request rejected");
        }
        (
            status,
            Json(serde_json::json!({ "error": label, "message": message })),
        )
            .into_response()
    }
}

fn shape(err: &Error) -> (StatusCode, &'static str, String) {
    match err {
        Error::InvalidRequest(m) => (StatusCode::BAD_REQUEST, "Bad Request", m.clone()),
        Error::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "Authentication required".into(),
        ),
        Error::SessionExpired => (StatusCode::GONE, "Gone", "Session expired".into()),
        Error::Forbidden => (
            StatusCode::FORBIDDEN,
            "Forbidden",
            "Access denied".into(),
        ),
        Error::KillSwitch(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            "Service temporarily disabled".into(),
        ),
        Error::NotFound(_) => (
            StatusCode::NOT_FOUND,
            "Not Found",
            "Resource not found".into(),
        ),
        Error::ToolNotFound(_) => (
            StatusCode::NOT_FOUND,
            "Not Found",
            "Tool not found".into(),
        ),
        Error::Conflict(_) => (
            StatusCode::CONFLICT,
            "Conflict",
            "Resource is in use".into(),
        ),
        Error::ReloadConflict => (
            StatusCode::CONFLICT,
            "Conflict",
            "A reload is already in progress".into(),
        ),
        Error::PoolExhausted => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            "Capacity exhausted".into(),
        ),
        Error::UserQuotaExceeded => (
            StatusCode::TOO_MANY_REQUESTS,
            "Too Many Requests",
            "Per-user capacity exhausted".into(),
        ),
        Error::RateLimited(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            "Too Many Requests",
            "Rate limit exceeded".into(),
        ),
        Error::ProfileCycle => (
            StatusCode::BAD_REQUEST,
            "Bad Request",
            "Profile inheritance cycle detected".into(),
        ),
        Error::ProfileDepthExceeded => (
            StatusCode::BAD_REQUEST,
            "Bad Request",
            "Profile inheritance depth exceeded".into(),
        ),
        Error::DownstreamTimeout(_) | Error::Downstream(_) | Error::ConnectionNotReady(_) => (
            StatusCode::BAD_GATEWAY,
            "Bad Gateway",
            "Tool invocation failed".into(),
        ),
        Error::AuditBacklog => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            "Service temporarily unavailable".into(),
        ),
        Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            "Internal error".into(),
        ),
    }
}
