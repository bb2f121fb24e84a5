use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keel_core::error::{ErrorCategory, KeelError};

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

/// Private sentinel carrying an explicit 409 through the `anyhow::Error` chain.
#[derive(Debug)]
struct ConflictError(String);

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

impl AppError {
    /// Construct a 400 Bad Request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(KeelError::InvalidRequest(msg.into()).into())
    }

    /// Construct a 409 Conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(ConflictError(msg.into()).into())
    }
}

fn status_for(e: &KeelError) -> StatusCode {
    match e {
        KeelError::AttemptNotFound(_) | KeelError::UnknownTarget(_) => StatusCode::NOT_FOUND,
        KeelError::ApprovalRejected(_) => StatusCode::FORBIDDEN,
        KeelError::AuditUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => match e.category() {
            ErrorCategory::Input => StatusCode::BAD_REQUEST,
            ErrorCategory::Policy => StatusCode::CONFLICT,
            ErrorCategory::Resource => StatusCode::BAD_GATEWAY,
            ErrorCategory::Verification => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(c) = self.0.downcast_ref::<ConflictError>() {
            let body = serde_json::json!({ "error": c.0.clone() });
            return (StatusCode::CONFLICT, axum::Json(body)).into_response();
        }

        let status = self
            .0
            .downcast_ref::<KeelError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
