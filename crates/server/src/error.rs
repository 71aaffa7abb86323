use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced by the messaging core.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Malformed input: empty recipients, missing recipient id, half-specified media.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Recipient is offline. The message is already stored; this is feedback, not a failure.
    #[error("recipient {0} is not connected")]
    Unreachable(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{0}")]
    Unauthorized(String),
}

pub type Result<T> = core::result::Result<T, MessagingError>;

impl MessagingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MessagingError::Validation(msg.into())
    }

    /// Machine-readable code used in HTTP bodies and socket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            MessagingError::Validation(_) => "invalid_payload",
            MessagingError::NotFound(_) => "not_found",
            MessagingError::Unreachable(_) => "recipient_unreachable",
            MessagingError::Storage(_) => "internal_error",
            MessagingError::Unauthorized(_) => "unauthorized",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MessagingError::Validation(_) => StatusCode::BAD_REQUEST,
            MessagingError::NotFound(_) => StatusCode::NOT_FOUND,
            MessagingError::Unreachable(_) => StatusCode::OK,
            MessagingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MessagingError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for MessagingError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage details stay in the logs.
        let message = match &self {
            MessagingError::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for MessagingError {
    fn from(err: anyhow::Error) -> Self {
        MessagingError::Storage(format!("{:#}", err))
    }
}

impl From<std::io::Error> for MessagingError {
    fn from(err: std::io::Error) -> Self {
        MessagingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        MessagingError::Storage(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MessagingError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MessagingError::Storage("operation timed out".to_string())
    }
}
