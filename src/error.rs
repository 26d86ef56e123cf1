use crate::engines::BackendKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy shared by backend attempts and the engine result.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[error("invalid request")]
    InvalidRequest,

    #[error("unsupported conversion")]
    Unsupported,

    #[error("input is malformed for the declared format")]
    InvalidInput,

    #[error("backend unavailable")]
    BackendUnavailable,

    #[error("deadline exceeded")]
    Timeout,

    #[error("remote API rejected the credentials")]
    Unauthorized,

    #[error("remote API quota exceeded")]
    QuotaExceeded,

    #[error("transient network failure")]
    Transient,

    #[error("all backends exhausted")]
    AllBackendsExhausted,

    #[error("conversion cancelled")]
    Cancelled,

    #[error("internal error")]
    Internal,
}

impl FailureKind {
    /// Failures that disable a backend for the rest of the process lifetime.
    pub fn disables_backend(self) -> bool {
        matches!(self, FailureKind::Unauthorized | FailureKind::QuotaExceeded)
    }
}

/// Failure returned by a single backend attempt.
///
/// `message` is diagnostic text for logs and the attempt log; callers of the
/// engine only ever see the `kind`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: FailureKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::BackendUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::unavailable(format!("I/O error: {}", e))
    }
}

/// One entry of a request's attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct BackendAttempt {
    pub backend: BackendKind,
    /// Offset from the start of the request.
    #[serde(rename = "started_at_ms", serialize_with = "as_millis")]
    pub started_at: Duration,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    /// `None` when the attempt produced output.
    pub failure: Option<FailureKind>,
    #[serde(skip)]
    pub message: Option<String>,
}

impl BackendAttempt {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Structured failure of a whole conversion.
#[derive(Error, Debug, Clone)]
#[error("conversion failed: {kind} ({} attempt(s))", attempts.len())]
pub struct ConversionError {
    pub kind: FailureKind,
    pub attempts: Vec<BackendAttempt>,
}

impl ConversionError {
    pub fn rejected(kind: FailureKind) -> Self {
        Self {
            kind,
            attempts: Vec::new(),
        }
    }
}

/// Errors surfaced by the HTTP layer.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("No file provided")]
    NoFileProvided,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NoFileProvided | AppError::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.to_string(), "kind": FailureKind::InvalidRequest }),
            ),
            AppError::Conversion(err) => {
                let status = match err.kind {
                    FailureKind::InvalidRequest | FailureKind::Unsupported => {
                        StatusCode::BAD_REQUEST
                    }
                    FailureKind::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
                    FailureKind::Cancelled | FailureKind::Timeout => StatusCode::REQUEST_TIMEOUT,
                    FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                (
                    status,
                    json!({
                        "error": err.kind.to_string(),
                        "kind": err.kind,
                        "attempts": err.attempts,
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_disable_backend() {
        assert!(FailureKind::Unauthorized.disables_backend());
        assert!(FailureKind::QuotaExceeded.disables_backend());
        assert!(!FailureKind::Transient.disables_backend());
        assert!(!FailureKind::Timeout.disables_backend());
    }

    #[test]
    fn attempt_log_hides_backend_messages() {
        let attempt = BackendAttempt {
            backend: BackendKind::Office,
            started_at: Duration::from_millis(5),
            elapsed: Duration::from_millis(1200),
            failure: Some(FailureKind::BackendUnavailable),
            message: Some("soffice: exit status 81".into()),
        };
        let value = serde_json::to_value(&attempt).unwrap();
        assert_eq!(value["backend"], "office");
        assert_eq!(value["elapsed_ms"], 1200);
        assert_eq!(value["failure"], "backend_unavailable");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn conversion_error_display_counts_attempts() {
        let err = ConversionError::rejected(FailureKind::Unsupported);
        assert_eq!(err.to_string(), "conversion failed: unsupported conversion (0 attempt(s))");
    }
}
