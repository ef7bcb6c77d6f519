use crate::services::drive_client::DriveError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Failure taxonomy of the upload pipeline.
///
/// Only `TransientTransport` is retried by the retry controller; everything
/// else surfaces to the caller as-is.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid byte range: {0}")]
    InvalidRange(String),
    #[error("invalid upload session handle")]
    InvalidHandle,
    #[error("{0}")]
    NotFound(String),
    #[error("upload limit reached, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("could not start upload session: {0}")]
    SessionCreation(String),
    #[error("transient transport failure: {0}")]
    TransientTransport(String),
    #[error("storage backend returned {status}: {body}")]
    Protocol { status: u16, body: String },
    #[error("upload could not be confirmed: {0}")]
    Reconciliation(String),
    #[error("upload cancelled")]
    Cancelled,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Whether the retry controller may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::TransientTransport(_))
    }
}

impl From<DriveError> for UploadError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::Timeout | DriveError::Network(_) => {
                UploadError::TransientTransport(err.to_string())
            }
            DriveError::Status { status, body } if status == 429 || status >= 500 => {
                UploadError::TransientTransport(format!("backend returned {status}: {body}"))
            }
            DriveError::Status { status, body } => UploadError::Protocol { status, body },
            DriveError::Decode { status, reason } => UploadError::Protocol {
                status,
                body: format!("malformed response: {reason}"),
            },
            DriveError::MissingHeader(name) => UploadError::Protocol {
                status: 0,
                body: format!("missing `{name}` header"),
            },
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication required")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(msg) => AppError::bad_request(msg),
            err @ (UploadError::InvalidRange(_)
            | UploadError::InvalidHandle
            | UploadError::Cancelled) => AppError::bad_request(err.to_string()),
            UploadError::NotFound(msg) => AppError::new(StatusCode::NOT_FOUND, msg),
            UploadError::RateLimited { retry_after } => AppError {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: "upload limit reached, retry later".into(),
                retry_after: Some(retry_after),
            },
            UploadError::SessionCreation(reason) => {
                tracing::warn!("session creation failed: {}", reason);
                AppError::new(StatusCode::BAD_GATEWAY, "could not start upload session")
            }
            UploadError::TransientTransport(reason) => {
                tracing::warn!("transport failure surfaced to client: {}", reason);
                AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "network error, please retry",
                )
            }
            UploadError::Protocol { status, body } => {
                tracing::warn!("backend protocol error {}: {}", status, body);
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    format!("storage backend rejected the upload: {status}"),
                )
            }
            UploadError::Reconciliation(reason) => {
                tracing::warn!("reconciliation failed: {}", reason);
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "upload succeeded but could not confirm, check your files list",
                )
            }
            UploadError::Database(err) => AppError::internal(err.to_string()),
            UploadError::Io(err) => AppError::internal(err.to_string()),
        }
    }
}
