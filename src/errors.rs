use crate::services::{
    image_store::{ErrorClass, StorageError},
    ingestion::Rejection,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, kind and message.
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "ValidationError", msg)
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
            "kind": self.kind,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let (status, kind) = match &err {
            StorageError::InvalidIdentifier(_) => (StatusCode::BAD_REQUEST, "InvalidIdentifier"),
            StorageError::Rejected(Rejection::SizeExceeded { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "SizeExceeded")
            }
            StorageError::Rejected(Rejection::UnsupportedMediaType { .. }) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UnsupportedMediaType")
            }
            StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            StorageError::AlreadyExists(_) => (StatusCode::CONFLICT, "AlreadyExists"),
            StorageError::UpstreamReadFailure(_) => (StatusCode::BAD_REQUEST, "UpstreamReadFailure"),
            StorageError::UploadFailed(_) | StorageError::IncompleteUpload { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UploadFailed")
            }
            StorageError::DeleteFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeleteFailed"),
            StorageError::StorageReadFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "StorageReadFailure")
            }
            StorageError::StreamingReadFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "StreamingReadFailure")
            }
        };

        if err.class() == ErrorClass::Storage {
            tracing::error!("storage failure: {}", err);
        }
        AppError::new(status, kind, err.to_string())
    }
}
