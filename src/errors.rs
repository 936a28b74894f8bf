use crate::services::{
    download_service::DownloadError, identity::IdentityError, ingest_service::IngestError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
///
/// Messages are meant for clients: they never carry internal object ids.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
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

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "internal error");
        AppError::internal("internal error")
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthorized => AppError::new(StatusCode::UNAUTHORIZED, err.to_string()),
            IdentityError::InvalidEntry(_) => {
                tracing::error!(error = %err, "identity directory misconfigured");
                AppError::internal("internal error")
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Forbidden(_) => {
                AppError::new(StatusCode::FORBIDDEN, "not entitled to submit conversions")
            }
            IngestError::InvalidContentType(_) => {
                AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, err.to_string())
            }
            IngestError::UploadAborted(_) => AppError::bad_request("upload aborted"),
            IngestError::IntegrityMismatch => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            IngestError::StorageWriteFailed(_) => {
                tracing::error!(error = %err, "upload could not be stored");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "storage write failed")
            }
            IngestError::Ledger(_) => {
                tracing::error!(error = %err, "job could not be queued");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "storage write failed")
            }
        }
    }
}

impl From<DownloadError> for AppError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::NotFound => AppError::new(StatusCode::NOT_FOUND, err.to_string()),
            DownloadError::NotReady(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            DownloadError::Failed(class) => {
                let message = match class {
                    Some(class) => format!("conversion failed: {}", class),
                    None => "conversion failed".to_string(),
                };
                AppError::new(StatusCode::GONE, message)
            }
            DownloadError::Unavailable(_) => {
                tracing::error!(error = %err, "audio unavailable");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "audio temporarily unavailable")
            }
            DownloadError::Ledger(_) => {
                tracing::error!(error = %err, "ledger lookup failed");
                AppError::internal("internal error")
            }
        }
    }
}
