use crate::{
    models::object_key::InvalidFilename,
    services::{blob_store::StorageError, sas::SasError},
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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
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

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ContainerNotFound(_) | StorageError::ObjectNotFound { .. } => {
                AppError::not_found(err.to_string())
            }
            StorageError::InvalidContainerName { .. } | StorageError::InvalidObjectKey => {
                AppError::bad_request(err.to_string())
            }
            StorageError::Timeout { .. } => {
                AppError::new(StatusCode::GATEWAY_TIMEOUT, err.to_string())
            }
            // Backend internals stay in the logs.
            StorageError::Sqlx(_) | StorageError::Io(_) => AppError::internal("storage failure"),
        }
    }
}

impl From<SasError> for AppError {
    fn from(err: SasError) -> Self {
        match err {
            SasError::ExpiryNotInFuture { .. } => AppError::bad_request(err.to_string()),
            SasError::InvalidEndpoint | SasError::InvalidAccountKey => {
                AppError::internal(err.to_string())
            }
            _ => AppError::forbidden(err.to_string()),
        }
    }
}

impl From<InvalidFilename> for AppError {
    fn from(err: InvalidFilename) -> Self {
        AppError::bad_request(err.to_string())
    }
}
