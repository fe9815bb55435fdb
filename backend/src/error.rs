use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::storage::StorageError;

/// Errors surfaced to HTTP clients. Internal causes are logged by the handler;
/// the body only carries a short human-readable message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("Uploaded file is not an image")]
    NotAnImage,
    #[error("Invalid image file: {0}")]
    InvalidImage(String),
    #[error("Uploaded file exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("Malformed multipart payload: {0}")]
    Payload(String),
    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Detection failed")]
    DetectionFailed,
    #[error("Result image not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn body(&self) -> ErrorResponse {
        match self {
            ApiError::DetectionFailed => ErrorResponse {
                error: self.to_string(),
                message: Some("The model did not return valid results".to_string()),
            },
            ApiError::Storage(_) => ErrorResponse {
                error: "Failed to store file".to_string(),
                message: None,
            },
            other => ErrorResponse {
                error: other.to_string(),
                message: None,
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingFile
            | ApiError::NotAnImage
            | ApiError::InvalidImage(_)
            | ApiError::PayloadTooLarge { .. }
            | ApiError::Payload(_)
            | ApiError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::DetectionFailed | ApiError::Storage(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            log::error!("Request failed: {}", self);
        }
        HttpResponse::build(self.status_code()).json(self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_bad_requests() {
        assert_eq!(ApiError::NotAnImage.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::InvalidParameter {
                name: "conf",
                reason: "must be between 0 and 1".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn detection_failure_carries_message() {
        let body = ApiError::DetectionFailed.body();
        assert_eq!(body.error, "Detection failed");
        assert_eq!(
            body.message.as_deref(),
            Some("The model did not return valid results")
        );
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let err = ApiError::from(StorageError::InvalidName("../etc/passwd".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body().error, "Failed to store file");
    }
}
