use crate::auth::AuthError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use jexec_common::types::{ErrorBody, ValidationError};
use tracing::{error, warn};

/// Every way a request can be rejected by the service itself. Failures of
/// the submitted program are never an `ApiError`; they are result data.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job '{0}' not found")]
    UnknownJobId(String),
    #[error("submission queue is full, retry later")]
    QueueFull,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Validation(ValidationError::BodyTooLarge) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            ApiError::Store(StoreError::NotFound(_)) | ApiError::UnknownJobId(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Store(StoreError::NotReady { .. }) => (StatusCode::CONFLICT, "not_ready"),
            ApiError::Store(StoreError::InvalidTransition(_)) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            ApiError::Store(StoreError::Backend(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            ApiError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            ApiError::Store(StoreError::Backend(detail)) => {
                error!(error = %detail, "Job store failure");
                "internal error".to_string()
            }
            ApiError::Auth(reason) => {
                warn!(reason = %reason, "Rejected unauthenticated request");
                self.to_string()
            }
            _ => self.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}
