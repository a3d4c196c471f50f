use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use xchange_db::StoreError;
use xchange_types::api::ErrorBody;

/// Failure taxonomy of the messaging core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    #[error("{0}")]
    NotFound(String),

    #[error("not a participant of this conversation")]
    Forbidden,

    #[error("{0}")]
    InvalidArgument(String),

    /// Resolved internally by get-or-create; only surfaces from raw store use.
    #[error("conversation already exists")]
    Conflict,

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for MessagingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => Self::Conflict,
            StoreError::NotFound(what) => Self::NotFound(format!("{} not found", what)),
            StoreError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            other => {
                error!("Store failure: {}", other);
                Self::Unavailable(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Messaging(MessagingError::InvalidArgument(rejection.body_text()))
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Messaging(err) => match err {
                MessagingError::NotFound(_) => StatusCode::NOT_FOUND,
                MessagingError::Forbidden => StatusCode::FORBIDDEN,
                MessagingError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                MessagingError::Conflict => StatusCode::CONFLICT,
                MessagingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        };

        // Backend details stay in the logs.
        let message = match &self {
            Self::Messaging(MessagingError::Unavailable(_)) => {
                "service temporarily unavailable, retry later".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { message })).into_response()
    }
}
