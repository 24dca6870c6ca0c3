use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use planvault_core::protocol::{ConflictResponse, ErrorResponse};
use thiserror::Error;

/// Errors a handler can return; each maps to one HTTP status
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Compare-and-swap rejected; carries the authoritative version
    #[error("Version conflict (current version {current_version})")]
    Conflict { current_version: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Storage details stay in the log.
    fn public_message(&self) -> String {
        match self {
            AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::BadRequest(msg) => msg.clone(),
            AppError::Conflict { .. } => "Version conflict".to_string(),
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!(error = ?e, "Database error"),
            AppError::Internal(msg) => tracing::error!(%msg, "Internal error"),
            _ => {}
        }

        let status = self.status();
        let error = self.public_message();
        match self {
            AppError::Conflict { current_version } => (
                status,
                Json(ConflictResponse {
                    error,
                    current_version,
                }),
            )
                .into_response(),
            _ => (status, Json(ErrorResponse { error })).into_response(),
        }
    }
}
