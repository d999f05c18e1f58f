use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Structured JSON error body returned by all API error responses.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Unified application error type for the query/notification surface (§6).
///
/// Implements [`IntoResponse`] so handlers can return `Result<T, AppError>`
/// and axum converts errors into structured JSON responses with the
/// appropriate HTTP status code. No auth/session machinery is in scope here,
/// so the taxonomy is narrower than a full dashboard backend's.
pub enum AppError {
    /// Resource not found (404).
    NotFound,
    /// Input validation failed (400) — e.g. an unparsable filter value.
    Validation(String),
    /// Database query failed (500).
    Database(sqlx::Error),
    /// Internal server error (500).
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "Resource not found".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_error",
                e.to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        (status, Json(ApiErrorBody { code, message })).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Database(other),
        }
    }
}
