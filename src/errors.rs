use crate::services::{
    property_schema::FieldErrors,
    session_engine::{EngineError, GENERIC_ERROR},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// HTTP form of a failed operation: the `{ok:false, error}` envelope plus a status.
///
/// Expected failures keep HTTP 200 so clients only inspect `ok`. Unknown ids map
/// to 404 and internal failures to 500 with a fixed message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub field_errors: Option<FieldErrors>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            field_errors: None,
        }
    }

    /// Expected failure reported with HTTP 200.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, msg)
    }

    /// Shortcut for a 500 with the generic message.
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

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
        let body = match self.field_errors {
            Some(fields) => json!({
                "ok": false,
                "error": self.message,
                "field_errors": fields,
            }),
            None => json!({
                "ok": false,
                "error": self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        if err.is_internal() {
            tracing::error!(error = %err, details = ?err, "internal error");
            return AppError::internal();
        }
        if err.is_not_found() {
            return AppError::not_found(err.to_string());
        }
        match err {
            EngineError::VirusFound { .. } => AppError::rejected(err.to_string()),
            EngineError::InvalidProperties(fields) => {
                let mut app = AppError::rejected("Please correct the errors below.");
                app.field_errors = Some(fields);
                app
            }
            other => {
                tracing::debug!("request rejected: {}", other);
                AppError::rejected(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {:#}", err);
        AppError::internal()
    }
}
