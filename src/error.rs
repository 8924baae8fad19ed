//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`IntercomError`]: failures of the relay core (middleware unreachable,
//!   transcoder exit status, stream channel trouble). Built with `thiserror`.
//! - [`AppError`]: what HTTP clients see. Every variant renders the same JSON
//!   envelope so the UI layer can show one descriptive message.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "upstream_error",
//!     "message": "Failed to send audio file",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the transcoder, control client, stream channels and
/// session coordinator.
///
/// ## Propagation:
/// Only `Connect` from a connectivity test, `InputNotFound`, `Channel` and
/// `SessionInactive` reach callers. Protocol and conversion failures are
/// logged and folded into a `false` result by the coordinator.
#[derive(Debug, Error)]
pub enum IntercomError {
    /// Middleware unreachable or the request timed out
    #[error("Cannot connect to server at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// External conversion tool exited with a nonzero status
    #[error("Audio conversion failed: {0}")]
    Conversion(String),

    /// Middleware answered with a non-2xx status
    #[error("{operation} failed with HTTP {status}: {body}")]
    Protocol {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Caller-supplied audio file is missing or unreadable
    #[error("Audio file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// A streaming channel could not be opened
    #[error("Stream channel {url} unavailable: {reason}")]
    Channel { url: String, reason: String },

    /// Audio relay requested while no talk session is active
    #[error("No active talk session")]
    SessionInactive,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IntercomResult<T> = Result<T, IntercomError>;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Unknown device or resource (404 errors)
/// - **Conflict**: Operation not valid in the current session state (409)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Upstream**: The device middleware rejected or failed the call (502)
/// - **Unavailable**: The device middleware cannot be reached (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ConfigError(String),
    ValidationError(String),
    Upstream(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl AppError {
    /// HTTP status, machine-readable type, and message for this error.
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg.as_str()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.as_str()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Map core failures onto user-facing HTTP errors.
///
/// The message is the core error's own text, which already names the
/// failing operation ("Cannot connect to server at ...").
impl From<IntercomError> for AppError {
    fn from(err: IntercomError) -> Self {
        match err {
            IntercomError::Connect { .. } => AppError::Unavailable(err.to_string()),
            IntercomError::InputNotFound(_) => AppError::BadRequest(err.to_string()),
            IntercomError::SessionInactive => AppError::Conflict(err.to_string()),
            IntercomError::Conversion(_)
            | IntercomError::Protocol { .. }
            | IntercomError::Channel { .. } => AppError::Upstream(err.to_string()),
            IntercomError::Io(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
