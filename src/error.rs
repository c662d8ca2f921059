//! # Error Handling
//!
//! Two error families live here:
//!
//! - **`AppError`**: errors surfaced through the HTTP API (health, config view,
//!   WebSocket upgrade). They are converted into JSON responses.
//! - **`RelayError`**: the relay's own taxonomy. These never reach an HTTP
//!   client directly; the session relay decides whether they end a session.
//!
//! ## Relay Error Policy:
//! - **Frame**: one bad frame (bad JSON, bad base64, odd byte count). Logged,
//!   the frame is dropped, the session continues.
//! - **Connection**: transport failure or unexpected close on either leg.
//!   Fatal to the session, never retried.
//! - **Handshake**: the upstream rejected authentication or configuration.
//!   Fatal to the session; the device is told why before being closed.
//! - **ConnectorClosed**: a send after the upstream reached a terminal state.
//!   Treated as a no-op inside the relay.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest → 400 (Bad Request)
#[derive(Debug)]
pub enum AppError {
    /// Unexpected server-side failure
    Internal(String),

    /// The client sent something we cannot serve (e.g. a non-WebSocket request
    /// on the device endpoint)
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts an `AppError` into a JSON error body:
///
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "WebSocket upgrade failed: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Failures inside a relay session.
///
/// ## Rust Concepts:
/// - **Clone + PartialEq**: errors travel through channels (the upstream
///   connector reports them to the session actor) and are compared in tests,
///   so they carry plain strings rather than the underlying error objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Transport-level failure or unexpected close on either leg
    Connection(String),

    /// Malformed control or audio payload
    Frame(String),

    /// Upstream rejected authentication or session configuration
    Handshake(String),

    /// Send attempted after the upstream connector reached a terminal state
    ConnectorClosed,
}

impl RelayError {
    /// Whether this error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Connection(_) | RelayError::Handshake(_))
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Frame(msg) => write!(f, "Frame error: {}", msg),
            RelayError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            RelayError::ConnectorClosed => write!(f, "Upstream connector is closed"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Bad JSON from either side is a frame-local problem.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Frame(format!("invalid JSON: {}", err))
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(err: base64::DecodeError) -> Self {
        RelayError::Frame(format!("invalid base64 audio payload: {}", err))
    }
}

/// Shorthand for relay results.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(RelayError::Connection("reset".into()).is_fatal());
        assert!(RelayError::Handshake("401".into()).is_fatal());
        assert!(!RelayError::Frame("bad".into()).is_fatal());
        assert!(!RelayError::ConnectorClosed.is_fatal());
    }

    #[test]
    fn test_json_error_is_frame_error() {
        let err: RelayError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, RelayError::Frame(_)));
    }

    #[test]
    fn test_app_error_status() {
        let err = AppError::BadRequest("nope".to_string());
        assert_eq!(err.error_response().status(), actix_web::http::StatusCode::BAD_REQUEST);
        let err = AppError::ConfigError("missing key".to_string());
        assert_eq!(err.error_response().status(), actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
