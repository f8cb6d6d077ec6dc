//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`]: failures on the server's HTTP surface, converted into JSON responses
//!   through actix-web's `ResponseError` trait.
//! - [`ClientError`]: the taxonomy a session client reports to the presentation layer.
//!
//! Room-level refusals (bad display name, full room) are a third, smaller family,
//! [`crate::server::RoomError`], that travels over the WebSocket as an `error` event
//! rather than as an HTTP status.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **From trait**: lets `?` convert library errors into ours automatically
//! - **ResponseError trait**: turns an error into an HTTP response
//! - **Display trait**: the human-readable message

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the server.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: An internal actor could not be reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Room registry or room actor mailbox is gone
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Room 'physics' is not open",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg)
            }
            AppError::ValidationError(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg)
            }
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
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

/// JSON parsing errors are almost always the caller's fault, so they map to 400.
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

/// A `send(..).await` on a stopped actor.
impl From<actix::MailboxError> for AppError {
    fn from(err: actix::MailboxError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Errors a session client surfaces to whatever drives it.
///
/// ## Variants:
/// - **Connection**: the server could not be reached, the join was refused or timed out,
///   or the socket dropped and reconnection gave up
/// - **Device**: the microphone or a playback output failed; the rest of the session
///   keeps running
/// - **Protocol**: the server sent something that is not a valid event
/// - **State**: an operation was attempted while not joined
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Connection(String),
    Device(String),
    Protocol(String),
    State(String),
}

impl ClientError {
    /// Short category name used in logs and by the terminal client.
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::Connection(_) => "connection",
            ClientError::Device(_) => "device",
            ClientError::Protocol(_) => "protocol",
            ClientError::State(_) => "state",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ClientError::Device(msg) => write!(f, "Device error: {}", msg),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::State(msg) => write!(f, "State error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Connection(err.to_string())
    }
}

/// Undecodable server frames are protocol errors, not connection errors.
impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// Shorthand for `Result<T, ClientError>`.
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::NotFound("x".into()).error_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Unavailable("x".into()).error_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ValidationError("x".into())
                .error_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_mailbox_error_is_unavailable() {
        let err: AppError = actix::MailboxError::Closed.into();
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[test]
    fn test_client_error_from_bad_json() {
        let err: ClientError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.category(), "protocol");
        assert!(err.to_string().starts_with("Protocol error"));
    }
}
