//! # Error Handling
//!
//! Errors that end an HTTP request. Admission failures on `/ws` are returned
//! from the upgrade handler as one of these, so a refused client never gets a
//! socket, only a status code and a JSON body.
//!
//! Mid-session failures are not `AppError`s: they travel to the client as an
//! `error` frame (see [`crate::transcription::UpstreamError`]) and budget
//! exhaustion is a plain close reason (see [`crate::session::DisconnectReason`]).
//!
//! ## HTTP Status Code Mapping:
//! - Unauthorized → 401 (missing, malformed, expired or replayed session token)
//! - Forbidden → 403 (Origin not allow-listed)
//! - RateLimited → 429 (too many connection attempts from one IP)
//! - Internal → 500 (a response body could not be built)

use crate::admission::TokenError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Session token missing or failed verification
    Unauthorized(String),

    /// Request came from an Origin that is not allow-listed
    Forbidden(String),

    /// Connection attempts from this IP exceeded the window budget
    RateLimited(String),

    /// Internal server errors
    Internal(String),
}

impl AppError {
    /// Machine-readable error type, also used as the metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimited(_) => "rate_limited",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::RateLimited(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
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
///     "type": "unauthorized",
///     "message": "session token expired",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Token failures are always a 401; the variant only shapes the message.
impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

/// No handler parses JSON request bodies, so a serde failure is always the
/// server failing to serialize its own data.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_admission_status_codes() {
        assert_eq!(AppError::Unauthorized("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::RateLimited("x".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_token_errors_become_unauthorized() {
        let err: AppError = TokenError::Expired.into();
        assert_eq!(err.kind(), "unauthorized");
        assert_eq!(err.to_string(), "Unauthorized: session token expired");
    }

    #[test]
    fn test_serialization_failure_is_internal() {
        use std::collections::HashMap;

        // Non-string map keys cannot become JSON object keys.
        let map: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err: AppError = serde_json::to_value(&map).unwrap_err().into();

        assert_eq!(err.kind(), "internal_error");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::RateLimited("slow down".into()).error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "rate_limited");
        assert_eq!(json["error"]["message"], "slow down");
        assert!(json["error"]["timestamp"].is_string());
    }
}
