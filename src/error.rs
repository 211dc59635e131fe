//! # Error Handling
//!
//! Custom error type for request handlers and its conversion to HTTP
//! responses.
//!
//! ## Error Categories:
//! - **ServiceUnavailable**: the speech model is not loaded (503)
//! - **Internal**: anything that failed while handling the upload or running
//!   the model (500)
//! - **BadRequest**: the body could not be read as multipart form data (400)
//! - **ValidationError**: the form was readable but incomplete (422)
//! - **ConfigError**: the configuration could not be loaded or is invalid;
//!   only raised at startup, where it aborts the process
//!
//! Only the not-ready condition is checked explicitly. Every other failure
//! during transcription is passed through as `Internal` without retries.
//!
//! ## How errors flow:
//! - Runtime code returns `anyhow::Result` and adds context with
//!   `.context(...)` as the error travels up
//! - Handlers return [`AppResult`]; the `?` operator turns an
//!   `anyhow::Error` into `AppError::Internal` through the `From` impls below
//! - actix calls [`ResponseError::error_response`] to render the JSON body
//!
//! ## Conversions:
//! - `anyhow::Error` → `Internal`, with the whole context chain in the message
//! - `config::ConfigError` → `ConfigError`
//! - `actix_multipart::MultipartError` → `BadRequest`
//! - `actix_web::error::BlockingError` → `Internal` (the blocking task was
//!   cancelled or panicked)

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors a request or startup can end with.
///
/// Each variant carries a human-readable message that ends up in the
/// response body, so it should describe the problem to an API client.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::ValidationError("Missing required field: file".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// The model handle does not exist (startup not run or failed)
    ServiceUnavailable(String),

    /// Upload staging, decoding or inference failed
    Internal(String),

    /// Client sent a body that is not valid multipart form data
    BadRequest(String),

    /// A required form field is missing or unusable
    ValidationError(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Maps each error to a status code and JSON body.
///
/// The not-ready response keeps the `{"detail": "..."}` shape clients of the
/// transcription API already parse. Everything else uses:
/// ```json
/// {
///   "error": {
///     "type": "internal_error",
///     "message": "...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::ServiceUnavailable(msg) => {
                return HttpResponse::build(self.status_code()).json(json!({ "detail": msg }));
            }
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
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
        // {:#} keeps the context chain on one line
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(format!("Transcription task aborted: {}", err))
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.error_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn test_service_unavailable_uses_detail_body() {
        let (status, body) =
            body_json(AppError::ServiceUnavailable("Model not ready".to_string())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({ "detail": "Model not ready" }));
    }

    #[actix_web::test]
    async fn test_internal_error_body() {
        let (status, body) = body_json(AppError::Internal("decoder failed".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "internal_error");
        assert_eq!(body["error"]["message"], "decoder failed");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ValidationError(String::new()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::ConfigError(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_config_error_conversion() {
        let err = AppError::from(config::ConfigError::Message("bad port".to_string()));
        assert!(matches!(&err, AppError::ConfigError(msg) if msg == "bad port"));

        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "config_error");
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("no such file").context("decoding upload");
        match AppError::from(err) {
            AppError::Internal(msg) => assert_eq!(msg, "decoding upload: no such file"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
