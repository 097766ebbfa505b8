//! Error types and handling for the proxy server.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! various error sources and converts them into a JSON error envelope.

use crate::core::decoder::DecodeError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_API: &str = "api_error";

/// Main error type for the application.
///
/// Client errors map to 4xx, upstream failures to 5xx. Audit failures never
/// reach this type; they are logged where they happen.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("Proxy error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Audit storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Upstream body could not be decompressed
    #[error("Failed to decompress response: {0}")]
    Decode(#[from] DecodeError),

    /// Malformed body or missing/invalid `model` field
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The resolved backend id is not in the registry
    #[error("Invalid provider: {0}")]
    UnknownBackend(String),

    /// Request body exceeds the configured ceiling
    #[error("Request body too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    /// Upstream call did not finish before the deadline
    #[error("Upstream timeout after {timeout_secs} seconds")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("Invalid log ID")]
    InvalidLogId,

    #[error("Log entry {0} not found")]
    LogNotFound(i64),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error is surfaced with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::Decode(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::InvalidRequest(_) | AppError::UnknownBackend(_) | AppError::InvalidLogId => {
                StatusCode::BAD_REQUEST
            }
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::LogNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_)
            | AppError::UnknownBackend(_)
            | AppError::PayloadTooLarge { .. }
            | AppError::InvalidLogId
            | AppError::LogNotFound(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::UpstreamTimeout { .. } => ERROR_TYPE_TIMEOUT,
            AppError::Request(e) if e.is_timeout() => ERROR_TYPE_TIMEOUT,
            AppError::Request(_) | AppError::Decode(_) => ERROR_TYPE_UPSTREAM,
            _ => ERROR_TYPE_API,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::UnknownBackend("nope".to_string());
        assert_eq!(err.to_string(), "Invalid provider: nope");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal server error: test error");

        let err = AppError::UpstreamTimeout { timeout_secs: 5 };
        assert_eq!(err.to_string(), "Upstream timeout after 5 seconds");
    }

    #[test]
    fn test_client_errors_are_4xx() {
        assert_eq!(
            AppError::InvalidRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::UnknownBackend("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::PayloadTooLarge { limit: 10 }.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            AppError::LogNotFound(3).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_upstream_errors_are_5xx() {
        let response = AppError::UpstreamTimeout { timeout_secs: 1 }.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = AppError::Decode(DecodeError::UnsupportedEncoding("lzma".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_config_error_response() {
        let err = AppError::Config(anyhow::anyhow!("config error"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = AppError::InvalidRequest("missing model".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "Invalid request: missing model");
        assert_eq!(json["error"]["type"], ERROR_TYPE_INVALID_REQUEST);
        assert_eq!(json["error"]["code"], 400);
    }
}
