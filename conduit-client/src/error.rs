//! Error types for the Conduit client

use serde::Deserialize;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the orchestrator
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

/// Body of an orchestrator error response
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl ClientError {
    /// Create an API error from a status code and the raw response body
    ///
    /// Unwraps the orchestrator's `{"error": ...}` envelope when present.
    pub fn api_error(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Self::ApiError { status, message }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The run had already finished when the request arrived
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_unwraps_envelope() {
        let err = ClientError::api_error(404, r#"{"error":"run 42 not found"}"#);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "API error (status 404): run 42 not found");
    }

    #[test]
    fn test_api_error_keeps_plain_body() {
        let err = ClientError::api_error(502, "Bad Gateway");
        assert_eq!(err.status(), Some(502));
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "API error (status 502): Bad Gateway");
    }
}
