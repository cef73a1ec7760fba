//! Stream-layer error types.

use nimbus_client::ClientError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The error object carried in admin API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP-like status code.
    #[serde(default)]
    pub code: u64,
    /// Stable broker-specific error code.
    #[serde(default)]
    pub err_code: u64,
    #[serde(default)]
    pub description: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, err_code {})",
            self.description, self.code, self.err_code
        )
    }
}

impl std::error::Error for ApiError {}

/// Errors surfaced by stream and consumer operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Client(#[from] ClientError),

    #[error("API error: {0}")]
    Api(ApiError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("consumer terminated: {status} {description}")]
    ConsumerTerminated { status: u16, description: String },
}

impl Error {
    /// Returns the API error object, if that is what this error carries.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_decode() {
        let err: ApiError = serde_json::from_str(
            r#"{"code":404,"err_code":10059,"description":"stream not found"}"#,
        )
        .unwrap();
        assert_eq!(err.code, 404);
        assert_eq!(err.err_code, 10059);
        assert!(err.to_string().contains("stream not found"));
    }
}
