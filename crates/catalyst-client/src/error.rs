//! Error types for the Catalyst client crate.

use profile_sync_core::Error as CoreError;
use thiserror::Error;

/// Result type alias for Catalyst client operations.
pub type Result<T> = std::result::Result<T, CatalystError>;

/// Retry policy class for content server failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Errors that can occur while talking to a Catalyst content server.
#[derive(Debug, Error)]
pub enum CatalystError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the content server
    #[error("Content server error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Response was well-formed but not usable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl CatalystError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid response error
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                404 | 408 | 409 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) => RetryClass::Permanent,
            Self::InvalidResponse(_) => RetryClass::Permanent,
        }
    }
}

impl From<CatalystError> for CoreError {
    fn from(err: CatalystError) -> Self {
        match err {
            CatalystError::Json(e) => CoreError::Json(e),
            CatalystError::InvalidResponse(message) => CoreError::invalid_data(message),
            other => CoreError::upstream(other.status_code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(CatalystError::api(503, "down").retry_class(), RetryClass::Retryable);
        assert_eq!(CatalystError::api(429, "slow down").retry_class(), RetryClass::Retryable);
    }

    #[test]
    fn client_errors_are_permanent() {
        assert_eq!(CatalystError::api(400, "bad").retry_class(), RetryClass::Permanent);
        assert_eq!(
            CatalystError::invalid_response("no deltas").retry_class(),
            RetryClass::Permanent
        );
    }

    #[test]
    fn api_errors_keep_status_in_core_error() {
        let err: CoreError = CatalystError::api(502, "bad gateway").into();
        assert_eq!(err.status_code(), Some(502));
    }
}
