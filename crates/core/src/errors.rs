//! Error types shared by the profile sync crates.

use thiserror::Error;

/// Result type alias for profile sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Database failures reported by repository implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

/// Errors that can occur while synchronizing profiles.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Content server request failed or answered with a non-ok status
    #[error("Upstream error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// Upstream returned data that cannot be turned into a profile
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration is missing or out of range
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an upstream error from an optional status and message
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// HTTP status if this is an upstream error carrying one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}
