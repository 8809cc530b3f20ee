//! Storage errors and their mapping onto the core error type.

use profile_sync_core::errors::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Failed to get connection from pool: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Failed to encode column: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        let database_error = match err {
            StorageError::Connection(_) | StorageError::Pool(_) | StorageError::Io(_) => {
                DatabaseError::ConnectionFailed(message)
            }
            StorageError::Query(_) | StorageError::Serialization(_) => {
                DatabaseError::QueryFailed(message)
            }
            StorageError::Migration(_) => DatabaseError::MigrationFailed(message),
            StorageError::WriterUnavailable(_) => DatabaseError::Internal(message),
        };
        Error::Database(database_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_errors_map_to_query_failed() {
        let err: Error = StorageError::Query(diesel::result::Error::NotFound).into();
        assert!(matches!(
            err,
            Error::Database(DatabaseError::QueryFailed(ref msg)) if msg.contains("Record not found")
        ));
    }

    #[test]
    fn writer_errors_map_to_internal() {
        let err: Error = StorageError::WriterUnavailable("channel closed".to_string()).into();
        assert!(matches!(err, Error::Database(DatabaseError::Internal(_))));
    }
}
