//! Error types for database operations.

use thiserror::Error;

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur while talking to the state database.
#[derive(Debug, Error)]
pub enum DbError {
    /// Redis connection or command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A subscription channel was closed by the backend.
    #[error("subscription closed for table {0}")]
    SubscriptionClosed(String),

    /// A malformed row was read back from the store.
    #[error("malformed row in {table}:{key}: {reason}")]
    MalformedRow {
        table: String,
        key: String,
        reason: String,
    },
}
