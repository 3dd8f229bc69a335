//! Error types for mclagsyncd.

use thiserror::Error;

/// Result type alias for mclagsyncd operations.
pub type Result<T> = std::result::Result<T, McLagError>;

/// Errors that can occur in mclagsyncd.
#[derive(Debug, Error)]
pub enum McLagError {
    /// The peer closed the connection; the server loop re-accepts.
    #[error("peer connection closed")]
    ConnectionClosed,

    /// A frame header declared an out-of-range length; the connection is
    /// torn down.
    #[error("malformed peer frame: declared length {length}")]
    MalformedFrame { length: u16 },

    /// Socket IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed.
    #[error("database error: {0}")]
    Db(#[from] sonic_db::DbError),
}
