//! Error types for fdbsyncd.

use thiserror::Error;

/// Result type alias for fdbsyncd operations.
pub type Result<T> = std::result::Result<T, FdbSyncError>;

/// Errors that can occur in fdbsyncd.
#[derive(Debug, Error)]
pub enum FdbSyncError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Db(#[from] sonic_db::DbError),

    /// Warm-restart handling failed.
    #[error("warm restart error: {0}")]
    WarmRestart(#[from] sonic_warm_restart::WarmRestartError),

    /// Kernel socket operation failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] sonic_netlink::NetlinkError),

    /// A database row carried an unparseable key or field.
    #[error("parse error: {0}")]
    Parse(#[from] sonic_types::ParseError),
}
