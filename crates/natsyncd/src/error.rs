//! Error types for natsyncd.

use thiserror::Error;

/// Result type alias for natsyncd operations.
pub type Result<T> = std::result::Result<T, NatSyncError>;

/// Errors that can occur in natsyncd.
#[derive(Debug, Error)]
pub enum NatSyncError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Db(#[from] sonic_db::DbError),

    /// Warm-restart handling failed.
    #[error("warm restart error: {0}")]
    WarmRestart(#[from] sonic_warm_restart::WarmRestartError),

    /// Kernel socket operation failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] sonic_netlink::NetlinkError),

    /// The kernel conntrack restore marker did not appear in time. Fatal;
    /// the process exits non-zero and the supervisor restarts it.
    #[error("NAT conntrack restore not finished after {0} seconds")]
    RestoreTimeout(u64),
}
