//! Error types for kernel socket access.

use thiserror::Error;

/// Result type alias for netlink operations.
pub type NetlinkResult<T> = Result<T, NetlinkError>;

/// Errors that can occur on the kernel-facing sockets.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// Socket create/bind/send/recv failed.
    #[error("netlink socket error: {0}")]
    Socket(String),

    /// A received message could not be decoded.
    #[error("netlink decode error: {0}")]
    Decode(String),

    /// The kernel acknowledged a request with a non-zero code.
    #[error("kernel rejected request: errno {0}")]
    KernelAck(i32),

    /// Interface name lookup failed.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// IO error from the async registration layer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
