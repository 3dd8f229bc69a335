//! Error types for warm-restart handling.

use thiserror::Error;

/// Result type alias for warm-restart operations.
pub type WarmRestartResult<T> = Result<T, WarmRestartError>;

/// Errors that can occur during warm-restart reconciliation.
#[derive(Debug, Error)]
pub enum WarmRestartError {
    /// Reconcile interval outside the accepted range.
    #[error("invalid reconcile timer value: {0} seconds (must be 1-{max})", max = crate::MAX_RECONCILE_TIMER_SECS)]
    InvalidTimer(u32),

    /// A table was used before `register_table`.
    #[error("table not registered with warm-restart assist: {0}")]
    UnregisteredTable(String),

    /// A cached row carried no valid state tag during reconcile. This is an
    /// invariant violation; callers abort.
    #[error("invalid cache state for {table}:{key}")]
    InvalidCacheState { table: String, key: String },

    /// Database access failed.
    #[error(transparent)]
    Db(#[from] sonic_db::DbError),
}
