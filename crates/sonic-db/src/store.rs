//! The backend contract every store implements.

use crate::error::DbResult;
use crate::fieldvalues::{FieldValue, FieldValues, KeyOpFieldValues};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn Store>;

/// Narrow key-value contract used by the agents.
///
/// Rows live in logically named tables; a row is a key plus a field-value
/// mapping. `set` merges fields into an existing row (hash-set semantics);
/// `del` removes the whole row and is idempotent. Subscriptions deliver
/// events in the order the producer published them; ordering across tables
/// is not guaranteed.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a row; `None` when absent or empty.
    async fn get(&self, table: &str, key: &str) -> DbResult<Option<FieldValues>>;

    /// Merges `fields` into the row, creating it if needed.
    async fn set(&self, table: &str, key: &str, fields: &[FieldValue]) -> DbResult<()>;

    /// Removes the row. Removing an absent row is not an error.
    async fn del(&self, table: &str, key: &str) -> DbResult<()>;

    /// Lists all keys of a table.
    async fn keys(&self, table: &str) -> DbResult<Vec<String>>;

    /// Reads one field of a row.
    async fn hget(&self, table: &str, key: &str, field: &str) -> DbResult<Option<String>>;

    /// Subscribes to row changes of one table.
    async fn subscribe(
        &self,
        table: &str,
    ) -> DbResult<mpsc::UnboundedReceiver<KeyOpFieldValues>>;

    /// Publishes a fire-and-forget notification on `channel`.
    async fn publish(
        &self,
        channel: &str,
        op: &str,
        data: &str,
        fields: &[FieldValue],
    ) -> DbResult<()>;
}
