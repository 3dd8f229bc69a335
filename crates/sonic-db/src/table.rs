//! Typed per-table handles over a [`Store`].

use crate::error::DbResult;
use crate::fieldvalues::{FieldValues, KeyOpFieldValues};
use crate::store::SharedStore;
use tokio::sync::mpsc;
use tracing::debug;

/// Direct read/write handle to one table.
#[derive(Clone)]
pub struct Table {
    store: SharedStore,
    name: String,
}

impl Table {
    pub fn new(store: SharedStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<FieldValues>> {
        self.store.get(&self.name, key).await
    }

    pub async fn set(&self, key: &str, fields: &FieldValues) -> DbResult<()> {
        self.store.set(&self.name, key, fields).await
    }

    pub async fn del(&self, key: &str) -> DbResult<()> {
        self.store.del(&self.name, key).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> DbResult<Option<String>> {
        self.store.hget(&self.name, key, field).await
    }

    pub async fn get_keys(&self) -> DbResult<Vec<String>> {
        self.store.keys(&self.name).await
    }
}

/// Buffered producer handle.
///
/// `set`/`del` queue mutations; `flush` applies them in order. The buffer is
/// owned by the agent's event loop, so a handler's writes become visible as
/// one batch when the loop returns to its multiplexed wait.
pub struct ProducerStateTable {
    store: SharedStore,
    name: String,
    pending: Vec<PendingOp>,
}

enum PendingOp {
    Set(String, FieldValues),
    Del(String),
}

impl ProducerStateTable {
    pub fn new(store: SharedStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a row set.
    pub fn set(&mut self, key: impl Into<String>, fields: FieldValues) {
        self.pending.push(PendingOp::Set(key.into(), fields));
    }

    /// Queues a row delete.
    pub fn del(&mut self, key: impl Into<String>) {
        self.pending.push(PendingOp::Del(key.into()));
    }

    /// Number of queued mutations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies queued mutations in order.
    pub async fn flush(&mut self) -> DbResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        debug!(table = %self.name, count = ops.len(), "flushing pipelined writes");
        for op in ops {
            match op {
                PendingOp::Set(key, fields) => self.store.set(&self.name, &key, &fields).await?,
                PendingOp::Del(key) => self.store.del(&self.name, &key).await?,
            }
        }
        Ok(())
    }
}

/// Subscription handle yielding `(key, op, fields)` events in arrival order.
pub struct SubscriberStateTable {
    name: String,
    rx: mpsc::UnboundedReceiver<KeyOpFieldValues>,
}

impl SubscriberStateTable {
    pub async fn new(store: &SharedStore, name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        let rx = store.subscribe(&name).await?;
        Ok(Self { name, rx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next event; `None` when the backend closed the stream.
    pub async fn recv(&mut self) -> Option<KeyOpFieldValues> {
        self.rx.recv().await
    }

    /// Drains everything currently queued without waiting.
    pub fn pops(&mut self) -> Vec<KeyOpFieldValues> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

/// Fire-and-forget notification channel producer.
pub struct NotificationProducer {
    store: SharedStore,
    channel: String,
}

impl NotificationProducer {
    pub fn new(store: SharedStore, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    pub async fn send(&self, op: &str, data: &str, fields: &FieldValues) -> DbResult<()> {
        self.store.publish(&self.channel, op, data, fields).await
    }
}
