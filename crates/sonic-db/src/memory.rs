//! In-process store backend.
//!
//! Backs the unit tests and offline tooling with the same contract as the
//! Redis store. Subscribers receive the full row on every SET, matching the
//! hgetall-on-notification behavior of the production subscriber.

use crate::error::DbResult;
use crate::fieldvalues::{FieldValue, FieldValues, KeyOpFieldValues};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One recorded notification: `(channel, op, data, fields)`.
pub type Notification = (String, String, String, FieldValues);

#[derive(Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, FieldValues>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<KeyOpFieldValues>>>,
    notifications: Vec<Notification>,
}

/// In-memory store; cheap to clone via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row of a table, for test assertions.
    pub fn dump(&self, table: &str) -> BTreeMap<String, FieldValues> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.tables.get(table).cloned().unwrap_or_default()
    }

    /// All notifications published so far, for test assertions.
    pub fn notifications(&self) -> Vec<Notification> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.notifications.clone()
    }

    fn notify(inner: &mut Inner, table: &str, event: KeyOpFieldValues) {
        if let Some(subs) = inner.subscribers.get_mut(table) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> DbResult<Option<FieldValues>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .filter(|fvs| !fvs.is_empty())
            .cloned())
    }

    async fn set(&self, table: &str, key: &str, fields: &[FieldValue]) -> DbResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let row = inner
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default();
        for (field, value) in fields {
            match row.iter_mut().find(|(f, _)| f == field) {
                Some((_, v)) => *v = value.clone(),
                None => row.push((field.clone(), value.clone())),
            }
        }
        let full_row = row.clone();
        Self::notify(
            &mut inner,
            table,
            KeyOpFieldValues::set(key.to_string(), full_row),
        );
        Ok(())
    }

    async fn del(&self, table: &str, key: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let existed = inner
            .tables
            .get_mut(table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false);
        if existed {
            Self::notify(&mut inner, table, KeyOpFieldValues::del(key.to_string()));
        }
        Ok(())
    }

    async fn keys(&self, table: &str) -> DbResult<Vec<String>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hget(&self, table: &str, key: &str, field: &str) -> DbResult<Option<String>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .and_then(|fvs| fvs.iter().find(|(f, _)| f == field))
            .map(|(_, v)| v.clone()))
    }

    async fn subscribe(
        &self,
        table: &str,
    ) -> DbResult<mpsc::UnboundedReceiver<KeyOpFieldValues>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .subscribers
            .entry(table.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        channel: &str,
        op: &str,
        data: &str,
        fields: &[FieldValue],
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.notifications.push((
            channel.to_string(),
            op.to_string(),
            data.to_string(),
            fields.to_vec(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldvalues::fv;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_set_merges_fields() {
        let store = MemoryStore::new();
        store.set("T", "k", &[fv("a", "1")]).await.unwrap();
        store
            .set("T", "k", &[fv("b", "2"), fv("a", "3")])
            .await
            .unwrap();
        let row = store.get("T", "k").await.unwrap().unwrap();
        assert_eq!(row, vec![fv("a", "3"), fv("b", "2")]);
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let store = MemoryStore::new();
        store.set("T", "k", &[fv("a", "1")]).await.unwrap();
        store.del("T", "k").await.unwrap();
        store.del("T", "k").await.unwrap();
        assert_eq!(store.get("T", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_receives_full_row_in_order() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("T").await.unwrap();

        store.set("T", "k", &[fv("a", "1")]).await.unwrap();
        store.set("T", "k", &[fv("b", "2")]).await.unwrap();
        store.del("T", "k").await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, KeyOpFieldValues::set("k", vec![fv("a", "1")]));
        let ev = rx.recv().await.unwrap();
        assert_eq!(
            ev,
            KeyOpFieldValues::set("k", vec![fv("a", "1"), fv("b", "2")])
        );
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, KeyOpFieldValues::del("k"));
    }

    #[tokio::test]
    async fn test_del_of_absent_key_does_not_notify() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("T").await.unwrap();
        store.del("T", "nope").await.unwrap();
        store.set("T", "k", &[fv("a", "1")]).await.unwrap();
        // The first event seen is the SET, not a DEL for the absent key.
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.op, crate::DbOp::Set);
    }

    #[tokio::test]
    async fn test_publish_records_notification() {
        let store = MemoryStore::new();
        store
            .publish("FLUSHFDBREQUEST", "ALL", "ALL", &[])
            .await
            .unwrap();
        let notifs = store.notifications();
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].0, "FLUSHFDBREQUEST");
    }
}
