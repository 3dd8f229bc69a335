//! Redis store backend.
//!
//! Rows are hashes keyed `TABLE<sep>key`. APPL_DB uses `:` as the table
//! separator; CONFIG_DB and STATE_DB use `|`. Subscriptions ride on keyspace
//! notifications (`notify-keyspace-events` is enabled on SONiC redis) and
//! re-read the row on every event, so subscribers always observe the full
//! field set in publication order.

use crate::error::DbResult;
use crate::fieldvalues::{FieldValue, FieldValues, KeyOpFieldValues};
use crate::schema::APPL_DB;
use crate::store::Store;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Redis-backed store bound to one database index.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    db: i64,
    separator: char,
}

impl RedisStore {
    /// Connects to one database index.
    pub async fn connect(host: &str, port: u16, db: i64) -> DbResult<Self> {
        let url = format!("redis://{}:{}/{}", host, port, db);
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(host, port, db, "connected to redis database");
        Ok(Self {
            client,
            conn,
            db,
            separator: if db == APPL_DB { ':' } else { '|' },
        })
    }

    fn row_key(&self, table: &str, key: &str) -> String {
        format!("{}{}{}", table, self.separator, key)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, table: &str, key: &str) -> DbResult<Option<FieldValues>> {
        let mut conn = self.conn.clone();
        let values: HashMap<String, String> = conn.hgetall(self.row_key(table, key)).await?;
        if values.is_empty() {
            Ok(None)
        } else {
            Ok(Some(values.into_iter().collect()))
        }
    }

    async fn set(&self, table: &str, key: &str, fields: &[FieldValue]) -> DbResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(self.row_key(table, key), fields)
            .await?;
        Ok(())
    }

    async fn del(&self, table: &str, key: &str) -> DbResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.row_key(table, key)).await?;
        Ok(())
    }

    async fn keys(&self, table: &str) -> DbResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let prefix = format!("{}{}", table, self.separator);
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn hget(&self, table: &str, key: &str, field: &str) -> DbResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(self.row_key(table, key), field).await?;
        Ok(value)
    }

    async fn subscribe(
        &self,
        table: &str,
    ) -> DbResult<mpsc::UnboundedReceiver<KeyOpFieldValues>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        let prefix = format!("{}{}", table, self.separator);
        let channel_prefix = format!("__keyspace@{}__:{}", self.db, prefix);
        pubsub.psubscribe(format!("{}*", channel_prefix)).await?;

        let fetch_conn = self.conn.clone();
        let table_name = table.to_string();
        let row_prefix = prefix.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(row_key) = channel.strip_prefix(&channel_prefix) else {
                    continue;
                };
                let key = row_key.to_string();
                let event: String = match msg.get_payload() {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(table = %table_name, error = %e, "bad keyspace payload");
                        continue;
                    }
                };

                let event = if event == "del" || event == "expired" {
                    KeyOpFieldValues::del(key)
                } else {
                    let mut conn = fetch_conn.clone();
                    let full_key = format!("{}{}", row_prefix, key);
                    let values: HashMap<String, String> =
                        match conn.hgetall(&full_key).await {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(table = %table_name, key, error = %e, "row re-read failed");
                                continue;
                            }
                        };
                    if values.is_empty() {
                        KeyOpFieldValues::del(key)
                    } else {
                        KeyOpFieldValues::set(key, values.into_iter().collect())
                    }
                };

                if tx.send(event).is_err() {
                    // Subscriber dropped; end the forwarding task.
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn publish(
        &self,
        channel: &str,
        op: &str,
        data: &str,
        fields: &[FieldValue],
    ) -> DbResult<()> {
        let mut conn = self.conn.clone();
        let payload = encode_notification(op, data, fields);
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

/// Encodes a notification payload as the JSON array `[op, data, f, v, ...]`.
fn encode_notification(op: &str, data: &str, fields: &[FieldValue]) -> String {
    let mut parts: Vec<String> = vec![json_str(op), json_str(data)];
    for (f, v) in fields {
        parts.push(json_str(f));
        parts.push(json_str(v));
    }
    format!("[{}]", parts.join(","))
}

fn json_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
