//! The per-agent reconciliation cache.

use crate::error::{WarmRestartError, WarmRestartResult};
use crate::state::{
    is_warm_start_enabled, warm_start_timer, WarmStartState, WarmStartStateTable,
};
use sonic_db::{
    fv, fvs_contain, FieldValues, OneShotTimer, ProducerStateTable, SharedStore, Table,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reserved trailing field carrying the cache tag of a row.
pub const CACHE_STATE_FIELD: &str = "cache-state";

/// Upper bound on the reconcile interval, seconds.
pub const MAX_RECONCILE_TIMER_SECS: u32 = 9999;

/// Tag tracking what the reconcile pass should do with a cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Restored from the pre-restart snapshot, not yet re-asserted.
    Stale,
    /// Re-asserted with identical field values.
    Same,
    /// New key, or re-asserted with different values.
    New,
    /// Deleted during the reconciliation window.
    Delete,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Stale => "STALE",
            CacheState::Same => "SAME",
            CacheState::New => "NEW",
            CacheState::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STALE" => Some(CacheState::Stale),
            "SAME" => Some(CacheState::Same),
            "NEW" => Some(CacheState::New),
            "DELETE" => Some(CacheState::Delete),
            _ => None,
        }
    }
}

struct RegisteredTable {
    producer: ProducerStateTable,
    reader: Table,
}

/// Reconciliation cache backing one agent.
///
/// Registered application tables share their producer handles between the
/// cache and the agent's direct publish path, so every row flows through one
/// pipeline regardless of warm-restart phase.
pub struct AppRestartAssist {
    app_name: String,
    appl_store: SharedStore,
    status: WarmStartStateTable,
    tables: HashMap<String, RegisteredTable>,
    table_order: Vec<String>,
    cache: HashMap<String, HashMap<String, FieldValues>>,
    reconcile_interval: Duration,
    in_progress: bool,
}

impl AppRestartAssist {
    /// Creates the assist and probes the warm-restart surface.
    ///
    /// `default_timer_secs` must be within `1..=MAX_RECONCILE_TIMER_SECS`;
    /// out-of-range values are rejected. A valid per-app override in the
    /// config database takes precedence.
    pub async fn new(
        appl_store: SharedStore,
        state_store: SharedStore,
        config_store: SharedStore,
        app_name: &str,
        docker_name: &str,
        default_timer_secs: u32,
    ) -> WarmRestartResult<Self> {
        if default_timer_secs == 0 || default_timer_secs > MAX_RECONCILE_TIMER_SECS {
            return Err(WarmRestartError::InvalidTimer(default_timer_secs));
        }

        let mut timer_secs = default_timer_secs;
        let in_progress = is_warm_start_enabled(&state_store, docker_name).await?;
        let status = WarmStartStateTable::new(state_store, app_name);

        if in_progress {
            match warm_start_timer(&config_store, app_name, docker_name).await? {
                Some(cfg) if cfg > 0 && cfg <= MAX_RECONCILE_TIMER_SECS => {
                    info!(app = app_name, timer = cfg, "using configured reconcile timer");
                    timer_secs = cfg;
                }
                Some(cfg) => {
                    warn!(app = app_name, timer = cfg, "ignoring out-of-range reconcile timer");
                }
                None => {}
            }
            status.set_state(WarmStartState::Initialized).await?;
        }

        Ok(Self {
            app_name: app_name.to_string(),
            appl_store,
            status,
            tables: HashMap::new(),
            table_order: Vec::new(),
            cache: HashMap::new(),
            reconcile_interval: Duration::from_secs(u64::from(timer_secs)),
            in_progress,
        })
    }

    /// Binds an application table; must precede `read_tables_to_map`.
    pub fn register_table(&mut self, table_name: &str) {
        self.tables.insert(
            table_name.to_string(),
            RegisteredTable {
                producer: ProducerStateTable::new(self.appl_store.clone(), table_name),
                reader: Table::new(self.appl_store.clone(), table_name),
            },
        );
        self.table_order.push(table_name.to_string());
    }

    /// True from startup until the reconcile pass completes.
    pub fn is_warm_start_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Builds the one-shot reconcile timer for the agent's event loop.
    pub fn reconcile_timer(&self) -> OneShotTimer {
        OneShotTimer::new(self.reconcile_interval)
    }

    /// Queues a direct publish on a registered table's producer.
    pub fn producer_set(
        &mut self,
        table_name: &str,
        key: &str,
        fields: FieldValues,
    ) -> WarmRestartResult<()> {
        let table = self
            .tables
            .get_mut(table_name)
            .ok_or_else(|| WarmRestartError::UnregisteredTable(table_name.to_string()))?;
        table.producer.set(key, fields);
        Ok(())
    }

    /// Queues a direct delete on a registered table's producer.
    pub fn producer_del(&mut self, table_name: &str, key: &str) -> WarmRestartResult<()> {
        let table = self
            .tables
            .get_mut(table_name)
            .ok_or_else(|| WarmRestartError::UnregisteredTable(table_name.to_string()))?;
        table.producer.del(key);
        Ok(())
    }

    /// Flushes every registered producer's pipeline.
    pub async fn flush(&mut self) -> WarmRestartResult<()> {
        for name in &self.table_order {
            if let Some(table) = self.tables.get_mut(name) {
                table.producer.flush().await?;
            }
        }
        Ok(())
    }

    /// Bulk-reads every registered table into the cache with tag `STALE` and
    /// marks the persistent status `restored`.
    pub async fn read_tables_to_map(&mut self) -> WarmRestartResult<()> {
        for name in &self.table_order {
            let table = self
                .tables
                .get(name)
                .ok_or_else(|| WarmRestartError::UnregisteredTable(name.clone()))?;
            let keys = table.reader.get_keys().await?;
            let entry = self.cache.entry(name.clone()).or_default();
            for key in keys {
                let Some(mut fields) = table.reader.get(&key).await? else {
                    continue;
                };
                fields.push(fv(CACHE_STATE_FIELD, CacheState::Stale.as_str()));
                debug!(table = %name, key = %key, "restored row into cache");
                entry.insert(key, fields);
            }
            info!(table = %name, count = entry.len(), "restored table into cache");
        }
        self.status.set_state(WarmStartState::Restored).await?;
        Ok(())
    }

    /// Applies one live event to the cache.
    ///
    /// Deletes tag an existing row `DELETE` (absent keys are a no-op);
    /// re-asserted rows become `SAME` when the values match the cached copy
    /// and are replaced with tag `NEW` when they differ; unknown keys are
    /// inserted with tag `NEW`. A cached row missing its tag compares as
    /// changed.
    pub fn insert_to_map(
        &mut self,
        table_name: &str,
        key: &str,
        mut fields: FieldValues,
        is_delete: bool,
    ) {
        debug!(
            table = table_name,
            key,
            delete = is_delete,
            "event routed into warm-restart cache"
        );
        let table_cache = self.cache.entry(table_name.to_string()).or_default();

        if is_delete {
            if let Some(cached) = table_cache.get_mut(key) {
                set_cache_state(cached, CacheState::Delete);
            }
            return;
        }

        match table_cache.get_mut(key) {
            Some(cached) => {
                let matches = match cached.last() {
                    Some((field, _)) if field == CACHE_STATE_FIELD => {
                        fvs_contain(&cached[..cached.len() - 1], &fields)
                    }
                    _ => false,
                };
                if matches {
                    set_cache_state(cached, CacheState::Same);
                } else {
                    fields.push(fv(CACHE_STATE_FIELD, CacheState::New.as_str()));
                    table_cache.insert(key.to_string(), fields);
                }
            }
            None => {
                fields.push(fv(CACHE_STATE_FIELD, CacheState::New.as_str()));
                table_cache.insert(key.to_string(), fields);
            }
        }
    }

    /// Drains the cache: `SAME` rows are left alone, `STALE`/`DELETE` rows
    /// are deleted downstream, `NEW` rows are published. Clears the cache,
    /// flushes the producers, marks the status `reconciled` and ends the
    /// warm-restart window.
    pub async fn reconcile(&mut self) -> WarmRestartResult<()> {
        info!(app = %self.app_name, "reconciling warm-restart cache");
        let mut cache = std::mem::take(&mut self.cache);

        for table_name in &self.table_order {
            let Some(rows) = cache.remove(table_name) else {
                continue;
            };
            let table = self
                .tables
                .get_mut(table_name)
                .ok_or_else(|| WarmRestartError::UnregisteredTable(table_name.clone()))?;

            for (key, mut fields) in rows {
                let state = cache_state_of(&fields).ok_or_else(|| {
                    WarmRestartError::InvalidCacheState {
                        table: table_name.clone(),
                        key: key.clone(),
                    }
                })?;
                match state {
                    CacheState::Same => {
                        debug!(table = %table_name, key = %key, "SAME, no-op");
                    }
                    CacheState::Stale | CacheState::Delete => {
                        info!(table = %table_name, key = %key, "STALE/DELETE, deleting downstream");
                        table.producer.del(&key);
                    }
                    CacheState::New => {
                        info!(table = %table_name, key = %key, "NEW, publishing downstream");
                        fields.pop();
                        table.producer.set(&key, fields);
                    }
                }
            }
        }

        self.flush().await?;
        self.status.set_state(WarmStartState::Reconciled).await?;
        self.in_progress = false;
        Ok(())
    }

    /// Number of cached rows across all tables (test support).
    pub fn cached_rows(&self) -> usize {
        self.cache.values().map(|t| t.len()).sum()
    }
}

/// Upserts the trailing cache tag on a cached row.
fn set_cache_state(fields: &mut FieldValues, state: CacheState) {
    match fields.last_mut() {
        Some((field, value)) if field == CACHE_STATE_FIELD => {
            *value = state.as_str().to_string();
        }
        _ => fields.push(fv(CACHE_STATE_FIELD, state.as_str())),
    }
}

/// Reads the trailing cache tag; `None` when missing or unparseable.
fn cache_state_of(fields: &FieldValues) -> Option<CacheState> {
    match fields.last() {
        Some((field, value)) if field == CACHE_STATE_FIELD => CacheState::from_str(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sonic_db::schema::STATE_WARM_RESTART_ENABLE_TABLE_NAME;
    use sonic_db::{MemoryStore, Store};
    use std::sync::Arc;

    const TABLE: &str = "VXLAN_FDB_TABLE";

    struct Fixture {
        appl: Arc<MemoryStore>,
        assist: AppRestartAssist,
    }

    async fn warm_fixture() -> Fixture {
        let appl: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let state: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        state
            .set(
                STATE_WARM_RESTART_ENABLE_TABLE_NAME,
                "swss",
                &[fv("enable", "true")],
            )
            .await
            .unwrap();
        let mut assist = AppRestartAssist::new(
            appl.clone(),
            state,
            config,
            "fdbsyncd",
            "swss",
            30,
        )
        .await
        .unwrap();
        assist.register_table(TABLE);
        Fixture { appl, assist }
    }

    fn row(vtep: &str) -> FieldValues {
        vec![fv("remote_vtep", vtep), fv("type", "dynamic"), fv("vni", "1000")]
    }

    #[tokio::test]
    async fn test_timer_bounds_rejected_at_construction() {
        let appl: SharedStore = Arc::new(MemoryStore::new());
        let state: SharedStore = Arc::new(MemoryStore::new());
        let config: SharedStore = Arc::new(MemoryStore::new());

        let zero = AppRestartAssist::new(
            appl.clone(),
            state.clone(),
            config.clone(),
            "app",
            "swss",
            0,
        )
        .await;
        assert!(matches!(zero, Err(WarmRestartError::InvalidTimer(0))));

        let over = AppRestartAssist::new(appl, state, config, "app", "swss", 10000).await;
        assert!(matches!(over, Err(WarmRestartError::InvalidTimer(10000))));
    }

    #[tokio::test]
    async fn test_cold_start_is_not_in_progress() {
        let appl: SharedStore = Arc::new(MemoryStore::new());
        let state: SharedStore = Arc::new(MemoryStore::new());
        let config: SharedStore = Arc::new(MemoryStore::new());
        let assist = AppRestartAssist::new(appl, state, config, "app", "swss", 30)
            .await
            .unwrap();
        assert!(!assist.is_warm_start_in_progress());
    }

    #[tokio::test]
    async fn test_same_row_produces_no_mutation() {
        let mut fx = warm_fixture().await;
        fx.appl.set(TABLE, "k", &row("10.0.0.1")).await.unwrap();
        fx.assist.read_tables_to_map().await.unwrap();

        fx.assist.insert_to_map(TABLE, "k", row("10.0.0.1"), false);
        fx.assist.reconcile().await.unwrap();

        // Row untouched downstream, cache drained, window over.
        assert_eq!(fx.appl.get(TABLE, "k").await.unwrap(), Some(row("10.0.0.1")));
        assert_eq!(fx.assist.cached_rows(), 0);
        assert!(!fx.assist.is_warm_start_in_progress());
    }

    #[tokio::test]
    async fn test_delete_always_deletes_downstream() {
        let mut fx = warm_fixture().await;
        fx.appl.set(TABLE, "k", &row("10.0.0.1")).await.unwrap();
        fx.assist.read_tables_to_map().await.unwrap();

        fx.assist.insert_to_map(TABLE, "k", Vec::new(), true);
        fx.assist.reconcile().await.unwrap();

        assert_eq!(fx.appl.get(TABLE, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_changed_row_republished() {
        let mut fx = warm_fixture().await;
        fx.appl.set(TABLE, "k", &row("10.0.0.1")).await.unwrap();
        fx.assist.read_tables_to_map().await.unwrap();

        fx.assist.insert_to_map(TABLE, "k", row("10.0.0.2"), false);
        fx.assist.reconcile().await.unwrap();

        let stored = fx.appl.get(TABLE, "k").await.unwrap().unwrap();
        assert!(fvs_contain(&stored, &row("10.0.0.2")));
        // The reserved tag never reaches the database.
        assert!(stored.iter().all(|(f, _)| f != CACHE_STATE_FIELD));
    }

    #[tokio::test]
    async fn test_stale_row_deleted_new_row_published() {
        let mut fx = warm_fixture().await;
        fx.appl.set(TABLE, "k1", &row("10.0.0.1")).await.unwrap();
        fx.appl.set(TABLE, "k2", &row("10.0.0.2")).await.unwrap();
        fx.assist.read_tables_to_map().await.unwrap();

        fx.assist.insert_to_map(TABLE, "k1", row("10.0.0.1"), false);
        fx.assist.insert_to_map(TABLE, "k3", row("10.0.0.3"), false);
        fx.assist.reconcile().await.unwrap();

        assert_eq!(fx.appl.get(TABLE, "k1").await.unwrap(), Some(row("10.0.0.1")));
        assert_eq!(fx.appl.get(TABLE, "k2").await.unwrap(), None);
        let k3 = fx.appl.get(TABLE, "k3").await.unwrap().unwrap();
        assert!(fvs_contain(&k3, &row("10.0.0.3")));
        assert_eq!(fx.assist.cached_rows(), 0);
        assert!(!fx.assist.is_warm_start_in_progress());
    }

    #[tokio::test]
    async fn test_delete_then_reassert_becomes_new() {
        let mut fx = warm_fixture().await;
        fx.appl.set(TABLE, "k", &row("10.0.0.1")).await.unwrap();
        fx.assist.read_tables_to_map().await.unwrap();

        fx.assist.insert_to_map(TABLE, "k", Vec::new(), true);
        fx.assist.insert_to_map(TABLE, "k", row("10.0.0.9"), false);
        fx.assist.reconcile().await.unwrap();

        let stored = fx.appl.get(TABLE, "k").await.unwrap().unwrap();
        assert!(fvs_contain(&stored, &row("10.0.0.9")));
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_is_noop() {
        let mut fx = warm_fixture().await;
        fx.assist.read_tables_to_map().await.unwrap();
        fx.assist.insert_to_map(TABLE, "ghost", Vec::new(), true);
        assert_eq!(fx.assist.cached_rows(), 0);
        fx.assist.reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_table_rejected() {
        let mut fx = warm_fixture().await;
        let err = fx.assist.producer_set("NOPE", "k", Vec::new());
        assert!(matches!(err, Err(WarmRestartError::UnregisteredTable(_))));
    }
}
