//! Persistent warm-restart status surface and configuration lookups.

use sonic_db::schema::{
    CFG_WARM_RESTART_TABLE_NAME, STATE_WARM_RESTART_ENABLE_TABLE_NAME,
    STATE_WARM_RESTART_TABLE_NAME,
};
use sonic_db::{fv, DbResult, SharedStore, Table};
use tracing::info;

/// Per-agent warm-restart status, written to the state database for
/// supervisors to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmStartState {
    Initialized,
    Restored,
    Reconciled,
}

impl WarmStartState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmStartState::Initialized => "initialized",
            WarmStartState::Restored => "restored",
            WarmStartState::Reconciled => "reconciled",
        }
    }
}

/// Handle to the per-app status row in the state database.
pub struct WarmStartStateTable {
    table: Table,
    app_name: String,
}

impl WarmStartStateTable {
    pub fn new(state_store: SharedStore, app_name: impl Into<String>) -> Self {
        Self {
            table: Table::new(state_store, STATE_WARM_RESTART_TABLE_NAME),
            app_name: app_name.into(),
        }
    }

    /// Records the agent's warm-restart status.
    pub async fn set_state(&self, state: WarmStartState) -> DbResult<()> {
        info!(app = %self.app_name, state = state.as_str(), "warm restart state");
        self.table
            .set(&self.app_name, &vec![fv("state", state.as_str())])
            .await
    }
}

/// Checks whether warm start is enabled for `docker_name`, either directly
/// or through the system-wide flag.
pub async fn is_warm_start_enabled(state_store: &SharedStore, docker_name: &str) -> DbResult<bool> {
    let table = Table::new(state_store.clone(), STATE_WARM_RESTART_ENABLE_TABLE_NAME);
    for key in [docker_name, "system"] {
        if table.hget(key, "enable").await?.as_deref() == Some("true") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reads the configured per-app reconcile timer (`<app>_timer` under the
/// docker's warm-restart config row), if any.
pub async fn warm_start_timer(
    config_store: &SharedStore,
    app_name: &str,
    docker_name: &str,
) -> DbResult<Option<u32>> {
    let table = Table::new(config_store.clone(), CFG_WARM_RESTART_TABLE_NAME);
    let field = format!("{}_timer", app_name);
    Ok(table
        .hget(docker_name, &field)
        .await?
        .and_then(|v| v.parse::<u32>().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_db::{MemoryStore, Store};
    use std::sync::Arc;

    fn store() -> SharedStore {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_state_transitions_are_persisted() {
        let state_store = store();
        let status = WarmStartStateTable::new(state_store.clone(), "fdbsyncd");
        status.set_state(WarmStartState::Initialized).await.unwrap();
        status.set_state(WarmStartState::Restored).await.unwrap();
        status.set_state(WarmStartState::Reconciled).await.unwrap();

        let value = state_store
            .hget(STATE_WARM_RESTART_TABLE_NAME, "fdbsyncd", "state")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("reconciled"));
    }

    #[tokio::test]
    async fn test_enable_flag_per_docker_and_system() {
        let state_store = store();
        assert!(!is_warm_start_enabled(&state_store, "swss").await.unwrap());

        state_store
            .set(
                STATE_WARM_RESTART_ENABLE_TABLE_NAME,
                "swss",
                &[fv("enable", "true")],
            )
            .await
            .unwrap();
        assert!(is_warm_start_enabled(&state_store, "swss").await.unwrap());
        assert!(!is_warm_start_enabled(&state_store, "nat").await.unwrap());

        state_store
            .set(
                STATE_WARM_RESTART_ENABLE_TABLE_NAME,
                "system",
                &[fv("enable", "true")],
            )
            .await
            .unwrap();
        assert!(is_warm_start_enabled(&state_store, "nat").await.unwrap());
    }

    #[tokio::test]
    async fn test_timer_override_lookup() {
        let config_store = store();
        assert_eq!(
            warm_start_timer(&config_store, "fdbsyncd", "swss")
                .await
                .unwrap(),
            None
        );
        config_store
            .set(
                CFG_WARM_RESTART_TABLE_NAME,
                "swss",
                &[fv("fdbsyncd_timer", "60")],
            )
            .await
            .unwrap();
        assert_eq!(
            warm_start_timer(&config_store, "fdbsyncd", "swss")
                .await
                .unwrap(),
            Some(60)
        );
    }
}
