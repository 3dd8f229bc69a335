//! Warm-restart reconciliation support.
//!
//! A restarting agent must neither lose nor duplicate dataplane state. The
//! scheme: at startup the agent snapshots its application tables into a
//! cache with every row tagged `STALE`, then replays live events into the
//! cache for a bounded window. When the reconcile timer fires, the cache is
//! diffed against what the events re-asserted: untouched (`STALE`) and
//! deleted rows are removed downstream, changed or new rows are published,
//! re-asserted identical rows are left alone.
//!
//! [`AppRestartAssist`] holds the cache and the per-table producer handles;
//! [`state`] carries the persistent `initialized → restored → reconciled`
//! status surface that supervisors read.

pub mod assist;
pub mod error;
pub mod state;

pub use assist::{AppRestartAssist, CacheState, CACHE_STATE_FIELD, MAX_RECONCILE_TIMER_SECS};
pub use error::{WarmRestartError, WarmRestartResult};
pub use state::{is_warm_start_enabled, warm_start_timer, WarmStartState, WarmStartStateTable};
