//! Database adapter for the SONiC synchronization agents.
//!
//! The agents treat the switch-state database as an ordered key-value store
//! of logical tables with pub/sub and pipelined writes. This crate provides
//! that narrow contract:
//!
//! - [`Store`]: the backend trait, with a Redis implementation
//!   ([`RedisStore`]) for production and an in-process implementation
//!   ([`MemoryStore`]) used by tests.
//! - [`Table`]: direct per-table reads and writes.
//! - [`ProducerStateTable`]: pipelined writes, flushed explicitly or on
//!   event-loop return.
//! - [`SubscriberStateTable`]: per-table change stream in publication order.
//! - [`NotificationProducer`]: fire-and-forget notification channels.
//! - [`OneShotTimer`]: a selectable one-shot interval for event loops.

pub mod error;
pub mod fieldvalues;
pub mod memory;
pub mod redis_store;
pub mod schema;
pub mod store;
pub mod table;
pub mod timer;

pub use error::{DbError, DbResult};
pub use fieldvalues::{fv, fv_get, fvs_contain, DbOp, FieldValue, FieldValues, KeyOpFieldValues};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{SharedStore, Store};
pub use table::{NotificationProducer, ProducerStateTable, SubscriberStateTable, Table};
pub use timer::OneShotTimer;
