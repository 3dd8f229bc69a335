//! NAT Synchronization Daemon for SONiC.
//!
//! natsyncd turns netfilter conntrack notifications into rows of the NAT
//! application tables. Each confirmed, NAT'd IPv4 TCP/UDP connection is
//! classified as basic SNAT/DNAT, SNAPT/DNAPT, Twice-NAT or Twice-NAPT and
//! published together with its reverse-direction row, so the dataplane can
//! translate both directions of the flow. Static entries configured by the
//! operator always take precedence over dynamic conntrack-derived ones.
//!
//! Aging of dynamic UDP entries is owned by the NAT application: freshly
//! added UDP connections are pinned in the kernel (`ASSURED`, 600 s) so
//! conntrack does not reap them prematurely.
//!
//! Across a warm restart all four tables reconcile through the shared
//! warm-restart cache, after the kernel conntrack table itself has been
//! restored (signaled through the state database).

pub mod error;
pub mod nat_sync;

pub use error::{NatSyncError, Result};
pub use nat_sync::{
    wait_for_nat_restore, wait_for_port_init, ConntrackApi, NatSync, NetlinkConntrackApi,
    DEFAULT_NATSYNC_WARMSTART_TIMER_SECS,
};
