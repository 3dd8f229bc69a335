//! FDB Synchronization Daemon for SONiC.
//!
//! fdbsyncd bridges kernel bridge-FDB state and the application database for
//! VXLAN/EVPN deployments:
//!
//! - kernel netlink neighbor events on VXLAN netdevices become
//!   `VXLAN_FDB_TABLE` rows (remote MACs) and `VXLAN_REMOTE_VNI_TABLE` rows
//!   (IMET routes, signaled as zero-MAC entries);
//! - locally learned MACs reported by the ASIC layer through the state
//!   database are reflected back into the kernel bridge FDB, gated by the
//!   EVPN NVO configuration;
//! - across a warm restart, both application tables reconcile through the
//!   shared warm-restart cache.

pub mod error;
pub mod fdb_sync;
pub mod kernel;

pub use error::{FdbSyncError, Result};
pub use fdb_sync::{FdbSync, DEFAULT_FDBSYNC_WARMSTART_TIMER_SECS};
pub use kernel::{KernelFdb, NetlinkKernelFdb};
