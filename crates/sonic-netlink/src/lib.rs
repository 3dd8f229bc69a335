//! Kernel event sources for the synchronization agents.
//!
//! The agents consume decoded structured events, not raw netlink buffers.
//! This crate is the boundary: it owns the sockets and the codecs and hands
//! out plain Rust values.
//!
//! - [`rtnl`]: rtnetlink link/neighbor multicast groups and table dumps,
//!   decoded into [`rtnl::RtnlEvent`].
//! - [`conntrack`]: netfilter conntrack notifications decoded into
//!   [`conntrack::ConntrackEvent`], plus the write-back path used to pin
//!   UDP entries.
//! - [`fdb`]: typed RTM_NEWNEIGH/RTM_DELNEIGH writes against the kernel
//!   bridge FDB, replacing the historical `bridge fdb` shell-outs.
//!
//! Socket types are Linux-only; on other targets they are stub
//! implementations that never produce events, keeping the daemons
//! compilable for development hosts.

pub mod conntrack;
pub mod error;
pub mod fdb;
pub mod rtnl;

pub use conntrack::{ConntrackEvent, ConntrackSocket, CtMsgType, CtTuple};
pub use error::{NetlinkError, NetlinkResult};
pub use fdb::{FdbDest, FdbEntryType, KernelFdbWriter};
pub use rtnl::{LinkEvent, NeighEvent, RtnlEvent, RtnlSocket};
