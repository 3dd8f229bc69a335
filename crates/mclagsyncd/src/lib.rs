//! MCLAG Synchronization Daemon for SONiC.
//!
//! mclagsyncd mediates between the ICCP peer daemon and the switch-state
//! database over a length-framed TCP connection on loopback. Inbound peer
//! messages drive application and state tables (MCLAG FDB entries, port
//! isolation, MAC learn modes, ICCP session state); outbound messages carry
//! batched FDB updates, MCLAG domain/interface configuration diffs and VLAN
//! membership transitions back to the peer.

pub mod error;
pub mod link;
pub mod protocol;

pub use error::{McLagError, Result};
pub use link::{DomainCfgEffect, MclagLink};
