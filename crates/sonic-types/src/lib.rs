//! Common types for the SONiC synchronization agents.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the syncd daemons:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`key`]: colon-delimited composite row key helpers (`Vlan100:<mac>`)

pub mod key;
mod mac;
mod vlan;

pub use mac::MacAddress;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid VLAN name: {0}")]
    InvalidVlanName(String),

    #[error("invalid row key: {0}")]
    InvalidKey(String),
}
