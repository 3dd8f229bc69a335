//! VLAN ID type with validation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier (1-4094).
///
/// VLAN 0 (priority tagged) and 4095 are reserved; valid range is 1-4094.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Minimum valid VLAN ID.
    pub const MIN: u16 = 1;

    /// Maximum valid VLAN ID.
    pub const MAX: u16 = 4094;

    /// Creates a new VLAN ID, rejecting values outside 1-4094.
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    /// Returns the numeric VLAN ID.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the SONiC interface name for this VLAN (`Vlan100`).
    pub fn to_vlan_name(&self) -> String {
        format!("Vlan{}", self.0)
    }

    /// Parses a SONiC VLAN interface name (`Vlan100`).
    pub fn from_vlan_name(name: &str) -> Result<Self, ParseError> {
        let id = name
            .strip_prefix("Vlan")
            .and_then(|n| n.parse::<u16>().ok())
            .ok_or_else(|| ParseError::InvalidVlanName(name.to_string()))?;
        Self::new(id)
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u16 = s.parse().map_err(|_| ParseError::InvalidVlanId(0))?;
        Self::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_valid_range() {
        assert!(VlanId::new(1).is_ok());
        assert!(VlanId::new(4094).is_ok());
        assert!(VlanId::new(0).is_err());
        assert!(VlanId::new(4095).is_err());
    }

    #[test]
    fn test_vlan_name_round_trip() {
        let vlan = VlanId::new(100).unwrap();
        assert_eq!(vlan.to_vlan_name(), "Vlan100");
        assert_eq!(VlanId::from_vlan_name("Vlan100").unwrap(), vlan);
    }

    #[test]
    fn test_invalid_vlan_name() {
        assert!(VlanId::from_vlan_name("Ethernet0").is_err());
        assert!(VlanId::from_vlan_name("Vlan").is_err());
        assert!(VlanId::from_vlan_name("Vlan70000").is_err());
    }
}
