//! Composite row key helpers.
//!
//! Database row keys are colon-delimited composites such as
//! `Vlan100:00:11:22:33:44:55` (VLAN name + MAC) or `Vlan100:10.0.0.1`
//! (VLAN name + VTEP). The VLAN part never contains a colon, so splitting at
//! the first delimiter is always well-defined even though MAC addresses
//! contain colons themselves.

use crate::{MacAddress, ParseError, VlanId};

/// Builds a `Vlan<id>:<mac>` row key.
pub fn vlan_mac_key(vlan: VlanId, mac: &MacAddress) -> String {
    format!("Vlan{}:{}", vlan.as_u16(), mac)
}

/// Builds a `Vlan<id>:<suffix>` row key from an already-formatted suffix
/// (VTEP address, MAC string).
pub fn vlan_key(vlan: VlanId, suffix: &str) -> String {
    format!("Vlan{}:{}", vlan.as_u16(), suffix)
}

/// Splits a composite key at the first colon into `(vlan_name, rest)`.
pub fn split_first(key: &str) -> Result<(&str, &str), ParseError> {
    key.split_once(':')
        .ok_or_else(|| ParseError::InvalidKey(key.to_string()))
}

/// Splits a `Vlan<id>:<mac>` key into its typed parts.
pub fn split_vlan_mac(key: &str) -> Result<(VlanId, MacAddress), ParseError> {
    let (vlan_name, mac) = split_first(key)?;
    Ok((VlanId::from_vlan_name(vlan_name)?, mac.parse()?))
}

/// Extracts the VLAN ID from a VXLAN netdevice name of the form
/// `<name>-<vlan-id>`. Returns `None` when the name carries no suffix.
pub fn vlan_from_ifname(ifname: &str) -> Option<VlanId> {
    let (_, suffix) = ifname.rsplit_once('-')?;
    suffix.parse::<u16>().ok().and_then(|id| VlanId::new(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_vlan_mac_key() {
        let vlan = VlanId::new(100).unwrap();
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(vlan_mac_key(vlan, &mac), "Vlan100:aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_split_first() {
        let (vlan, rest) = split_first("Vlan100:aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(vlan, "Vlan100");
        assert_eq!(rest, "aa:bb:cc:dd:ee:ff");
        assert!(split_first("Vlan100").is_err());
    }

    #[test]
    fn test_split_vlan_mac() {
        let (vlan, mac) = split_vlan_mac("Vlan200:00:11:22:33:44:55").unwrap();
        assert_eq!(vlan.as_u16(), 200);
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
        assert!(split_vlan_mac("Ethernet4:00:11:22:33:44:55").is_err());
    }

    #[test]
    fn test_vlan_from_ifname() {
        assert_eq!(vlan_from_ifname("vxlan-100").unwrap().as_u16(), 100);
        assert_eq!(vlan_from_ifname("vtep1-200").unwrap().as_u16(), 200);
        assert!(vlan_from_ifname("vxlan100").is_none());
        assert!(vlan_from_ifname("vxlan-notanum").is_none());
        assert!(vlan_from_ifname("vxlan-0").is_none());
    }
}
