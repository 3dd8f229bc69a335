//! Database indices and table name constants.
//!
//! Names match the C++ `schema.h` constants so rows written here are
//! consumed unchanged by the downstream orchestration agents.

/// Application database index.
pub const APPL_DB: i64 = 0;
/// Configuration database index.
pub const CONFIG_DB: i64 = 4;
/// State database index.
pub const STATE_DB: i64 = 6;

// APPL_DB tables.
pub const APP_VXLAN_FDB_TABLE_NAME: &str = "VXLAN_FDB_TABLE";
pub const APP_VXLAN_REMOTE_VNI_TABLE_NAME: &str = "VXLAN_REMOTE_VNI_TABLE";
pub const APP_NAT_TABLE_NAME: &str = "NAT_TABLE";
pub const APP_NAPT_TABLE_NAME: &str = "NAPT_TABLE";
pub const APP_NAT_TWICE_TABLE_NAME: &str = "NAT_TWICE_TABLE";
pub const APP_NAPT_TWICE_TABLE_NAME: &str = "NAPT_TWICE_TABLE";
pub const APP_NAPT_POOL_IP_TABLE_NAME: &str = "NAPT_POOL_IP_TABLE";
pub const APP_PORT_TABLE_NAME: &str = "PORT_TABLE";
pub const APP_LAG_TABLE_NAME: &str = "LAG_TABLE";
pub const APP_INTF_TABLE_NAME: &str = "INTF_TABLE";
pub const APP_MCLAG_FDB_TABLE_NAME: &str = "MCLAG_FDB_TABLE";
pub const APP_ISOLATION_GROUP_TABLE_NAME: &str = "ISOLATION_GROUP_TABLE";
pub const APP_ACL_TABLE_TABLE_NAME: &str = "ACL_TABLE";
pub const APP_ACL_RULE_TABLE_NAME: &str = "ACL_RULE";
pub const APP_VXLAN_TUNNEL_TABLE_NAME: &str = "VXLAN_TUNNEL_TABLE";

// STATE_DB tables.
pub const STATE_FDB_TABLE_NAME: &str = "FDB_TABLE";
pub const STATE_VLAN_MEMBER_TABLE_NAME: &str = "VLAN_MEMBER_TABLE";
pub const STATE_NAT_RESTORE_TABLE_NAME: &str = "NAT_RESTORE_TABLE";
pub const STATE_MCLAG_TABLE_NAME: &str = "MCLAG_TABLE";
pub const STATE_MCLAG_LOCAL_INTF_TABLE_NAME: &str = "MCLAG_LOCAL_INTF_TABLE";
pub const STATE_MCLAG_REMOTE_INTF_TABLE_NAME: &str = "MCLAG_REMOTE_INTF_TABLE";
pub const STATE_WARM_RESTART_TABLE_NAME: &str = "WARM_RESTART_TABLE";
pub const STATE_WARM_RESTART_ENABLE_TABLE_NAME: &str = "WARM_RESTART_ENABLE_TABLE";

// CONFIG_DB tables.
pub const CFG_VXLAN_EVPN_NVO_TABLE_NAME: &str = "VXLAN_EVPN_NVO";
pub const CFG_DEVICE_METADATA_TABLE_NAME: &str = "DEVICE_METADATA";
pub const CFG_MCLAG_TABLE_NAME: &str = "MCLAG_TABLE";
pub const CFG_MCLAG_INTF_TABLE_NAME: &str = "MCLAG_INTF_TABLE";
pub const CFG_MCLAG_UNIQUE_IP_TABLE_NAME: &str = "MCLAG_UNIQUE_IP_TABLE";
pub const CFG_WARM_RESTART_TABLE_NAME: &str = "WARM_RESTART";

/// Notification channel for FDB flush requests.
pub const FLUSH_FDB_REQUEST_CHANNEL: &str = "FLUSHFDBREQUEST";
