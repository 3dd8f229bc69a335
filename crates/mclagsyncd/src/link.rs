//! Peer message handling and database mediation.

use crate::error::Result;
use crate::protocol::{
    self, msg_type, sub_option, syncd_msg_type, tlv_bool, tlv_i32, DomainCfgRecord, FdbRecord,
    IfaceCfgRecord, RecordBatcher, TlvReader, UniqueIpCfgRecord, VlanMbrRecord, CFG_OPER_ADD,
    CFG_OPER_ATTR_DEL, CFG_OPER_DEL, CFG_OPER_UPDATE, FDB_OPER_ADD, FDB_OPER_DEL,
    FDB_RECORD_SIZE, FDB_TYPE_DYNAMIC, FDB_TYPE_STATIC,
};
use sonic_db::schema::{
    APP_ACL_RULE_TABLE_NAME, APP_ACL_TABLE_TABLE_NAME, APP_INTF_TABLE_NAME,
    APP_ISOLATION_GROUP_TABLE_NAME, APP_LAG_TABLE_NAME, APP_MCLAG_FDB_TABLE_NAME,
    APP_PORT_TABLE_NAME, APP_VXLAN_TUNNEL_TABLE_NAME, CFG_DEVICE_METADATA_TABLE_NAME,
    CFG_MCLAG_INTF_TABLE_NAME, CFG_MCLAG_TABLE_NAME, FLUSH_FDB_REQUEST_CHANNEL,
    STATE_MCLAG_LOCAL_INTF_TABLE_NAME, STATE_MCLAG_REMOTE_INTF_TABLE_NAME,
    STATE_MCLAG_TABLE_NAME,
};
use sonic_db::{
    fv, fv_get, DbOp, KeyOpFieldValues, NotificationProducer, ProducerStateTable, SharedStore,
    Table,
};
use sonic_types::{key, MacAddress};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Platform substrings with native isolation-group support.
const BRCM_PLATFORM_SUBSTRING: &str = "broadcom";
const BFN_PLATFORM_SUBSTRING: &str = "barefoot";

/// Prefixes selecting the table a learn-mode update lands in.
const PORTCHANNEL_PREFIX: &str = "PortChannel";
const VXLAN_TUNNEL_PREFIX: &str = "VTTNL";

const ISO_GROUP_KEY: &str = "MCLAG_ISO_GRP";
const ACL_NAME: &str = "mclag";
const ACL_RULE_NAME: &str = "mclag:mclag";

/// Subscription change requested by domain configuration processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainCfgEffect {
    /// First domain appeared: subscribe the domain-dependent tables.
    AddSelectables,
    /// Last domain removed: drop the domain-dependent subscriptions.
    DelSelectables,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DomainData {
    source_ip: String,
    peer_ip: String,
    peer_link: String,
    keepalive_interval: i32,
    session_timeout: i32,
}

impl Default for DomainData {
    fn default() -> Self {
        Self {
            source_ip: String::new(),
            peer_ip: String::new(),
            peer_link: String::new(),
            keepalive_interval: -1,
            session_timeout: -1,
        }
    }
}

/// The MCLAG peer link: inbound message handlers and outbound batch
/// encoders around one peer connection.
pub struct MclagLink {
    port_tbl: ProducerStateTable,
    lag_tbl: ProducerStateTable,
    tunnel_tbl: ProducerStateTable,
    intf_tbl: ProducerStateTable,
    fdb_tbl: ProducerStateTable,
    acl_table_tbl: ProducerStateTable,
    acl_rule_tbl: ProducerStateTable,
    iso_grp_tbl: ProducerStateTable,

    mclag_tbl: Table,
    mclag_local_intf_tbl: Table,
    mclag_remote_intf_tbl: Table,
    device_metadata_tbl: Table,
    mclag_cfg_tbl: Table,
    mclag_intf_cfg_tbl: Table,

    flush_fdb: NotificationProducer,

    domains: BTreeMap<u32, DomainData>,
    vlan_members: BTreeSet<(String, String)>,
    system_mac: String,
    is_iccp_up: bool,
    use_isolation_group: bool,
    acl_table_added: bool,
}

impl MclagLink {
    pub fn new(
        appl_store: SharedStore,
        state_store: SharedStore,
        config_store: SharedStore,
        platform: &str,
    ) -> Self {
        let use_isolation_group = platform.contains(BRCM_PLATFORM_SUBSTRING)
            || platform.contains(BFN_PLATFORM_SUBSTRING);
        Self {
            port_tbl: ProducerStateTable::new(appl_store.clone(), APP_PORT_TABLE_NAME),
            lag_tbl: ProducerStateTable::new(appl_store.clone(), APP_LAG_TABLE_NAME),
            tunnel_tbl: ProducerStateTable::new(appl_store.clone(), APP_VXLAN_TUNNEL_TABLE_NAME),
            intf_tbl: ProducerStateTable::new(appl_store.clone(), APP_INTF_TABLE_NAME),
            fdb_tbl: ProducerStateTable::new(appl_store.clone(), APP_MCLAG_FDB_TABLE_NAME),
            acl_table_tbl: ProducerStateTable::new(appl_store.clone(), APP_ACL_TABLE_TABLE_NAME),
            acl_rule_tbl: ProducerStateTable::new(appl_store.clone(), APP_ACL_RULE_TABLE_NAME),
            iso_grp_tbl: ProducerStateTable::new(
                appl_store.clone(),
                APP_ISOLATION_GROUP_TABLE_NAME,
            ),
            mclag_tbl: Table::new(state_store.clone(), STATE_MCLAG_TABLE_NAME),
            mclag_local_intf_tbl: Table::new(
                state_store.clone(),
                STATE_MCLAG_LOCAL_INTF_TABLE_NAME,
            ),
            mclag_remote_intf_tbl: Table::new(state_store, STATE_MCLAG_REMOTE_INTF_TABLE_NAME),
            device_metadata_tbl: Table::new(config_store.clone(), CFG_DEVICE_METADATA_TABLE_NAME),
            mclag_cfg_tbl: Table::new(config_store.clone(), CFG_MCLAG_TABLE_NAME),
            mclag_intf_cfg_tbl: Table::new(config_store, CFG_MCLAG_INTF_TABLE_NAME),
            flush_fdb: NotificationProducer::new(appl_store, FLUSH_FDB_REQUEST_CHANNEL),
            domains: BTreeMap::new(),
            vlan_members: BTreeSet::new(),
            system_mac: String::new(),
            is_iccp_up: false,
            use_isolation_group,
            acl_table_added: false,
        }
    }

    pub fn has_domains(&self) -> bool {
        !self.domains.is_empty()
    }

    /// Flushes every pipelined producer; called on event-loop return.
    pub async fn flush(&mut self) -> Result<()> {
        for producer in [
            &mut self.port_tbl,
            &mut self.lag_tbl,
            &mut self.tunnel_tbl,
            &mut self.intf_tbl,
            &mut self.fdb_tbl,
            &mut self.acl_table_tbl,
            &mut self.acl_rule_tbl,
            &mut self.iso_grp_tbl,
        ] {
            producer.flush().await?;
        }
        Ok(())
    }

    /// Reads the switch MAC from device metadata; fetched once per
    /// connection.
    pub async fn fetch_system_mac(&mut self) -> Result<()> {
        match self.device_metadata_tbl.hget("localhost", "mac").await? {
            Some(mac) => {
                info!(system_mac = %mac, "fetched system mac");
                self.system_mac = mac;
            }
            None => warn!("system mac missing from device metadata"),
        }
        Ok(())
    }

    /// Replays the MCLAG domain configuration as SET events, as done on
    /// every fresh peer connection.
    pub async fn fetch_mclag_config(
        &mut self,
    ) -> Result<(Vec<Vec<u8>>, Option<DomainCfgEffect>)> {
        let events = self.dump_as_set_events(&self.mclag_cfg_tbl.clone()).await?;
        Ok(self.process_mclag_domain_cfg(events))
    }

    /// Replays the MCLAG interface configuration as SET events.
    pub async fn fetch_mclag_interface_config(&mut self) -> Result<Vec<Vec<u8>>> {
        let events = self
            .dump_as_set_events(&self.mclag_intf_cfg_tbl.clone())
            .await?;
        self.send_mclag_iface_cfg(events).await
    }

    async fn dump_as_set_events(&self, table: &Table) -> Result<Vec<KeyOpFieldValues>> {
        let mut events = Vec::new();
        for table_key in table.get_keys().await? {
            if let Some(fields) = table.get(&table_key).await? {
                events.push(KeyOpFieldValues::set(table_key, fields));
            }
        }
        Ok(events)
    }

    /// Dispatches one framed peer message. Unknown types are ignored for
    /// forward compatibility.
    pub async fn handle_message(&mut self, message_type: u8, payload: &[u8]) -> Result<()> {
        match message_type {
            msg_type::PORT_ISOLATE => self.set_port_isolate(payload),
            msg_type::PORT_MAC_LEARN_MODE => self.set_port_mac_learn_mode(payload),
            msg_type::FLUSH_FDB => self.set_fdb_flush().await?,
            msg_type::SET_INTF_MAC => self.set_intf_mac(payload),
            msg_type::SET_FDB => self.set_fdb_entries(payload),
            msg_type::SET_TRAFFIC_DIST_ENABLE | msg_type::SET_TRAFFIC_DIST_DISABLE => {
                self.set_traffic_disable(payload, message_type)
            }
            msg_type::SET_ICCP_STATE => self.set_iccp_state(payload).await?,
            msg_type::SET_ICCP_ROLE => self.set_iccp_role(payload).await?,
            msg_type::SET_ICCP_SYSTEM_ID => self.set_iccp_system_id(payload).await?,
            msg_type::SET_ICCP_PEER_SYSTEM_ID => self.set_iccp_peer_system_id(payload).await?,
            msg_type::DEL_ICCP_INFO => self.del_iccp_info(payload).await?,
            msg_type::SET_REMOTE_IF_STATE => self.set_remote_if_state(payload).await?,
            msg_type::DEL_REMOTE_IF_INFO => self.del_remote_if_info(payload).await?,
            msg_type::SET_PEER_LINK_ISOLATION => self.set_peer_link_isolation(payload).await?,
            other => debug!(message_type = other, "unknown peer message ignored"),
        }
        Ok(())
    }

    fn set_port_isolate(&mut self, payload: &[u8]) {
        let mut tlvs = TlvReader::new(payload);
        let Some((sub_option::ISOLATE_SRC, src)) = tlvs.next() else {
            warn!("port isolate message without source sub-option");
            return;
        };
        let Some((sub_option::ISOLATE_DST, dst)) = tlvs.next() else {
            warn!("port isolate message without destination sub-option");
            return;
        };
        let src = String::from_utf8_lossy(src).into_owned();
        let dst = String::from_utf8_lossy(dst).into_owned();

        if self.use_isolation_group {
            self.set_isolation_group(&src, &dst);
        } else {
            self.set_isolation_acl(&src, &dst);
        }
    }

    fn set_isolation_group(&mut self, src: &str, dst: &str) {
        if dst.is_empty() {
            // All remote interfaces (or the ICCP session) went down. While
            // the session is up only the members are cleared; the group is
            // removed once the session itself is gone.
            if self.is_iccp_up {
                self.iso_grp_tbl.set(
                    ISO_GROUP_KEY,
                    vec![
                        fv("DESCRIPTION", "Isolation group for MCLAG"),
                        fv("TYPE", "bridge-port"),
                        fv("PORTS", src),
                        fv("MEMBERS", ""),
                    ],
                );
                info!("cleared all isolation group destination ports");
            } else {
                self.iso_grp_tbl.del(ISO_GROUP_KEY);
                info!("isolation group deleted");
            }
            return;
        }

        let members = join_filtered(dst, |p| !p.starts_with("Ethernet"));
        self.iso_grp_tbl.set(
            ISO_GROUP_KEY,
            vec![
                fv("DESCRIPTION", "Isolation group for MCLAG"),
                fv("TYPE", "bridge-port"),
                fv("PORTS", src),
                fv("MEMBERS", members.clone()),
            ],
        );
        info!(ports = src, members = %members, "isolation group updated");
    }

    fn set_isolation_acl(&mut self, src: &str, dst: &str) {
        if dst.is_empty() {
            self.acl_table_tbl.del(ACL_NAME);
            self.acl_table_added = false;
            info!(src, "port isolation acl removed");
            return;
        }

        if !self.acl_table_added {
            self.acl_table_tbl.set(
                ACL_NAME,
                vec![
                    fv("policy_desc", "Mclag egress port isolate acl"),
                    fv("type", "L3"),
                    fv("ports", src),
                ],
            );
            self.acl_table_added = true;
        }

        let out_ports = join_filtered(dst, |p| !p.starts_with(PORTCHANNEL_PREFIX));
        self.acl_rule_tbl.set(
            ACL_RULE_NAME,
            vec![
                fv("IP_TYPE", "ANY"),
                fv("OUT_PORTS", out_ports.clone()),
                fv("PACKET_ACTION", "DROP"),
            ],
        );
        info!(src, out_ports = %out_ports, "port isolation acl updated");
    }

    fn set_port_mac_learn_mode(&mut self, payload: &[u8]) {
        let Some((op_type, value)) = TlvReader::new(payload).next() else {
            warn!("mac learn mode message without sub-option");
            return;
        };
        let learn_mode = match op_type {
            sub_option::MAC_LEARN_ENABLE => "hardware",
            sub_option::MAC_LEARN_DISABLE => "disable",
            other => {
                warn!(op_type = other, "unexpected mac learn sub-option");
                return;
            }
        };
        let port = String::from_utf8_lossy(value).into_owned();
        let fields = vec![fv("learn_mode", learn_mode)];

        if port.starts_with(PORTCHANNEL_PREFIX) {
            self.lag_tbl.set(&port, fields);
        } else if port.starts_with(VXLAN_TUNNEL_PREFIX) {
            self.tunnel_tbl.set(&port, fields);
        } else {
            self.port_tbl.set(&port, fields);
        }
        info!(port = %port, learn_mode, "port mac learn mode set");
    }

    async fn set_fdb_flush(&mut self) -> Result<()> {
        info!("sending fdb flush notification");
        self.flush_fdb.send("ALL", "ALL", &Vec::new()).await?;
        Ok(())
    }

    fn set_intf_mac(&mut self, payload: &[u8]) {
        let mut intf_key = None;
        let mut mac_value = None;
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::SET_MAC_SRC => {
                    intf_key = Some(String::from_utf8_lossy(value).into_owned());
                }
                sub_option::SET_MAC_DST => {
                    mac_value = Some(String::from_utf8_lossy(value).into_owned());
                }
                other => warn!(op_type = other, "unexpected intf mac sub-option"),
            }
        }
        let (Some(intf_key), Some(mac_value)) = (intf_key, mac_value) else {
            warn!("intf mac message missing key or value");
            return;
        };
        info!(intf = %intf_key, mac = %mac_value, "interface mac set");
        self.intf_tbl.set(&intf_key, vec![fv("mac_addr", mac_value)]);
    }

    fn set_fdb_entries(&mut self, payload: &[u8]) {
        for chunk in payload.chunks_exact(FDB_RECORD_SIZE) {
            let Some(record) = FdbRecord::decode(chunk) else {
                continue;
            };
            let row_key = format!("Vlan{}:{}", record.vid, record.mac);
            match record.op {
                FDB_OPER_ADD => {
                    let fdb_type = match record.fdb_type {
                        FDB_TYPE_STATIC => "static",
                        _ => "dynamic",
                    };
                    info!(key = %row_key, port = %record.port_name, fdb_type, "mclag fdb add");
                    self.fdb_tbl.set(
                        &row_key,
                        vec![fv("port", record.port_name), fv("type", fdb_type)],
                    );
                }
                FDB_OPER_DEL => {
                    info!(key = %row_key, "mclag fdb del");
                    self.fdb_tbl.del(&row_key);
                }
                other => warn!(op = other, "unknown fdb record operation"),
            }
        }
    }

    fn set_traffic_disable(&mut self, payload: &[u8], message_type: u8) {
        let Some((sub_option::MCLAG_INTF_NAME, value)) = TlvReader::new(payload).next() else {
            warn!("traffic distribution message without interface sub-option");
            return;
        };
        let lag_name = String::from_utf8_lossy(value).into_owned();
        let disable = message_type == msg_type::SET_TRAFFIC_DIST_DISABLE;
        self.lag_tbl.set(
            &lag_name,
            vec![fv("traffic_disable", if disable { "true" } else { "false" })],
        );
        info!(lag = %lag_name, disable, "traffic distribution updated");
    }

    async fn set_iccp_state(&mut self, payload: &[u8]) -> Result<()> {
        let mut mlag_id = 0;
        let mut oper_up = None;
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::MCLAG_ID => mlag_id = tlv_i32(value),
                sub_option::OPER_STATUS => oper_up = Some(tlv_bool(value)),
                other => warn!(op_type = other, "unexpected iccp state sub-option"),
            }
        }
        let (true, Some(oper_up)) = (mlag_id > 0, oper_up) else {
            warn!(mlag_id, "invalid iccp state message");
            return Ok(());
        };
        self.is_iccp_up = oper_up;
        self.mclag_tbl
            .set(
                &mlag_id.to_string(),
                &vec![fv("oper_status", if oper_up { "up" } else { "down" })],
            )
            .await?;
        info!(mlag_id, oper_up, "iccp state updated");
        Ok(())
    }

    async fn set_iccp_role(&mut self, payload: &[u8]) -> Result<()> {
        let mut mlag_id = 0;
        let mut fields = Vec::new();
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::MCLAG_ID => mlag_id = tlv_i32(value),
                sub_option::ICCP_ROLE => {
                    fields.push(fv("role", if tlv_bool(value) { "active" } else { "standby" }));
                }
                sub_option::SYSTEM_ID => {
                    if let Some(mac) = MacAddress::from_slice(value) {
                        fields.push(fv("system_mac", mac.to_string()));
                    }
                }
                other => warn!(op_type = other, "unexpected iccp role sub-option"),
            }
        }
        if mlag_id <= 0 || fields.is_empty() {
            warn!(mlag_id, "invalid iccp role message");
            return Ok(());
        }
        self.mclag_tbl.set(&mlag_id.to_string(), &fields).await?;
        info!(mlag_id, "iccp role updated");
        Ok(())
    }

    async fn set_iccp_system_id(&mut self, payload: &[u8]) -> Result<()> {
        self.set_mac_field(payload, sub_option::SYSTEM_ID, "system_mac")
            .await
    }

    async fn set_iccp_peer_system_id(&mut self, payload: &[u8]) -> Result<()> {
        self.set_mac_field(payload, sub_option::PEER_SYSTEM_ID, "peer_mac")
            .await
    }

    async fn set_mac_field(&mut self, payload: &[u8], option: u8, field: &str) -> Result<()> {
        let mut mlag_id = 0;
        let mut mac = None;
        for (op_type, value) in TlvReader::new(payload) {
            if op_type == sub_option::MCLAG_ID {
                mlag_id = tlv_i32(value);
            } else if op_type == option {
                mac = MacAddress::from_slice(value);
            } else {
                warn!(op_type, "unexpected system id sub-option");
            }
        }
        let (true, Some(mac)) = (mlag_id > 0, mac) else {
            warn!(mlag_id, field, "invalid system id message");
            return Ok(());
        };
        self.mclag_tbl
            .set(&mlag_id.to_string(), &vec![fv(field, mac.to_string())])
            .await?;
        info!(mlag_id, field, mac = %mac, "system id updated");
        Ok(())
    }

    async fn del_iccp_info(&mut self, payload: &[u8]) -> Result<()> {
        let Some((sub_option::MCLAG_ID, value)) = TlvReader::new(payload).next() else {
            warn!("del iccp info message without mlag id");
            return Ok(());
        };
        let mlag_id = tlv_i32(value);
        self.mclag_tbl.del(&mlag_id.to_string()).await?;
        info!(mlag_id, "iccp info deleted");
        Ok(())
    }

    async fn set_remote_if_state(&mut self, payload: &[u8]) -> Result<()> {
        let mut mlag_id = 0;
        let mut lag_name = String::new();
        let mut oper_up = None;
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::MCLAG_ID => mlag_id = tlv_i32(value),
                sub_option::MCLAG_INTF_NAME => {
                    lag_name = String::from_utf8_lossy(value).into_owned();
                }
                sub_option::OPER_STATUS => oper_up = Some(tlv_bool(value)),
                other => warn!(op_type = other, "unexpected remote if sub-option"),
            }
        }
        let (true, false, Some(oper_up)) = (mlag_id > 0, lag_name.is_empty(), oper_up) else {
            warn!(mlag_id, lag = %lag_name, "invalid remote if state message");
            return Ok(());
        };
        let row_key = format!("{}|{}", mlag_id, lag_name);
        self.mclag_remote_intf_tbl
            .set(
                &row_key,
                &vec![fv("oper_status", if oper_up { "up" } else { "down" })],
            )
            .await?;
        info!(mlag_id, lag = %lag_name, oper_up, "remote interface state updated");
        Ok(())
    }

    async fn del_remote_if_info(&mut self, payload: &[u8]) -> Result<()> {
        let mut mlag_id = 0;
        let mut lag_name = String::new();
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::MCLAG_ID => mlag_id = tlv_i32(value),
                sub_option::MCLAG_INTF_NAME => {
                    lag_name = String::from_utf8_lossy(value).into_owned();
                }
                other => warn!(op_type = other, "unexpected remote if sub-option"),
            }
        }
        if mlag_id <= 0 || lag_name.is_empty() {
            warn!(mlag_id, "invalid remote if delete message");
            return Ok(());
        }
        let row_key = format!("{}|{}", mlag_id, lag_name);
        self.mclag_remote_intf_tbl.del(&row_key).await?;
        info!(mlag_id, lag = %lag_name, "remote interface info deleted");
        Ok(())
    }

    async fn set_peer_link_isolation(&mut self, payload: &[u8]) -> Result<()> {
        let mut ifname = String::new();
        let mut isolation = None;
        for (op_type, value) in TlvReader::new(payload) {
            match op_type {
                sub_option::MCLAG_ID => {}
                sub_option::MCLAG_INTF_NAME => {
                    ifname = String::from_utf8_lossy(value).into_owned();
                }
                sub_option::ISOLATION_STATE => isolation = Some(tlv_bool(value)),
                other => warn!(op_type = other, "unexpected isolation sub-option"),
            }
        }
        let (false, Some(enable)) = (ifname.is_empty(), isolation) else {
            warn!("invalid peer link isolation message");
            return Ok(());
        };
        self.mclag_local_intf_tbl
            .set(
                &ifname,
                &vec![fv(
                    "port_isolate_peer_link",
                    if enable { "true" } else { "false" },
                )],
            )
            .await?;
        info!(ifname = %ifname, enable, "peer link isolation updated");
        Ok(())
    }

    /// Encodes state-FDB events for the peer, batched per the frame bound.
    pub fn send_fdb_entries(&mut self, events: Vec<KeyOpFieldValues>) -> Vec<Vec<u8>> {
        let mut batcher = RecordBatcher::new(syncd_msg_type::FDB_OPERATION);
        for event in events {
            let Ok((vlan, mac)) = key::split_vlan_mac(&event.key) else {
                warn!(key = %event.key, "undecodable state fdb key");
                continue;
            };
            let fdb_type = match fv_get(&event.fields, "type") {
                Some("static") => FDB_TYPE_STATIC,
                _ => FDB_TYPE_DYNAMIC,
            };
            let record = FdbRecord {
                mac,
                vid: u32::from(vlan.as_u16()),
                port_name: fv_get(&event.fields, "port").unwrap_or_default().to_string(),
                fdb_type,
                op: match event.op {
                    DbOp::Set => FDB_OPER_ADD,
                    DbOp::Del => FDB_OPER_DEL,
                },
            };
            debug!(key = %event.key, op = record.op, "fdb update for peer");
            batcher.push(&record.encode());
        }
        batcher.finish()
    }

    /// Diffs MCLAG domain configuration events against the known domains
    /// and encodes the effective changes for the peer. A SET producing no
    /// effective diff emits nothing.
    pub fn process_mclag_domain_cfg(
        &mut self,
        events: Vec<KeyOpFieldValues>,
    ) -> (Vec<Vec<u8>>, Option<DomainCfgEffect>) {
        let had_domains = !self.domains.is_empty();
        let system_mac = self.system_mac.parse().unwrap_or(MacAddress::ZERO);
        let mut batcher = RecordBatcher::new(syncd_msg_type::CFG_MCLAG_DOMAIN);

        for event in events {
            let Ok(domain_id) = event.key.parse::<u32>() else {
                warn!(key = %event.key, "undecodable mclag domain key");
                continue;
            };

            let mut record = DomainCfgRecord {
                op: 0,
                domain_id,
                attr_bmap: 0,
                keepalive_interval: -1,
                session_timeout: -1,
                local_ip: String::new(),
                peer_ip: String::new(),
                peer_ifname: String::new(),
                system_mac,
            };

            match event.op {
                DbOp::Set => {
                    let existing = self.domains.get(&domain_id).cloned();
                    let mut data = existing.clone().unwrap_or_default();
                    let mut attr_bmap = 0u32;
                    let mut attr_del_bmap = 0u32;

                    for (field, value) in &event.fields {
                        match field.as_str() {
                            "source_ip" => diff_str_field(
                                &mut data.source_ip,
                                value,
                                existing.is_some(),
                                protocol::CFG_ATTR_SRC_ADDR,
                                &mut attr_bmap,
                                &mut attr_del_bmap,
                            ),
                            "peer_ip" => diff_str_field(
                                &mut data.peer_ip,
                                value,
                                existing.is_some(),
                                protocol::CFG_ATTR_PEER_ADDR,
                                &mut attr_bmap,
                                &mut attr_del_bmap,
                            ),
                            "peer_link" => diff_str_field(
                                &mut data.peer_link,
                                value,
                                existing.is_some(),
                                protocol::CFG_ATTR_PEER_LINK,
                                &mut attr_bmap,
                                &mut attr_del_bmap,
                            ),
                            "keepalive_interval" => diff_int_field(
                                &mut data.keepalive_interval,
                                value,
                                existing.is_some(),
                                protocol::CFG_ATTR_KEEPALIVE_INTERVAL,
                                &mut attr_bmap,
                                &mut attr_del_bmap,
                            ),
                            "session_timeout" => diff_int_field(
                                &mut data.session_timeout,
                                value,
                                existing.is_some(),
                                protocol::CFG_ATTR_SESSION_TIMEOUT,
                                &mut attr_bmap,
                                &mut attr_del_bmap,
                            ),
                            _ => {}
                        }
                    }

                    if attr_bmap == 0 && attr_del_bmap == 0 {
                        info!(domain_id, "domain config unchanged, notification suppressed");
                        continue;
                    }

                    record.op = if existing.is_none() {
                        CFG_OPER_ADD
                    } else if attr_del_bmap != 0 && attr_bmap == attr_del_bmap {
                        CFG_OPER_ATTR_DEL
                    } else {
                        CFG_OPER_UPDATE
                    };
                    record.attr_bmap = attr_bmap;
                    record.local_ip = data.source_ip.clone();
                    record.peer_ip = data.peer_ip.clone();
                    record.peer_ifname = data.peer_link.clone();
                    record.keepalive_interval = data.keepalive_interval;
                    record.session_timeout = data.session_timeout;

                    info!(
                        domain_id,
                        op = record.op,
                        attr_bmap,
                        "domain config change for peer"
                    );
                    self.domains.insert(domain_id, data);
                }
                DbOp::Del => {
                    if self.domains.remove(&domain_id).is_none() {
                        warn!(domain_id, "delete for unknown mclag domain");
                        continue;
                    }
                    record.op = CFG_OPER_DEL;
                    info!(domain_id, "domain deleted, notifying peer");
                }
            }

            batcher.push(&record.encode());
        }

        let effect = match (had_domains, self.domains.is_empty()) {
            (false, false) => Some(DomainCfgEffect::AddSelectables),
            (true, true) => Some(DomainCfgEffect::DelSelectables),
            _ => None,
        };
        (batcher.finish(), effect)
    }

    /// Encodes MCLAG interface configuration events for the peer; interface
    /// deletes also clear the interface's isolation state row.
    pub async fn send_mclag_iface_cfg(
        &mut self,
        events: Vec<KeyOpFieldValues>,
    ) -> Result<Vec<Vec<u8>>> {
        let mut batcher = RecordBatcher::new(syncd_msg_type::CFG_MCLAG_IFACE);
        for event in events {
            let Some((domain_id_str, ifname)) = event.key.split_once('|') else {
                warn!(key = %event.key, "undecodable mclag interface key");
                continue;
            };
            let Ok(domain_id) = domain_id_str.parse::<u32>() else {
                warn!(key = %event.key, "undecodable mclag interface domain");
                continue;
            };
            if ifname.is_empty() {
                warn!(key = %event.key, "mclag interface key without interface");
                continue;
            }

            let op = match event.op {
                DbOp::Set => CFG_OPER_ADD,
                DbOp::Del => {
                    self.mclag_local_intf_tbl.del(ifname).await?;
                    CFG_OPER_DEL
                }
            };
            let record = IfaceCfgRecord {
                op,
                domain_id,
                ifname: ifname.to_string(),
            };
            info!(domain_id, ifname = %ifname, op, "mclag interface change for peer");
            batcher.push(&record.encode());
        }
        Ok(batcher.finish())
    }

    /// Encodes MCLAG unique-IP configuration events for the peer.
    pub fn send_mclag_unique_ip_cfg(&mut self, events: Vec<KeyOpFieldValues>) -> Vec<Vec<u8>> {
        let mut batcher = RecordBatcher::new(syncd_msg_type::CFG_MCLAG_UNIQUE_IP);
        for event in events {
            let ifname = match event.key.split_once('|') {
                Some((_, ifname)) => ifname,
                None => event.key.as_str(),
            };
            if ifname.is_empty() {
                warn!(key = %event.key, "unique ip key without interface");
                continue;
            }
            let record = UniqueIpCfgRecord {
                op: match event.op {
                    DbOp::Set => CFG_OPER_ADD,
                    DbOp::Del => CFG_OPER_DEL,
                },
                ifname: ifname.to_string(),
            };
            info!(ifname = %ifname, op = record.op, "unique ip change for peer");
            batcher.push(&record.encode());
        }
        batcher.finish()
    }

    /// Tracks `(vlan, member)` tuples and encodes only real transitions;
    /// duplicate adds and deletes are suppressed.
    pub fn process_vlan_member(&mut self, events: Vec<KeyOpFieldValues>) -> Vec<Vec<u8>> {
        let mut batcher = RecordBatcher::new(syncd_msg_type::VLAN_MBR_UPDATES);
        for event in events {
            let Some((vlan_name, member)) = event.key.split_once('|') else {
                warn!(key = %event.key, "undecodable vlan member key");
                continue;
            };
            let Ok(vlan) = sonic_types::VlanId::from_vlan_name(vlan_name) else {
                warn!(key = %event.key, "undecodable vlan member vlan");
                continue;
            };
            let tuple = (vlan_name.to_string(), member.to_string());

            let op = match event.op {
                DbOp::Set => {
                    if !self.vlan_members.insert(tuple) {
                        debug!(key = %event.key, "duplicate vlan member add suppressed");
                        continue;
                    }
                    CFG_OPER_ADD
                }
                DbOp::Del => {
                    if !self.vlan_members.remove(&tuple) {
                        debug!(key = %event.key, "duplicate vlan member delete suppressed");
                        continue;
                    }
                    CFG_OPER_DEL
                }
            };
            let record = VlanMbrRecord {
                op,
                vid: u32::from(vlan.as_u16()),
                ifname: member.to_string(),
            };
            batcher.push(&record.encode());
        }
        batcher.finish()
    }
}

/// Splits a comma-separated port list, drops entries failing `keep`, and
/// rejoins.
fn join_filtered(list: &str, keep: impl Fn(&str) -> bool) -> String {
    list.split(',')
        .filter(|p| !p.is_empty() && keep(p))
        .collect::<Vec<_>>()
        .join(",")
}

fn diff_str_field(
    current: &mut String,
    new_value: &str,
    entry_exists: bool,
    bit: u32,
    attr_bmap: &mut u32,
    attr_del_bmap: &mut u32,
) {
    if !entry_exists {
        *attr_bmap |= bit;
        *current = new_value.to_string();
        return;
    }
    if current != new_value {
        *attr_bmap |= bit;
        if new_value.is_empty() {
            *attr_del_bmap |= bit;
        }
        *current = new_value.to_string();
    }
}

fn diff_int_field(
    current: &mut i32,
    new_value: &str,
    entry_exists: bool,
    bit: u32,
    attr_bmap: &mut u32,
    attr_del_bmap: &mut u32,
) {
    let parsed = if new_value.is_empty() {
        -1
    } else {
        new_value.parse().unwrap_or(-1)
    };
    if !entry_exists {
        *attr_bmap |= bit;
        *current = parsed;
        return;
    }
    if *current != parsed {
        *attr_bmap |= bit;
        if parsed == -1 {
            *attr_del_bmap |= bit;
        }
        *current = parsed;
    }
}
