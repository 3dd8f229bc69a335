//! Core FDB synchronization engine.

use crate::error::Result;
use crate::kernel::KernelFdb;
use sonic_db::schema::{
    APP_VXLAN_FDB_TABLE_NAME, APP_VXLAN_REMOTE_VNI_TABLE_NAME,
};
use sonic_db::{fv, DbOp, FieldValues, KeyOpFieldValues, SharedStore};
use sonic_netlink::rtnl::{NUD_FAILED, NUD_INCOMPLETE, NUD_NOARP};
use sonic_netlink::{FdbEntryType, LinkEvent, NeighEvent, RtnlEvent};
use sonic_types::{key, MacAddress, VlanId};
use sonic_warm_restart::AppRestartAssist;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Default reconciliation window, seconds.
pub const DEFAULT_FDBSYNC_WARMSTART_TIMER_SECS: u32 = 30;

/// VXLAN netdevices backing vnet bridges carry this prefix and are not
/// EVPN-managed.
const VXLAN_BR_IF_NAME_PREFIX: &str = "Brvxlan";

#[derive(Debug, Clone)]
struct LocalFdbEntry {
    port: String,
    entry_type: FdbEntryType,
}

#[derive(Debug, Clone)]
struct VxlanFdbEntry {
    vtep: Ipv4Addr,
    entry_type: FdbEntryType,
    vni: u32,
    ifname: String,
}

#[derive(Debug, Clone)]
struct VxlanIntf {
    ifname: String,
    vni: u32,
}

/// FDB synchronization engine.
///
/// A given `(vlan, mac)` lives in at most one of `local_fdb` and
/// `vxlan_fdb`: a local learn evicts the remote entry from both the kernel
/// and the database, and a remote arrival for a locally owned key is
/// ignored.
pub struct FdbSync {
    restart: AppRestartAssist,
    kernel: Box<dyn KernelFdb>,
    local_fdb: HashMap<String, LocalFdbEntry>,
    vxlan_fdb: HashMap<String, VxlanFdbEntry>,
    imet_routes: HashMap<String, u32>,
    vxlan_intfs: HashMap<u32, VxlanIntf>,
    evpn_nvo_exists: bool,
}

impl FdbSync {
    /// Creates the engine and registers the VXLAN tables with the
    /// warm-restart cache.
    pub async fn new(
        appl_store: SharedStore,
        state_store: SharedStore,
        config_store: SharedStore,
        kernel: Box<dyn KernelFdb>,
    ) -> Result<Self> {
        let mut restart = AppRestartAssist::new(
            appl_store,
            state_store,
            config_store,
            "fdbsyncd",
            "swss",
            DEFAULT_FDBSYNC_WARMSTART_TIMER_SECS,
        )
        .await?;
        restart.register_table(APP_VXLAN_FDB_TABLE_NAME);
        restart.register_table(APP_VXLAN_REMOTE_VNI_TABLE_NAME);

        Ok(Self {
            restart,
            kernel,
            local_fdb: HashMap::new(),
            vxlan_fdb: HashMap::new(),
            imet_routes: HashMap::new(),
            vxlan_intfs: HashMap::new(),
            evpn_nvo_exists: false,
        })
    }

    pub fn restart(&self) -> &AppRestartAssist {
        &self.restart
    }

    pub fn restart_mut(&mut self) -> &mut AppRestartAssist {
        &mut self.restart
    }

    /// Flushes the pipelined database writes; called on event-loop return.
    pub async fn flush(&mut self) -> Result<()> {
        self.restart.flush().await?;
        Ok(())
    }

    /// Dispatches one decoded netlink event.
    pub fn handle_rtnl_event(&mut self, event: RtnlEvent) -> Result<()> {
        match event {
            RtnlEvent::NewLink(link) => self.on_link(link),
            RtnlEvent::NewNeigh(neigh) => self.on_neigh(neigh, false)?,
            RtnlEvent::DelNeigh(neigh) => self.on_neigh(neigh, true)?,
        }
        Ok(())
    }

    /// Records VXLAN netdevices so neighbor events can be classified.
    fn on_link(&mut self, link: LinkEvent) {
        let Some(vni) = link.vxlan_vni else {
            return;
        };
        debug!(ifname = %link.ifname, ifindex = link.ifindex, vni, "vxlan link");
        self.vxlan_intfs.insert(
            link.ifindex,
            VxlanIntf {
                ifname: link.ifname,
                vni,
            },
        );
    }

    fn on_neigh(&mut self, neigh: NeighEvent, is_delneigh: bool) -> Result<()> {
        if !neigh.is_bridge {
            return Ok(());
        }

        let Some(intf) = self.vxlan_intfs.get(&neigh.ifindex).cloned() else {
            // Not one of our VXLAN netdevices. A delete may be the kernel
            // aging out a locally learned MAC; re-assert it.
            if is_delneigh {
                if let Some(vlan) = neigh.vlan {
                    if self.evpn_nvo_exists {
                        self.mac_refresh(vlan, &neigh.mac);
                    }
                }
            }
            return Ok(());
        };

        if intf.ifname.contains(VXLAN_BR_IF_NAME_PREFIX) {
            return Ok(());
        }
        let Some(vlan) = key::vlan_from_ifname(&intf.ifname) else {
            return Ok(());
        };
        let Some(vtep) = neigh.dst else {
            return Ok(());
        };

        let delete_key =
            is_delneigh || neigh.state == NUD_INCOMPLETE || neigh.state == NUD_FAILED;
        let entry_type = if neigh.state & NUD_NOARP != 0 {
            FdbEntryType::Static
        } else {
            FdbEntryType::Dynamic
        };

        if neigh.mac.is_zero() {
            // Zero-MAC entries are IMET (EVPN type-3) routes.
            if !vtep.is_unspecified() {
                if delete_key {
                    self.imet_del_route(vtep, vlan, intf.vni)?;
                } else {
                    self.imet_add_route(vtep, vlan, intf.vni)?;
                }
            }
            return Ok(());
        }

        let row_key = key::vlan_mac_key(vlan, &neigh.mac);
        if delete_key {
            self.mac_del_vxlan(&row_key)?;
        } else {
            self.mac_add_vxlan(row_key, vtep, entry_type, intf.vni, intf.ifname)?;
        }
        Ok(())
    }

    fn imet_add_route(&mut self, vtep: Ipv4Addr, vlan: VlanId, vni: u32) -> Result<()> {
        let row_key = key::vlan_key(vlan, &vtep.to_string());
        if self.imet_routes.contains_key(&row_key) {
            debug!(key = %row_key, vni, "imet route already known");
            return Ok(());
        }
        self.imet_routes.insert(row_key.clone(), vni);

        info!(
            warm = self.restart.is_warm_start_in_progress(),
            key = %row_key,
            vni,
            "imet add route"
        );
        let fields = vec![fv("vni", vni.to_string())];
        if self.restart.is_warm_start_in_progress() {
            self.restart
                .insert_to_map(APP_VXLAN_REMOTE_VNI_TABLE_NAME, &row_key, fields, false);
        } else {
            self.restart
                .producer_set(APP_VXLAN_REMOTE_VNI_TABLE_NAME, &row_key, fields)?;
        }
        Ok(())
    }

    fn imet_del_route(&mut self, vtep: Ipv4Addr, vlan: VlanId, vni: u32) -> Result<()> {
        let row_key = key::vlan_key(vlan, &vtep.to_string());
        if self.imet_routes.remove(&row_key).is_none() {
            debug!(key = %row_key, vni, "imet route not known, nothing to delete");
            return Ok(());
        }

        info!(
            warm = self.restart.is_warm_start_in_progress(),
            key = %row_key,
            vni,
            "imet del route"
        );
        if self.restart.is_warm_start_in_progress() {
            let fields = vec![fv("vni", vni.to_string())];
            self.restart
                .insert_to_map(APP_VXLAN_REMOTE_VNI_TABLE_NAME, &row_key, fields, true);
        } else {
            self.restart
                .producer_del(APP_VXLAN_REMOTE_VNI_TABLE_NAME, &row_key)?;
        }
        Ok(())
    }

    fn mac_add_vxlan(
        &mut self,
        row_key: String,
        vtep: Ipv4Addr,
        entry_type: FdbEntryType,
        vni: u32,
        ifname: String,
    ) -> Result<()> {
        if self.local_fdb.contains_key(&row_key) {
            // Local learn wins over a remote advertisement.
            debug!(key = %row_key, "remote arrival for locally owned mac, ignored");
            return Ok(());
        }

        let fields = vxlan_fields(vtep, entry_type, vni);
        self.vxlan_fdb.insert(
            row_key.clone(),
            VxlanFdbEntry {
                vtep,
                entry_type,
                vni,
                ifname,
            },
        );

        if self.restart.is_warm_start_in_progress() {
            self.restart
                .insert_to_map(APP_VXLAN_FDB_TABLE_NAME, &row_key, fields, false);
            return Ok(());
        }
        info!(key = %row_key, vtep = %vtep, type_ = entry_type.as_str(), "vxlan fdb add");
        self.restart
            .producer_set(APP_VXLAN_FDB_TABLE_NAME, &row_key, fields)?;
        Ok(())
    }

    fn mac_del_vxlan(&mut self, row_key: &str) -> Result<()> {
        let Some(entry) = self.vxlan_fdb.remove(row_key) else {
            return Ok(());
        };

        if self.restart.is_warm_start_in_progress() {
            let fields = vxlan_fields(entry.vtep, entry.entry_type, entry.vni);
            self.restart
                .insert_to_map(APP_VXLAN_FDB_TABLE_NAME, row_key, fields, true);
            return Ok(());
        }
        info!(key = %row_key, vtep = %entry.vtep, "vxlan fdb del");
        self.restart.producer_del(APP_VXLAN_FDB_TABLE_NAME, row_key)?;
        Ok(())
    }

    /// Applies state-database FDB events (locally learned MACs from the
    /// ASIC layer).
    pub fn process_state_fdb(&mut self, events: Vec<KeyOpFieldValues>) -> Result<()> {
        for event in events {
            let Ok((vlan, mac)) = key::split_vlan_mac(&event.key) else {
                warn!(key = %event.key, "undecodable state fdb key");
                continue;
            };

            match event.op {
                DbOp::Set => {
                    let port = sonic_db::fv_get(&event.fields, "port")
                        .unwrap_or_default()
                        .to_string();
                    let entry_type = sonic_db::fv_get(&event.fields, "type")
                        .and_then(FdbEntryType::from_str)
                        .unwrap_or(FdbEntryType::Dynamic);
                    self.local_mac_add(&event.key, vlan, &mac, port, entry_type)?;
                }
                DbOp::Del => {
                    // Ignore deletes for keys this agent never learned.
                    if !self.local_fdb.contains_key(&event.key) {
                        debug!(key = %event.key, "state fdb del for unknown key");
                        continue;
                    }
                    self.local_mac_del(&event.key, vlan, &mac);
                }
            }
        }
        Ok(())
    }

    fn local_mac_add(
        &mut self,
        row_key: &str,
        vlan: VlanId,
        mac: &MacAddress,
        port: String,
        entry_type: FdbEntryType,
    ) -> Result<()> {
        self.local_fdb.insert(
            row_key.to_string(),
            LocalFdbEntry {
                port: port.clone(),
                entry_type,
            },
        );

        // A MAC previously advertised from a remote VTEP moved behind a
        // local port: evict the remote state from kernel and database.
        if let Some(remote) = self.vxlan_fdb.get(row_key).cloned() {
            info!(key = %row_key, vtep = %remote.vtep, "local learn evicts remote fdb entry");
            if let Err(e) = self
                .kernel
                .del_remote(mac, vlan.as_u16(), &remote.ifname, remote.vtep)
            {
                warn!(key = %row_key, error = %e, "kernel remote fdb delete failed");
            }
            self.mac_del_vxlan(row_key)?;
        }

        if !self.evpn_nvo_exists {
            debug!(key = %row_key, "evpn nvo absent, kernel untouched");
            return Ok(());
        }
        if port.is_empty() {
            debug!(key = %row_key, "no port on local fdb entry, kernel untouched");
            return Ok(());
        }
        if let Err(e) = self
            .kernel
            .replace_local(mac, vlan.as_u16(), &port, entry_type)
        {
            warn!(key = %row_key, error = %e, "kernel local fdb replace failed");
        }
        Ok(())
    }

    fn local_mac_del(&mut self, row_key: &str, vlan: VlanId, mac: &MacAddress) {
        let Some(entry) = self.local_fdb.remove(row_key) else {
            return;
        };
        if !self.evpn_nvo_exists {
            debug!(key = %row_key, "evpn nvo absent, kernel untouched");
            return;
        }
        if entry.port.is_empty() {
            return;
        }
        if let Err(e) = self.kernel.del_local(mac, vlan.as_u16(), &entry.port) {
            warn!(key = %row_key, error = %e, "kernel local fdb delete failed");
        }
    }

    /// Applies EVPN-NVO configuration events; toggling the gate replays the
    /// whole local FDB cache into or out of the kernel.
    pub fn process_cfg_evpn_nvo(&mut self, events: Vec<KeyOpFieldValues>) {
        for event in events {
            let previous = self.evpn_nvo_exists;
            self.evpn_nvo_exists = matches!(event.op, DbOp::Set);
            if previous != self.evpn_nvo_exists {
                info!(exists = self.evpn_nvo_exists, "evpn nvo gate changed");
                self.update_all_local_macs();
            }
        }
    }

    fn update_all_local_macs(&mut self) {
        let entries: Vec<(String, LocalFdbEntry)> = self
            .local_fdb
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (row_key, entry) in entries {
            let Ok((vlan, mac)) = key::split_vlan_mac(&row_key) else {
                warn!(key = %row_key, "undecodable local fdb key");
                continue;
            };
            if entry.port.is_empty() {
                debug!(key = %row_key, "no port on local fdb entry, skipped");
                continue;
            }
            let result = if self.evpn_nvo_exists {
                self.kernel
                    .replace_local(&mac, vlan.as_u16(), &entry.port, entry.entry_type)
            } else {
                self.kernel.del_local(&mac, vlan.as_u16(), &entry.port)
            };
            if let Err(e) = result {
                warn!(key = %row_key, error = %e, "kernel local fdb replay failed");
            }
        }
    }

    /// Re-asserts a locally learned MAC the kernel aged out while the
    /// database still holds it.
    fn mac_refresh(&mut self, vlan: u16, mac: &MacAddress) {
        let row_key = match VlanId::new(vlan) {
            Ok(v) => key::vlan_mac_key(v, mac),
            Err(_) => return,
        };
        let Some(entry) = self.local_fdb.get(&row_key).cloned() else {
            return;
        };
        if entry.port.is_empty() {
            debug!(key = %row_key, "no port on local fdb entry, refresh skipped");
            return;
        }
        info!(key = %row_key, port = %entry.port, "re-asserting aged-out local mac");
        if let Err(e) = self
            .kernel
            .replace_local(mac, vlan, &entry.port, entry.entry_type)
        {
            warn!(key = %row_key, error = %e, "kernel local fdb refresh failed");
        }
    }
}

fn vxlan_fields(vtep: Ipv4Addr, entry_type: FdbEntryType, vni: u32) -> FieldValues {
    vec![
        fv("remote_vtep", vtep.to_string()),
        fv("type", entry_type.as_str()),
        fv("vni", vni.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{KernelLog, KernelOp, RecordingKernelFdb};
    use pretty_assertions::assert_eq;
    use sonic_db::schema::STATE_WARM_RESTART_ENABLE_TABLE_NAME;
    use sonic_db::{MemoryStore, Store};
    use std::sync::Arc;

    struct Fixture {
        appl: Arc<MemoryStore>,
        sync: FdbSync,
        kernel: KernelLog,
    }

    async fn fixture() -> Fixture {
        fixture_inner(false).await
    }

    async fn warm_fixture() -> Fixture {
        fixture_inner(true).await
    }

    async fn fixture_inner(warm: bool) -> Fixture {
        let appl = Arc::new(MemoryStore::new());
        let state = Arc::new(MemoryStore::new());
        let config = Arc::new(MemoryStore::new());
        if warm {
            state
                .set(
                    STATE_WARM_RESTART_ENABLE_TABLE_NAME,
                    "swss",
                    &[fv("enable", "true")],
                )
                .await
                .unwrap();
        }
        let (kernel, log) = RecordingKernelFdb::new();
        let sync = FdbSync::new(appl.clone(), state, config, Box::new(kernel))
            .await
            .unwrap();
        Fixture {
            appl,
            sync,
            kernel: log,
        }
    }

    fn vxlan_link(ifindex: u32, ifname: &str, vni: u32) -> RtnlEvent {
        RtnlEvent::NewLink(LinkEvent {
            ifindex,
            ifname: ifname.to_string(),
            vxlan_vni: Some(vni),
        })
    }

    fn neigh(ifindex: u32, mac: &str, dst: &str, state: u16) -> NeighEvent {
        NeighEvent {
            ifindex,
            is_bridge: true,
            mac: mac.parse().unwrap(),
            dst: Some(dst.parse().unwrap()),
            state,
            vlan: None,
        }
    }

    #[tokio::test]
    async fn test_imet_add() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(7, "vxlan-200", 2000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                7,
                "00:00:00:00:00:00",
                "10.0.0.2",
                sonic_netlink::rtnl::NUD_NOARP,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();

        let row = fx
            .appl
            .get(APP_VXLAN_REMOTE_VNI_TABLE_NAME, "Vlan200:10.0.0.2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, vec![fv("vni", "2000")]);
    }

    #[tokio::test]
    async fn test_imet_del_of_unknown_route_is_noop() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(7, "vxlan-200", 2000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::DelNeigh(neigh(
                7,
                "00:00:00:00:00:00",
                "10.0.0.2",
                0,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx
            .appl
            .get(APP_VXLAN_REMOTE_VNI_TABLE_NAME, "Vlan200:10.0.0.2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remote_fdb_add_and_del() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vtep1-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();

        let row = fx
            .appl
            .get(APP_VXLAN_FDB_TABLE_NAME, "Vlan100:aa:bb:cc:dd:ee:ff")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            row,
            vec![
                fv("remote_vtep", "10.0.0.1"),
                fv("type", "dynamic"),
                fv("vni", "1000"),
            ]
        );

        fx.sync
            .handle_rtnl_event(RtnlEvent::DelNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                0,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx
            .appl
            .get(APP_VXLAN_FDB_TABLE_NAME, "Vlan100:aa:bb:cc:dd:ee:ff")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_noarp_state_becomes_static() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vtep1-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:01",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_NOARP,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        let row = fx
            .appl
            .get(APP_VXLAN_FDB_TABLE_NAME, "Vlan100:aa:bb:cc:dd:ee:01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sonic_db::fv_get(&row, "type"), Some("static"));
    }

    #[tokio::test]
    async fn test_failed_state_deletes() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vtep1-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:02",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:02",
                "10.0.0.1",
                NUD_FAILED,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx
            .appl
            .get(APP_VXLAN_FDB_TABLE_NAME, "Vlan100:aa:bb:cc:dd:ee:02")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ifname_without_vlan_suffix_discarded() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vxlan100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_VXLAN_FDB_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_reserved_bridge_prefix_skipped() {
        let mut fx = fixture().await;
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "Brvxlan-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_VXLAN_FDB_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_remote_to_local_takeover() {
        let mut fx = fixture().await;
        // Remote entry exists.
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vxlan-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();

        // EVPN NVO configured.
        fx.sync
            .process_cfg_evpn_nvo(vec![KeyOpFieldValues::set("nvo1", vec![])]);

        // Local learn arrives from the ASIC layer.
        fx.sync
            .process_state_fdb(vec![KeyOpFieldValues::set(
                "Vlan100:aa:bb:cc:dd:ee:ff",
                vec![fv("port", "Ethernet4"), fv("type", "dynamic")],
            )])
            .unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx
            .appl
            .get(APP_VXLAN_FDB_TABLE_NAME, "Vlan100:aa:bb:cc:dd:ee:ff")
            .await
            .unwrap()
            .is_none());

        let log = fx.kernel.lock().unwrap();
        assert!(log.contains(&KernelOp::DelRemote {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            vlan: 100,
            ifname: "vxlan-100".into(),
            vtep: "10.0.0.1".parse().unwrap(),
        }));
        assert!(log.contains(&KernelOp::ReplaceLocal {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            vlan: 100,
            port: "Ethernet4".into(),
            entry_type: FdbEntryType::Dynamic,
        }));
    }

    #[tokio::test]
    async fn test_remote_arrival_for_local_mac_ignored() {
        let mut fx = fixture().await;
        fx.sync
            .process_state_fdb(vec![KeyOpFieldValues::set(
                "Vlan100:aa:bb:cc:dd:ee:ff",
                vec![fv("port", "Ethernet4"), fv("type", "dynamic")],
            )])
            .unwrap();

        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vxlan-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx.appl.dump(APP_VXLAN_FDB_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_nvo_gate_blocks_kernel_until_enabled() {
        let mut fx = fixture().await;
        fx.sync
            .process_state_fdb(vec![KeyOpFieldValues::set(
                "Vlan100:aa:bb:cc:dd:ee:ff",
                vec![fv("port", "Ethernet4"), fv("type", "static")],
            )])
            .unwrap();
        assert!(fx.kernel.lock().unwrap().is_empty());

        // Gate opens: the cached entry is replayed into the kernel.
        fx.sync
            .process_cfg_evpn_nvo(vec![KeyOpFieldValues::set("nvo1", vec![])]);
        assert_eq!(
            fx.kernel.lock().unwrap().as_slice(),
            &[KernelOp::ReplaceLocal {
                mac: "aa:bb:cc:dd:ee:ff".into(),
                vlan: 100,
                port: "Ethernet4".into(),
                entry_type: FdbEntryType::Static,
            }]
        );

        // Gate closes: the entry is withdrawn.
        fx.sync
            .process_cfg_evpn_nvo(vec![KeyOpFieldValues::del("nvo1")]);
        assert_eq!(
            fx.kernel.lock().unwrap().last().unwrap(),
            &KernelOp::DelLocal {
                mac: "aa:bb:cc:dd:ee:ff".into(),
                vlan: 100,
                port: "Ethernet4".into(),
            }
        );

        // Rapid re-enable replays again.
        fx.sync
            .process_cfg_evpn_nvo(vec![KeyOpFieldValues::set("nvo1", vec![])]);
        assert_eq!(fx.kernel.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_kernel_aging_triggers_refresh() {
        let mut fx = fixture().await;
        fx.sync
            .process_cfg_evpn_nvo(vec![KeyOpFieldValues::set("nvo1", vec![])]);
        fx.sync
            .process_state_fdb(vec![KeyOpFieldValues::set(
                "Vlan100:aa:bb:cc:dd:ee:ff",
                vec![fv("port", "Ethernet4"), fv("type", "dynamic")],
            )])
            .unwrap();
        fx.kernel.lock().unwrap().clear();

        // DELNEIGH on a non-VXLAN bridge interface for a MAC still in the
        // local cache.
        fx.sync
            .handle_rtnl_event(RtnlEvent::DelNeigh(NeighEvent {
                ifindex: 42,
                is_bridge: true,
                mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
                dst: None,
                state: 0,
                vlan: Some(100),
            }))
            .unwrap();

        assert_eq!(
            fx.kernel.lock().unwrap().as_slice(),
            &[KernelOp::ReplaceLocal {
                mac: "aa:bb:cc:dd:ee:ff".into(),
                vlan: 100,
                port: "Ethernet4".into(),
                entry_type: FdbEntryType::Dynamic,
            }]
        );
    }

    #[tokio::test]
    async fn test_warm_restart_routes_through_cache() {
        let mut fx = warm_fixture().await;
        assert!(fx.sync.restart().is_warm_start_in_progress());

        // Preexisting row from before the restart.
        fx.appl
            .set(
                APP_VXLAN_FDB_TABLE_NAME,
                "Vlan100:aa:bb:cc:dd:ee:ff",
                &[
                    fv("remote_vtep", "10.0.0.1"),
                    fv("type", "dynamic"),
                    fv("vni", "1000"),
                ],
            )
            .await
            .unwrap();
        fx.sync.restart_mut().read_tables_to_map().await.unwrap();

        // Same event re-learned during the window: no mutation on reconcile.
        fx.sync
            .handle_rtnl_event(vxlan_link(9, "vxlan-100", 1000))
            .unwrap();
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:ff",
                "10.0.0.1",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        // A second, new remote MAC appears during the window.
        fx.sync
            .handle_rtnl_event(RtnlEvent::NewNeigh(neigh(
                9,
                "aa:bb:cc:dd:ee:01",
                "10.0.0.9",
                sonic_netlink::rtnl::NUD_REACHABLE,
            )))
            .unwrap();
        fx.sync.flush().await.unwrap();

        fx.sync.restart_mut().reconcile().await.unwrap();
        assert!(!fx.sync.restart().is_warm_start_in_progress());

        let rows = fx.appl.dump(APP_VXLAN_FDB_TABLE_NAME);
        assert_eq!(rows.len(), 2);
        assert!(rows.contains_key("Vlan100:aa:bb:cc:dd:ee:ff"));
        assert!(rows.contains_key("Vlan100:aa:bb:cc:dd:ee:01"));
    }
}
