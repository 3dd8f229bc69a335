//! Core NAT synchronization engine.

use crate::error::{NatSyncError, Result};
use sonic_db::schema::{
    APP_NAPT_POOL_IP_TABLE_NAME, APP_NAPT_TABLE_NAME, APP_NAPT_TWICE_TABLE_NAME,
    APP_NAT_TABLE_NAME, APP_NAT_TWICE_TABLE_NAME, APP_PORT_TABLE_NAME,
    STATE_NAT_RESTORE_TABLE_NAME,
};
use sonic_db::{fv, fv_get, FieldValues, SharedStore, Table};
use sonic_netlink::conntrack::{
    ConntrackEvent, CtMsgType, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPS_ASSURED,
    IPS_CONFIRMED, IPS_DST_NAT_DONE, IPS_SEEN_REPLY, IPS_SRC_NAT_DONE,
};
use sonic_netlink::{ConntrackSocket, NetlinkResult};
use sonic_warm_restart::AppRestartAssist;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default reconciliation window, seconds.
pub const DEFAULT_NATSYNC_WARMSTART_TIMER_SECS: u32 = 30;

/// Time to wait for the kernel conntrack restore to finish, seconds.
pub const RESTORE_NAT_WAIT_TIMEOUT_SECS: u64 = 120;

/// Conntrack timeout applied to application-owned UDP entries, seconds.
const CT_UDP_EXPIRY_TIMEOUT_SECS: u32 = 600;

/// Kernel conntrack write-back interface; each call blocks until the kernel
/// acks.
pub trait ConntrackApi: Send {
    /// Rewrites status and timeout of an existing connection.
    fn update_entry(
        &mut self,
        event: &ConntrackEvent,
        status: u32,
        timeout_secs: u32,
    ) -> NetlinkResult<()>;
}

/// Production implementation over the conntrack socket.
pub struct NetlinkConntrackApi {
    socket: ConntrackSocket,
}

impl NetlinkConntrackApi {
    pub fn new(socket: ConntrackSocket) -> Self {
        Self { socket }
    }
}

impl ConntrackApi for NetlinkConntrackApi {
    fn update_entry(
        &mut self,
        event: &ConntrackEvent,
        status: u32,
        timeout_secs: u32,
    ) -> NetlinkResult<()> {
        self.socket.update_entry(event, status, timeout_secs)
    }
}

/// The tuple pair of one admissible conntrack notification.
#[derive(Debug, Clone, Copy)]
struct NaptEntry {
    protocol: u8,
    orig_src: Ipv4Addr,
    orig_src_port: u16,
    orig_dst: Ipv4Addr,
    orig_dst_port: u16,
    nat_src: Ipv4Addr,
    nat_src_port: u16,
    nat_dst: Ipv4Addr,
    nat_dst_port: u16,
    status: u32,
}

/// Whether a classification pass actually published/deleted rows or bailed
/// out (static precedence, duplicate, loopback guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publish {
    Done,
    Skipped,
}

/// What an existing check-table row says about precedence.
enum CheckResult {
    Absent,
    Dynamic,
    Static,
}

/// NAT synchronization engine.
///
/// Every dynamic row is published together with a reverse-direction row in
/// the same table (swapped addresses, swapped `nat_type`); the pair is also
/// deleted together.
pub struct NatSync {
    restart: AppRestartAssist,
    conntrack: Box<dyn ConntrackApi>,
    nat_check: Table,
    napt_check: Table,
    twice_nat_check: Table,
    twice_napt_check: Table,
    napt_pool_check: Table,
}

impl NatSync {
    /// Creates the engine and registers the four NAT tables with the
    /// warm-restart cache.
    pub async fn new(
        appl_store: SharedStore,
        state_store: SharedStore,
        config_store: SharedStore,
        conntrack: Box<dyn ConntrackApi>,
    ) -> Result<Self> {
        let mut restart = AppRestartAssist::new(
            appl_store.clone(),
            state_store,
            config_store,
            "natsyncd",
            "nat",
            DEFAULT_NATSYNC_WARMSTART_TIMER_SECS,
        )
        .await?;
        restart.register_table(APP_NAT_TABLE_NAME);
        restart.register_table(APP_NAPT_TABLE_NAME);
        restart.register_table(APP_NAT_TWICE_TABLE_NAME);
        restart.register_table(APP_NAPT_TWICE_TABLE_NAME);

        Ok(Self {
            restart,
            conntrack,
            nat_check: Table::new(appl_store.clone(), APP_NAT_TABLE_NAME),
            napt_check: Table::new(appl_store.clone(), APP_NAPT_TABLE_NAME),
            twice_nat_check: Table::new(appl_store.clone(), APP_NAT_TWICE_TABLE_NAME),
            twice_napt_check: Table::new(appl_store.clone(), APP_NAPT_TWICE_TABLE_NAME),
            napt_pool_check: Table::new(appl_store, APP_NAPT_POOL_IP_TABLE_NAME),
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

    /// Processes one conntrack notification.
    pub async fn handle_conntrack_event(&mut self, ct: ConntrackEvent) -> Result<()> {
        let Some(entry) = admit(&ct) else {
            return Ok(());
        };

        match ct.msg_type {
            CtMsgType::New => {
                if entry.protocol == IPPROTO_TCP && entry.status & IPS_ASSURED != 0 {
                    self.add_nat_entry(&entry, true).await?;
                } else if entry.protocol == IPPROTO_UDP {
                    if self.add_nat_entry(&entry, true).await? == Publish::Done
                        && entry.status & IPS_ASSURED == 0
                    {
                        // The application owns aging for NAT UDP flows; pin
                        // the kernel entry so it is not reaped early.
                        let status = entry.status | IPS_SEEN_REPLY | IPS_ASSURED;
                        if let Err(e) =
                            self.conntrack
                                .update_entry(&ct, status, CT_UDP_EXPIRY_TIMEOUT_SECS)
                        {
                            warn!(error = %e, "conntrack udp pin failed");
                        }
                    }
                }
            }
            CtMsgType::Delete => {
                if entry.status & IPS_ASSURED != 0 {
                    self.add_nat_entry(&entry, false).await?;
                }
            }
        }
        Ok(())
    }

    async fn check(table: &Table, key: &str) -> Result<CheckResult> {
        match table.get(key).await? {
            None => Ok(CheckResult::Absent),
            Some(fields) => {
                if fv_get(&fields, "entry_type") == Some("static") {
                    Ok(CheckResult::Static)
                } else {
                    Ok(CheckResult::Dynamic)
                }
            }
        }
    }

    async fn snapt_pool_exists(&self, nat_ip: Ipv4Addr) -> Result<bool> {
        Ok(self
            .napt_pool_check
            .get(&nat_ip.to_string())
            .await?
            .is_some())
    }

    async fn snapt_entry_exists(&self, entry: &NaptEntry) -> Result<bool> {
        let key = format!("{}:{}", entry.orig_src, entry.orig_src_port);
        let reverse = format!("{}:{}", entry.nat_src, entry.nat_src_port);
        Ok(self.napt_check.get(&key).await?.is_some()
            || self.napt_check.get(&reverse).await?.is_some())
    }

    async fn dnapt_entry_exists(&self, entry: &NaptEntry) -> Result<bool> {
        let key = format!("{}:{}", entry.orig_dst, entry.orig_dst_port);
        let reverse = format!("{}:{}", entry.nat_dst, entry.nat_dst_port);
        Ok(self.napt_check.get(&key).await?.is_some()
            || self.napt_check.get(&reverse).await?.is_some())
    }

    /// Classifies one admitted event and publishes (or deletes) the forward
    /// and reverse rows.
    async fn add_nat_entry(&mut self, entry: &NaptEntry, add: bool) -> Result<Publish> {
        let src_ip_natted = entry.orig_src != entry.nat_src;
        let dst_ip_natted = entry.orig_dst != entry.nat_dst;
        let mut src_port_natted = src_ip_natted
            && (entry.orig_src_port != entry.nat_src_port
                || self.snapt_pool_exists(entry.nat_src).await?
                || self.snapt_entry_exists(entry).await?);
        let mut dst_port_natted = dst_ip_natted
            && (entry.orig_dst_port != entry.nat_dst_port
                || self.dnapt_entry_exists(entry).await?);

        debug!(
            src_ip_natted,
            dst_ip_natted, src_port_natted, dst_port_natted, add, "classification flags"
        );

        if src_ip_natted && dst_ip_natted {
            self.handle_twice_nat(entry, add, &mut src_port_natted, &mut dst_port_natted)
                .await
        } else if src_ip_natted {
            self.handle_snat(entry, add, src_port_natted).await
        } else if dst_ip_natted {
            self.handle_dnat(entry, add, dst_port_natted).await
        } else {
            Ok(Publish::Skipped)
        }
    }

    async fn handle_twice_nat(
        &mut self,
        entry: &NaptEntry,
        add: bool,
        src_port_natted: &mut bool,
        dst_port_natted: &mut bool,
    ) -> Result<Publish> {
        let mut fwd = FieldValues::new();
        let mut rev = FieldValues::new();
        if add {
            fwd = vec![
                fv("entry_type", "dynamic"),
                fv("translated_src_ip", entry.nat_src.to_string()),
                fv("translated_dst_ip", entry.nat_dst.to_string()),
            ];
            rev = vec![
                fv("entry_type", "dynamic"),
                fv("translated_src_ip", entry.orig_dst.to_string()),
                fv("translated_dst_ip", entry.orig_src.to_string()),
            ];
        }

        let nat_key = format!("{}:{}", entry.orig_src, entry.orig_dst);
        let nat_reverse_key = format!("{}:{}", entry.nat_dst, entry.nat_src);

        match Self::check(&self.twice_nat_check, &nat_key).await? {
            CheckResult::Absent => {}
            existing => {
                // The dataplane already translates both addresses for this
                // pair; the port flags are meaningless here.
                *src_port_natted = false;
                *dst_port_natted = false;
                if matches!(existing, CheckResult::Static) {
                    info!(key = %nat_key, "static twice-nat entry exists, dynamic event ignored");
                    if self.restart.is_warm_start_in_progress() {
                        self.restart
                            .insert_to_map(APP_NAT_TWICE_TABLE_NAME, &nat_key, fwd, !add);
                        self.restart.insert_to_map(
                            APP_NAT_TWICE_TABLE_NAME,
                            &nat_reverse_key,
                            rev,
                            !add,
                        );
                    }
                    return Ok(Publish::Skipped);
                }
                if add {
                    info!(key = %nat_key, "duplicate twice-nat notification ignored");
                    return Ok(Publish::Skipped);
                }
            }
        }

        if *src_port_natted || *dst_port_natted {
            let proto = proto_prefix(entry.protocol);
            let key = format!(
                "{}{}:{}:{}:{}",
                proto, entry.orig_src, entry.orig_src_port, entry.orig_dst, entry.orig_dst_port
            );
            let reverse_key = format!(
                "{}{}:{}:{}:{}",
                proto, entry.nat_dst, entry.nat_dst_port, entry.nat_src, entry.nat_src_port
            );

            match Self::check(&self.twice_napt_check, &key).await? {
                CheckResult::Static => {
                    info!(key = %key, "static twice-napt entry exists, dynamic event ignored");
                    if self.restart.is_warm_start_in_progress() {
                        self.restart
                            .insert_to_map(APP_NAPT_TWICE_TABLE_NAME, &key, fwd, !add);
                        self.restart
                            .insert_to_map(APP_NAPT_TWICE_TABLE_NAME, &reverse_key, rev, !add);
                    }
                    return Ok(Publish::Skipped);
                }
                CheckResult::Dynamic if add => {
                    info!(key = %key, "duplicate twice-napt notification ignored");
                    return Ok(Publish::Skipped);
                }
                _ => {}
            }

            if add {
                fwd.push(fv("translated_src_l4_port", entry.nat_src_port.to_string()));
                fwd.push(fv("translated_dst_l4_port", entry.nat_dst_port.to_string()));
                rev.push(fv("translated_src_l4_port", entry.orig_dst_port.to_string()));
                rev.push(fv("translated_dst_l4_port", entry.orig_src_port.to_string()));
            }
            self.publish_pair(APP_NAPT_TWICE_TABLE_NAME, add, &key, fwd, &reverse_key, rev)?;
        } else {
            self.publish_pair(
                APP_NAT_TWICE_TABLE_NAME,
                add,
                &nat_key,
                fwd,
                &nat_reverse_key,
                rev,
            )?;
        }
        Ok(Publish::Done)
    }

    async fn handle_snat(
        &mut self,
        entry: &NaptEntry,
        add: bool,
        src_port_natted: bool,
    ) -> Result<Publish> {
        let mut fwd = FieldValues::new();
        let mut rev = FieldValues::new();
        if add {
            fwd = vec![
                fv("nat_type", "snat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", entry.nat_src.to_string()),
            ];
            rev = vec![
                fv("nat_type", "dnat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", entry.orig_src.to_string()),
            ];
        }

        // Forwarded packets matched by a static DNAT rule are reported as
        // SNAT of the reply direction, so the reverse key is checked too.
        let (table_name, check_table, key, reverse_key) = if src_port_natted {
            let proto = proto_prefix(entry.protocol);
            (
                APP_NAPT_TABLE_NAME,
                &self.napt_check,
                format!("{}{}:{}", proto, entry.orig_src, entry.orig_src_port),
                format!("{}{}:{}", proto, entry.nat_src, entry.nat_src_port),
            )
        } else {
            (
                APP_NAT_TABLE_NAME,
                &self.nat_check,
                entry.orig_src.to_string(),
                entry.nat_src.to_string(),
            )
        };

        if !self.restart.is_warm_start_in_progress() {
            for checked_key in [&key, &reverse_key] {
                match Self::check(check_table, checked_key).await? {
                    CheckResult::Static => {
                        info!(key = %checked_key, "static entry exists, dynamic snat event ignored");
                        return Ok(Publish::Skipped);
                    }
                    CheckResult::Dynamic => {
                        if add {
                            info!(key = %checked_key, "duplicate snat notification ignored");
                            return Ok(Publish::Skipped);
                        }
                        if self.snat_loopback_guard(entry) {
                            return Ok(Publish::Skipped);
                        }
                        self.restart.producer_del(table_name, checked_key)?;
                        info!(table = table_name, key = %checked_key, "dynamic snat entry deleted");
                    }
                    CheckResult::Absent => {}
                }
            }
        }

        if add {
            if src_port_natted {
                fwd.push(fv("translated_l4_port", entry.nat_src_port.to_string()));
                rev.push(fv("translated_l4_port", entry.orig_src_port.to_string()));
            }
            if self.restart.is_warm_start_in_progress() {
                self.restart.insert_to_map(table_name, &key, fwd, false);
                self.restart
                    .insert_to_map(table_name, &reverse_key, rev, false);
            } else {
                if self.snat_loopback_guard(entry) {
                    return Ok(Publish::Skipped);
                }
                self.restart.producer_set(table_name, &key, fwd)?;
                self.restart.producer_set(table_name, &reverse_key, rev)?;
                info!(table = table_name, key = %key, reverse_key = %reverse_key, "dynamic snat pair published");
            }
        } else if self.restart.is_warm_start_in_progress() {
            self.restart.insert_to_map(table_name, &key, fwd, true);
            self.restart
                .insert_to_map(table_name, &reverse_key, rev, true);
        }
        Ok(Publish::Done)
    }

    /// Connections NAT'd towards the loopback range never reach the
    /// dataplane: skip publication, no kernel update.
    fn snat_loopback_guard(&self, entry: &NaptEntry) -> bool {
        if entry.orig_dst.is_loopback() || entry.nat_dst.is_loopback() {
            info!(
                orig_dst = %entry.orig_dst,
                nat_dst = %entry.nat_dst,
                "snat event with loopback destination ignored"
            );
            true
        } else {
            false
        }
    }

    async fn handle_dnat(
        &mut self,
        entry: &NaptEntry,
        add: bool,
        dst_port_natted: bool,
    ) -> Result<Publish> {
        let mut fwd = FieldValues::new();
        let mut rev = FieldValues::new();
        if add {
            fwd = vec![
                fv("nat_type", "dnat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", entry.nat_dst.to_string()),
            ];
            rev = vec![
                fv("nat_type", "snat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", entry.orig_dst.to_string()),
            ];
        }

        let (table_name, check_table, key, reverse_key) = if dst_port_natted {
            let proto = proto_prefix(entry.protocol);
            (
                APP_NAPT_TABLE_NAME,
                &self.napt_check,
                format!("{}{}:{}", proto, entry.orig_dst, entry.orig_dst_port),
                format!("{}{}:{}", proto, entry.nat_dst, entry.nat_dst_port),
            )
        } else {
            (
                APP_NAT_TABLE_NAME,
                &self.nat_check,
                entry.orig_dst.to_string(),
                entry.nat_dst.to_string(),
            )
        };

        if !self.restart.is_warm_start_in_progress() {
            for checked_key in [&key, &reverse_key] {
                match Self::check(check_table, checked_key).await? {
                    CheckResult::Static => {
                        info!(key = %checked_key, "static entry exists, dynamic dnat event ignored");
                        return Ok(Publish::Skipped);
                    }
                    CheckResult::Dynamic => {
                        if add {
                            info!(key = %checked_key, "duplicate dnat notification ignored");
                            return Ok(Publish::Skipped);
                        }
                        self.restart.producer_del(table_name, checked_key)?;
                        info!(table = table_name, key = %checked_key, "dynamic dnat entry deleted");
                    }
                    CheckResult::Absent => {}
                }
            }
        }

        if add {
            if dst_port_natted {
                fwd.push(fv("translated_l4_port", entry.nat_dst_port.to_string()));
                rev.push(fv("translated_l4_port", entry.orig_dst_port.to_string()));
            }
            if self.restart.is_warm_start_in_progress() {
                self.restart.insert_to_map(table_name, &key, fwd, false);
                self.restart
                    .insert_to_map(table_name, &reverse_key, rev, false);
            } else {
                self.restart.producer_set(table_name, &key, fwd)?;
                self.restart.producer_set(table_name, &reverse_key, rev)?;
                info!(table = table_name, key = %key, reverse_key = %reverse_key, "dynamic dnat pair published");
            }
        } else if self.restart.is_warm_start_in_progress() {
            self.restart.insert_to_map(table_name, &key, fwd, true);
            self.restart
                .insert_to_map(table_name, &reverse_key, rev, true);
        }
        Ok(Publish::Done)
    }

    fn publish_pair(
        &mut self,
        table_name: &str,
        add: bool,
        key: &str,
        fwd: FieldValues,
        reverse_key: &str,
        rev: FieldValues,
    ) -> Result<()> {
        if self.restart.is_warm_start_in_progress() {
            self.restart.insert_to_map(table_name, key, fwd, !add);
            self.restart.insert_to_map(table_name, reverse_key, rev, !add);
            return Ok(());
        }
        if add {
            self.restart.producer_set(table_name, key, fwd)?;
            self.restart.producer_set(table_name, reverse_key, rev)?;
            info!(table = table_name, key = %key, reverse_key = %reverse_key, "entry pair published");
        } else {
            self.restart.producer_del(table_name, key)?;
            self.restart.producer_del(table_name, reverse_key)?;
            info!(table = table_name, key = %key, reverse_key = %reverse_key, "entry pair deleted");
        }
        Ok(())
    }
}

/// Applies the admission filters and derives the tuple pair; `None` drops
/// the event.
fn admit(ct: &ConntrackEvent) -> Option<NaptEntry> {
    // Only IPv4 connections are handled.
    if ct.family != 2 {
        return None;
    }
    // Connections never subjected to NAT are uninteresting.
    if !ct.has_status(IPS_SRC_NAT_DONE) && !ct.has_status(IPS_DST_NAT_DONE) {
        return None;
    }

    let entry = NaptEntry {
        protocol: ct.protocol(),
        orig_src: ct.orig.src,
        orig_src_port: ct.orig.src_port,
        orig_dst: ct.orig.dst,
        orig_dst_port: ct.orig.dst_port,
        nat_src: ct.nat_src(),
        nat_src_port: ct.nat_src_port(),
        nat_dst: ct.nat_dst(),
        nat_dst_port: ct.nat_dst_port(),
        status: ct.status,
    };

    // Internal loopback socket connections never hit the dataplane.
    if (entry.orig_src.is_loopback() && entry.orig_dst.is_loopback())
        || (entry.nat_src.is_loopback() && entry.nat_dst.is_loopback())
    {
        debug!("loopback-to-loopback conntrack entry ignored");
        return None;
    }

    match entry.protocol {
        IPPROTO_TCP | IPPROTO_UDP => {}
        IPPROTO_ICMP => {
            // ICMP translations are never programmed into hardware.
            info!(
                src = %entry.orig_src,
                dst = %entry.orig_dst,
                "icmp conntrack entry ignored"
            );
            return None;
        }
        other => {
            debug!(protocol = other, "unsupported protocol, conntrack entry ignored");
            return None;
        }
    }

    // Unconfirmed connections never left the box.
    if !ct.has_status(IPS_CONFIRMED) {
        debug!("unconfirmed conntrack entry ignored");
        return None;
    }
    Some(entry)
}

fn proto_prefix(protocol: u8) -> &'static str {
    if protocol == IPPROTO_TCP {
        "TCP:"
    } else {
        "UDP:"
    }
}

/// Blocks until the kernel conntrack restore marker appears, polling once a
/// second; exceeding the timeout is fatal.
pub async fn wait_for_nat_restore(state_store: &SharedStore) -> Result<()> {
    let table = Table::new(state_store.clone(), STATE_NAT_RESTORE_TABLE_NAME);
    let start = Instant::now();
    loop {
        if table.hget("Flags", "restored").await?.as_deref() == Some("true") {
            info!("kernel conntrack restore complete");
            return Ok(());
        }
        let elapsed = start.elapsed().as_secs();
        if elapsed > RESTORE_NAT_WAIT_TIMEOUT_SECS {
            return Err(NatSyncError::RestoreTimeout(elapsed));
        }
        debug!(elapsed, "waiting for kernel conntrack restore");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Blocks until port initialization completes, polling once a second.
pub async fn wait_for_port_init(appl_store: &SharedStore) -> Result<()> {
    let table = Table::new(appl_store.clone(), APP_PORT_TABLE_NAME);
    loop {
        if table.get("PortInitDone").await?.is_some() {
            info!("port initialization complete");
            return Ok(());
        }
        debug!("waiting for port initialization");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sonic_db::schema::STATE_WARM_RESTART_ENABLE_TABLE_NAME;
    use sonic_db::{MemoryStore, Store};
    use sonic_netlink::conntrack::CtTuple;
    use std::sync::{Arc, Mutex};

    struct RecordingConntrack {
        log: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl ConntrackApi for RecordingConntrack {
        fn update_entry(
            &mut self,
            _event: &ConntrackEvent,
            status: u32,
            timeout_secs: u32,
        ) -> NetlinkResult<()> {
            self.log.lock().unwrap().push((status, timeout_secs));
            Ok(())
        }
    }

    struct Fixture {
        appl: Arc<MemoryStore>,
        sync: NatSync,
        ct_log: Arc<Mutex<Vec<(u32, u32)>>>,
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
                    "nat",
                    &[fv("enable", "true")],
                )
                .await
                .unwrap();
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let sync = NatSync::new(
            appl.clone(),
            state,
            config,
            Box::new(RecordingConntrack { log: log.clone() }),
        )
        .await
        .unwrap();
        Fixture {
            appl,
            sync,
            ct_log: log,
        }
    }

    const CONFIRMED_ASSURED: u32 =
        IPS_CONFIRMED | IPS_ASSURED | IPS_SEEN_REPLY | IPS_SRC_NAT_DONE | IPS_DST_NAT_DONE;

    fn event(
        msg_type: CtMsgType,
        protocol: u8,
        orig: (&str, u16, &str, u16),
        nat: (&str, u16, &str, u16),
        status: u32,
    ) -> ConntrackEvent {
        ConntrackEvent {
            msg_type,
            family: 2,
            orig: CtTuple {
                src: orig.0.parse().unwrap(),
                dst: orig.2.parse().unwrap(),
                src_port: orig.1,
                dst_port: orig.3,
                protocol,
            },
            // The reply tuple mirrors the NAT'd values: nat_src = reply.dst,
            // nat_dst = reply.src.
            reply: CtTuple {
                src: nat.2.parse().unwrap(),
                dst: nat.0.parse().unwrap(),
                src_port: nat.3,
                dst_port: nat.1,
                protocol,
            },
            status,
            id: 1,
        }
    }

    #[tokio::test]
    async fn test_basic_snat_pair() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        let fwd = fx.appl.get(APP_NAT_TABLE_NAME, "10.1.1.1").await.unwrap().unwrap();
        assert_eq!(
            fwd,
            vec![
                fv("nat_type", "snat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", "192.0.2.1"),
            ]
        );
        let rev = fx.appl.get(APP_NAT_TABLE_NAME, "192.0.2.1").await.unwrap().unwrap();
        assert_eq!(
            rev,
            vec![
                fv("nat_type", "dnat"),
                fv("entry_type", "dynamic"),
                fv("translated_ip", "10.1.1.1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapt_when_port_changes() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 40001, "8.8.8.8", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        let fwd = fx
            .appl
            .get(APP_NAPT_TABLE_NAME, "TCP:10.1.1.1:5000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fv_get(&fwd, "translated_l4_port"), Some("40001"));
        let rev = fx
            .appl
            .get(APP_NAPT_TABLE_NAME, "TCP:192.0.2.1:40001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fv_get(&rev, "nat_type"), Some("dnat"));
        assert_eq!(fv_get(&rev, "translated_l4_port"), Some("5000"));
    }

    #[tokio::test]
    async fn test_pool_ip_implies_port_translation() {
        let mut fx = fixture().await;
        fx.appl
            .set(APP_NAPT_POOL_IP_TABLE_NAME, "192.0.2.1", &[fv("pool", "p1")])
            .await
            .unwrap();

        // Same source port, but the NAT IP is a NAPT pool member.
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx
            .appl
            .get(APP_NAPT_TABLE_NAME, "TCP:10.1.1.1:5000")
            .await
            .unwrap()
            .is_some());
        assert!(fx.appl.get(APP_NAT_TABLE_NAME, "10.1.1.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_basic_dnat_pair() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("8.8.8.8", 8080, "192.0.2.5", 80),
                ("8.8.8.8", 8080, "10.2.2.2", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        let fwd = fx.appl.get(APP_NAT_TABLE_NAME, "192.0.2.5").await.unwrap().unwrap();
        assert_eq!(fv_get(&fwd, "nat_type"), Some("dnat"));
        assert_eq!(fv_get(&fwd, "translated_ip"), Some("10.2.2.2"));
        let rev = fx.appl.get(APP_NAT_TABLE_NAME, "10.2.2.2").await.unwrap().unwrap();
        assert_eq!(fv_get(&rev, "nat_type"), Some("snat"));
    }

    #[tokio::test]
    async fn test_twice_napt_pair() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 40000, "10.2.2.2", 8080),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        let fwd = fx
            .appl
            .get(APP_NAPT_TWICE_TABLE_NAME, "TCP:10.1.1.1:5000:8.8.8.8:80")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fwd,
            vec![
                fv("entry_type", "dynamic"),
                fv("translated_src_ip", "192.0.2.1"),
                fv("translated_dst_ip", "10.2.2.2"),
                fv("translated_src_l4_port", "40000"),
                fv("translated_dst_l4_port", "8080"),
            ]
        );

        let rev = fx
            .appl
            .get(
                APP_NAPT_TWICE_TABLE_NAME,
                "TCP:10.2.2.2:8080:192.0.2.1:40000",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rev,
            vec![
                fv("entry_type", "dynamic"),
                fv("translated_src_ip", "8.8.8.8"),
                fv("translated_dst_ip", "10.1.1.1"),
                fv("translated_src_l4_port", "80"),
                fv("translated_dst_l4_port", "5000"),
            ]
        );
    }

    #[tokio::test]
    async fn test_twice_nat_without_port_change() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "10.2.2.2", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx
            .appl
            .get(APP_NAT_TWICE_TABLE_NAME, "10.1.1.1:8.8.8.8")
            .await
            .unwrap()
            .is_some());
        assert!(fx
            .appl
            .get(APP_NAT_TWICE_TABLE_NAME, "10.2.2.2:192.0.2.1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_static_entry_takes_precedence() {
        let mut fx = fixture().await;
        fx.appl
            .set(
                APP_NAT_TABLE_NAME,
                "10.1.1.1",
                &[fv("entry_type", "static"), fv("translated_ip", "203.0.113.9")],
            )
            .await
            .unwrap();

        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        let row = fx.appl.get(APP_NAT_TABLE_NAME, "10.1.1.1").await.unwrap().unwrap();
        assert_eq!(fv_get(&row, "translated_ip"), Some("203.0.113.9"));
        assert!(fx.appl.get(APP_NAT_TABLE_NAME, "192.0.2.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_both_rows() {
        let mut fx = fixture().await;
        let add = event(
            CtMsgType::New,
            IPPROTO_TCP,
            ("10.1.1.1", 5000, "8.8.8.8", 80),
            ("192.0.2.1", 40001, "8.8.8.8", 80),
            CONFIRMED_ASSURED,
        );
        fx.sync.handle_conntrack_event(add).await.unwrap();
        fx.sync.flush().await.unwrap();

        let mut del = add;
        del.msg_type = CtMsgType::Delete;
        fx.sync.handle_conntrack_event(del).await.unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx
            .appl
            .get(APP_NAPT_TABLE_NAME, "TCP:10.1.1.1:5000")
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .appl
            .get(APP_NAPT_TABLE_NAME, "TCP:192.0.2.1:40001")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_loopback_to_loopback_dropped() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("127.0.0.1", 5000, "127.0.0.2", 80),
                ("127.0.0.3", 5000, "127.0.0.2", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_NAT_TABLE_NAME).is_empty());
        assert!(fx.ct_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_dropped() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                IPS_ASSURED | IPS_SRC_NAT_DONE,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_NAT_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_new_tcp_without_assured_dropped() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                IPS_CONFIRMED | IPS_SRC_NAT_DONE,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_NAT_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_icmp_dropped() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_ICMP,
                ("10.1.1.1", 0, "8.8.8.8", 0),
                ("192.0.2.1", 0, "8.8.8.8", 0),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.appl.dump(APP_NAT_TABLE_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_udp_keepalive_pins_kernel_entry() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_UDP,
                ("10.1.1.1", 5000, "8.8.8.8", 53),
                ("192.0.2.1", 5000, "8.8.8.8", 53),
                IPS_CONFIRMED | IPS_SRC_NAT_DONE,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        assert!(fx.appl.get(APP_NAT_TABLE_NAME, "10.1.1.1").await.unwrap().is_some());
        let log = fx.ct_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (status, timeout) = log[0];
        assert_ne!(status & IPS_ASSURED, 0);
        assert_ne!(status & IPS_SEEN_REPLY, 0);
        assert_eq!(timeout, 600);
    }

    #[tokio::test]
    async fn test_udp_already_assured_not_rewritten() {
        let mut fx = fixture().await;
        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_UDP,
                ("10.1.1.1", 5000, "8.8.8.8", 53),
                ("192.0.2.1", 5000, "8.8.8.8", 53),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();
        assert!(fx.ct_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_warm_window_routes_into_cache() {
        let mut fx = warm_fixture().await;
        assert!(fx.sync.restart().is_warm_start_in_progress());
        fx.sync.restart_mut().read_tables_to_map().await.unwrap();

        fx.sync
            .handle_conntrack_event(event(
                CtMsgType::New,
                IPPROTO_TCP,
                ("10.1.1.1", 5000, "8.8.8.8", 80),
                ("192.0.2.1", 5000, "8.8.8.8", 80),
                CONFIRMED_ASSURED,
            ))
            .await
            .unwrap();
        fx.sync.flush().await.unwrap();

        // Nothing published until reconcile.
        assert!(fx.appl.dump(APP_NAT_TABLE_NAME).is_empty());

        fx.sync.restart_mut().reconcile().await.unwrap();
        assert_eq!(fx.appl.dump(APP_NAT_TABLE_NAME).len(), 2);
        assert!(!fx.sync.restart().is_warm_start_in_progress());
    }

    #[tokio::test]
    async fn test_restore_wait_times_out() {
        let state: SharedStore = Arc::new(MemoryStore::new());
        tokio::time::pause();
        let result = wait_for_nat_restore(&state).await;
        assert!(matches!(result, Err(NatSyncError::RestoreTimeout(_))));
    }

    #[tokio::test]
    async fn test_restore_wait_sees_marker() {
        let state_mem = Arc::new(MemoryStore::new());
        state_mem
            .set(STATE_NAT_RESTORE_TABLE_NAME, "Flags", &[fv("restored", "true")])
            .await
            .unwrap();
        let state: SharedStore = state_mem;
        wait_for_nat_restore(&state).await.unwrap();
    }
}
