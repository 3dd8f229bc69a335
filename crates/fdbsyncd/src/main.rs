//! FDB Synchronization Daemon entry point.
//!
//! Listens to kernel link/neighbor events, the state-database FDB table and
//! the EVPN NVO configuration, and drives the warm-restart reconciliation
//! window.

use anyhow::Context;
use clap::Parser;
use sonic_db::schema::{
    CFG_VXLAN_EVPN_NVO_TABLE_NAME, STATE_FDB_TABLE_NAME, APPL_DB, CONFIG_DB, STATE_DB,
};
use sonic_db::{RedisStore, SharedStore, SubscriberStateTable};
use sonic_fdbsyncd::{FdbSync, NetlinkKernelFdb};
use sonic_netlink::RtnlSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fdbsyncd", about = "VXLAN/EVPN FDB synchronization daemon")]
struct Args {
    /// Redis server host.
    #[arg(long, default_value = "127.0.0.1")]
    redis_host: String,

    /// Redis server port.
    #[arg(long, default_value_t = 6379)]
    redis_port: u16,
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    info!("fdbsyncd: starting");

    let appl: SharedStore = Arc::new(
        RedisStore::connect(&args.redis_host, args.redis_port, APPL_DB)
            .await
            .context("connect APPL_DB")?,
    );
    let state: SharedStore = Arc::new(
        RedisStore::connect(&args.redis_host, args.redis_port, STATE_DB)
            .await
            .context("connect STATE_DB")?,
    );
    let config: SharedStore = Arc::new(
        RedisStore::connect(&args.redis_host, args.redis_port, CONFIG_DB)
            .await
            .context("connect CONFIG_DB")?,
    );

    let kernel = NetlinkKernelFdb::new().context("open kernel fdb socket")?;
    let mut sync = FdbSync::new(appl, state.clone(), config.clone(), Box::new(kernel))
        .await
        .context("initialize fdbsync")?;

    let mut reconcile_timer = sync.restart().reconcile_timer();
    if sync.restart().is_warm_start_in_progress() {
        sync.restart_mut().read_tables_to_map().await?;
        reconcile_timer.start();
        info!("fdbsyncd: warm restart, reconcile timer started");
    }

    let mut netlink = RtnlSocket::new().context("open rtnetlink socket")?;
    netlink.dump_links()?;

    // Drain the link dump before asking for neighbors, so neighbor events
    // can be classified against a complete VXLAN interface map.
    let link_dump_deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        match tokio::time::timeout_at(link_dump_deadline, netlink.recv_events()).await {
            Ok(Ok(events)) => {
                for event in events {
                    sync.handle_rtnl_event(event)?;
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "link dump receive failed");
                break;
            }
            Err(_) => break,
        }
    }
    netlink.dump_neighbors()?;

    let mut fdb_sub = SubscriberStateTable::new(&state, STATE_FDB_TABLE_NAME).await?;
    let mut nvo_sub = SubscriberStateTable::new(&config, CFG_VXLAN_EVPN_NVO_TABLE_NAME).await?;
    info!("fdbsyncd: listening to link and neighbor messages");

    loop {
        tokio::select! {
            events = netlink.recv_events() => {
                for event in events.context("netlink receive")? {
                    sync.handle_rtnl_event(event)?;
                }
            }
            Some(event) = fdb_sub.recv() => {
                let mut events = vec![event];
                events.extend(fdb_sub.pops());
                sync.process_state_fdb(events)?;
            }
            Some(event) = nvo_sub.recv() => {
                let mut events = vec![event];
                events.extend(nvo_sub.pops());
                sync.process_cfg_evpn_nvo(events);
            }
            _ = reconcile_timer.wait(), if sync.restart().is_warm_start_in_progress() => {
                reconcile_timer.stop();
                sync.restart_mut().reconcile().await?;
                info!("fdbsyncd: vxlan fdb/vni reconciliation complete");
            }
        }
        sync.flush().await?;
    }
}
