//! NAT Synchronization Daemon entry point.
//!
//! Waits for port initialization, handles the warm-restart window (snapshot,
//! kernel conntrack restore gate, reconcile timer) and then processes
//! conntrack notifications until stopped.

use anyhow::Context;
use clap::Parser;
use sonic_db::schema::{APPL_DB, CONFIG_DB, STATE_DB};
use sonic_db::{RedisStore, SharedStore};
use sonic_natsyncd::{wait_for_nat_restore, wait_for_port_init, NatSync, NetlinkConntrackApi};
use sonic_netlink::ConntrackSocket;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "natsyncd", about = "NAT conntrack synchronization daemon")]
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
    info!("natsyncd: starting");

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

    wait_for_port_init(&appl).await?;

    let write_socket = ConntrackSocket::new().context("open conntrack write socket")?;
    let mut sync = NatSync::new(
        appl,
        state.clone(),
        config,
        Box::new(NetlinkConntrackApi::new(write_socket)),
    )
    .await
    .context("initialize natsync")?;

    let mut reconcile_timer = sync.restart().reconcile_timer();
    if sync.restart().is_warm_start_in_progress() {
        sync.restart_mut().read_tables_to_map().await?;
        // The kernel conntrack table must be restored before new events are
        // meaningful; a missing marker is fatal.
        wait_for_nat_restore(&state).await?;
        reconcile_timer.start();
        info!("natsyncd: warm restart, reconcile timer started");
    }

    let mut conntrack = ConntrackSocket::new().context("open conntrack socket")?;
    conntrack.dump()?;
    info!("natsyncd: listening to conntrack messages");

    loop {
        tokio::select! {
            events = conntrack.recv_events() => {
                for event in events.context("conntrack receive")? {
                    if let Err(e) = sync.handle_conntrack_event(event).await {
                        warn!(error = %e, "conntrack event handling failed");
                    }
                }
            }
            _ = reconcile_timer.wait(), if sync.restart().is_warm_start_in_progress() => {
                reconcile_timer.stop();
                sync.restart_mut().reconcile().await?;
                info!("natsyncd: NAT table reconciliation complete");
            }
        }
        sync.flush().await?;
    }
}
