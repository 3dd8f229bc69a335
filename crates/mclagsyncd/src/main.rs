//! MCLAG Synchronization Daemon entry point.
//!
//! Binds the peer TCP server on loopback and serves one peer connection at
//! a time; a lost or misbehaving peer tears the connection down and the
//! outer loop re-accepts.

use anyhow::Context;
use clap::Parser;
use sonic_db::schema::{
    CFG_MCLAG_INTF_TABLE_NAME, CFG_MCLAG_TABLE_NAME, CFG_MCLAG_UNIQUE_IP_TABLE_NAME,
    STATE_FDB_TABLE_NAME, STATE_VLAN_MEMBER_TABLE_NAME, APPL_DB, CONFIG_DB, STATE_DB,
};
use sonic_db::{KeyOpFieldValues, RedisStore, SharedStore, SubscriberStateTable};
use sonic_mclagsyncd::protocol::{
    FrameReader, MCLAG_DEFAULT_IP, MCLAG_DEFAULT_PORT, MCLAG_MAX_MSG_LEN,
};
use sonic_mclagsyncd::{DomainCfgEffect, McLagError, MclagLink};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mclagsyncd", about = "MCLAG/ICCP peer synchronization daemon")]
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

fn bind_listener() -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::from(MCLAG_DEFAULT_IP), MCLAG_DEFAULT_PORT));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    socket.listen(2)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    info!("mclagsyncd: starting");

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

    let platform = std::env::var("platform").unwrap_or_default();

    let listener = bind_listener().context("bind peer listener")?;
    info!(
        addr = %listener.local_addr().context("listener address")?,
        "mclagsyncd: waiting for peer connection"
    );

    loop {
        let (stream, peer) = listener.accept().await.context("accept peer")?;
        info!(peer = %peer, "peer connected");

        // Fresh link state per connection: a reconnecting peer gets the
        // full configuration replayed, not a diff against the last session.
        let mut link = MclagLink::new(appl.clone(), state.clone(), config.clone(), &platform);

        match serve_connection(&mut link, stream, &state, &config).await {
            Err(McLagError::ConnectionClosed) => {
                info!("connection lost, re-accepting");
            }
            Err(McLagError::MalformedFrame { length }) => {
                warn!(length, "malformed peer frame, tearing connection down");
            }
            Err(McLagError::Io(e)) => {
                warn!(error = %e, "peer connection io error, re-accepting");
            }
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
    }
}

/// Serves one peer connection until it closes or misbehaves.
async fn serve_connection(
    link: &mut MclagLink,
    stream: TcpStream,
    state: &SharedStore,
    config: &SharedStore,
) -> sonic_mclagsyncd::Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    link.fetch_system_mac().await?;

    // The domain configuration is always watched; the FDB, VLAN-member and
    // interface tables only while at least one domain exists.
    let mut domain_sub = SubscriberStateTable::new(config, CFG_MCLAG_TABLE_NAME).await?;
    let mut fdb_sub: Option<SubscriberStateTable> = None;
    let mut vlan_mbr_sub: Option<SubscriberStateTable> = None;
    let mut intf_cfg_sub: Option<SubscriberStateTable> = None;
    let mut unique_ip_sub: Option<SubscriberStateTable> = None;

    // Replay the existing configuration to the fresh peer.
    let (frames, effect) = link.fetch_mclag_config().await?;
    write_frames(&mut wr, frames).await?;
    if let Some(effect) = effect {
        apply_effect(
            effect,
            state,
            config,
            &mut fdb_sub,
            &mut vlan_mbr_sub,
            &mut intf_cfg_sub,
            &mut unique_ip_sub,
        )
        .await?;
    }
    let frames = link.fetch_mclag_interface_config().await?;
    write_frames(&mut wr, frames).await?;
    link.flush().await?;

    let mut read_buf = vec![0u8; MCLAG_MAX_MSG_LEN];
    let mut reader = FrameReader::new();

    loop {
        tokio::select! {
            read = rd.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Err(McLagError::ConnectionClosed);
                }
                reader.extend(&read_buf[..n]);
                while let Some((message_type, payload)) = reader.next_frame()? {
                    link.handle_message(message_type, &payload).await?;
                }
            }
            Some(event) = domain_sub.recv() => {
                let mut events = vec![event];
                events.extend(domain_sub.pops());
                let (frames, effect) = link.process_mclag_domain_cfg(events);
                write_frames(&mut wr, frames).await?;
                if let Some(effect) = effect {
                    apply_effect(
                        effect,
                        state,
                        config,
                        &mut fdb_sub,
                        &mut vlan_mbr_sub,
                        &mut intf_cfg_sub,
                        &mut unique_ip_sub,
                    )
                    .await?;
                }
            }
            Some(event) = recv_opt(&mut fdb_sub) => {
                let frames = link.send_fdb_entries(vec![event]);
                write_frames(&mut wr, frames).await?;
            }
            Some(event) = recv_opt(&mut vlan_mbr_sub) => {
                let frames = link.process_vlan_member(vec![event]);
                write_frames(&mut wr, frames).await?;
            }
            Some(event) = recv_opt(&mut intf_cfg_sub) => {
                let frames = link.send_mclag_iface_cfg(vec![event]).await?;
                write_frames(&mut wr, frames).await?;
            }
            Some(event) = recv_opt(&mut unique_ip_sub) => {
                let frames = link.send_mclag_unique_ip_cfg(vec![event]);
                write_frames(&mut wr, frames).await?;
            }
        }
        link.flush().await?;
    }
}

/// Receives from an optional subscription; pends forever while absent.
async fn recv_opt(sub: &mut Option<SubscriberStateTable>) -> Option<KeyOpFieldValues> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_frames(
    stream: &mut OwnedWriteHalf,
    frames: Vec<Vec<u8>>,
) -> sonic_mclagsyncd::Result<()> {
    for frame in frames {
        stream.write_all(&frame).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply_effect(
    effect: DomainCfgEffect,
    state: &SharedStore,
    config: &SharedStore,
    fdb_sub: &mut Option<SubscriberStateTable>,
    vlan_mbr_sub: &mut Option<SubscriberStateTable>,
    intf_cfg_sub: &mut Option<SubscriberStateTable>,
    unique_ip_sub: &mut Option<SubscriberStateTable>,
) -> sonic_mclagsyncd::Result<()> {
    match effect {
        DomainCfgEffect::AddSelectables => {
            info!("first mclag domain added, subscribing dependent tables");
            *fdb_sub = Some(SubscriberStateTable::new(state, STATE_FDB_TABLE_NAME).await?);
            *vlan_mbr_sub =
                Some(SubscriberStateTable::new(state, STATE_VLAN_MEMBER_TABLE_NAME).await?);
            *intf_cfg_sub =
                Some(SubscriberStateTable::new(config, CFG_MCLAG_INTF_TABLE_NAME).await?);
            *unique_ip_sub =
                Some(SubscriberStateTable::new(config, CFG_MCLAG_UNIQUE_IP_TABLE_NAME).await?);
        }
        DomainCfgEffect::DelSelectables => {
            info!("last mclag domain removed, dropping dependent subscriptions");
            *fdb_sub = None;
            *vlan_mbr_sub = None;
            *intf_cfg_sub = None;
            *unique_ip_sub = None;
        }
    }
    Ok(())
}
