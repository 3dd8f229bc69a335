//! rtnetlink link and neighbor event source.
//!
//! Subscribes to `RTNLGRP_LINK` and `RTNLGRP_NEIGH`, supports RTM_GETLINK /
//! RTM_GETNEIGH dumps, and decodes messages into [`RtnlEvent`] values
//! carrying only the fields the agents need.

use sonic_types::MacAddress;
use std::net::Ipv4Addr;

// Kernel NUD_* neighbor states (linux/neighbour.h).
pub const NUD_INCOMPLETE: u16 = 0x01;
pub const NUD_REACHABLE: u16 = 0x02;
pub const NUD_STALE: u16 = 0x04;
pub const NUD_DELAY: u16 = 0x08;
pub const NUD_PROBE: u16 = 0x10;
pub const NUD_FAILED: u16 = 0x20;
pub const NUD_NOARP: u16 = 0x40;
pub const NUD_PERMANENT: u16 = 0x80;

// Kernel NTF_* neighbor flags (linux/neighbour.h).
pub const NTF_SELF: u8 = 0x02;
pub const NTF_MASTER: u8 = 0x04;

/// Decoded RTM_NEWLINK fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub ifindex: u32,
    pub ifname: String,
    /// VNI when the link is a VXLAN netdevice reporting one.
    pub vxlan_vni: Option<u32>,
}

/// Decoded RTM_NEWNEIGH / RTM_DELNEIGH fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighEvent {
    pub ifindex: u32,
    /// True for AF_BRIDGE rows; the agents ignore everything else.
    pub is_bridge: bool,
    pub mac: MacAddress,
    /// Destination (VTEP) address, when present.
    pub dst: Option<Ipv4Addr>,
    /// NUD_* state bits.
    pub state: u16,
    /// VLAN attribute, when present.
    pub vlan: Option<u16>,
}

/// One decoded rtnetlink event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlEvent {
    NewLink(LinkEvent),
    NewNeigh(NeighEvent),
    DelNeigh(NeighEvent),
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{LinkEvent, NeighEvent, RtnlEvent};
    use crate::error::{NetlinkError, NetlinkResult};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
    };
    use netlink_packet_route::link::{
        InfoData, InfoKind, InfoVxlan, LinkAttribute, LinkInfo, LinkMessage,
    };
    use netlink_packet_route::neighbour::{
        NeighbourAddress, NeighbourAttribute, NeighbourMessage,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use sonic_types::MacAddress;
    use std::os::fd::AsRawFd;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, trace, warn};

    /// rtnetlink multicast groups (linux/rtnetlink.h).
    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_NEIGH: u32 = 3;

    /// Socket subscribed to link and neighbor notifications.
    pub struct RtnlSocket {
        fd: AsyncFd<Socket>,
        buffer: Vec<u8>,
        seq: u32,
    }

    impl RtnlSocket {
        /// Creates the socket and joins the link and neighbor groups.
        pub fn new() -> NetlinkResult<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NetlinkError::Socket(format!("create: {}", e)))?;
            let groups = (1 << (RTNLGRP_LINK - 1)) | (1 << (RTNLGRP_NEIGH - 1));
            let addr = SocketAddr::new(0, groups);
            socket
                .bind(&addr)
                .map_err(|e| NetlinkError::Socket(format!("bind: {}", e)))?;
            socket.set_non_blocking(true)?;
            debug!("rtnetlink socket bound to RTNLGRP_LINK | RTNLGRP_NEIGH");

            Ok(Self {
                fd: AsyncFd::new(socket)?,
                buffer: vec![0u8; 65536],
                seq: 1,
            })
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.fd.get_ref().as_raw_fd()
        }

        /// Requests a full link table dump.
        pub fn dump_links(&mut self) -> NetlinkResult<()> {
            self.dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))
        }

        /// Requests a full neighbor table dump.
        pub fn dump_neighbors(&mut self) -> NetlinkResult<()> {
            self.dump(RouteNetlinkMessage::GetNeighbour(
                NeighbourMessage::default(),
            ))
        }

        fn dump(&mut self, payload: RouteNetlinkMessage) -> NetlinkResult<()> {
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            header.sequence_number = self.seq;
            self.seq = self.seq.wrapping_add(1);

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.fd
                .get_ref()
                .send(&buf, 0)
                .map_err(|e| NetlinkError::Socket(format!("dump request: {}", e)))?;
            Ok(())
        }

        /// Waits for readability and drains every decodable event.
        pub async fn recv_events(&mut self) -> NetlinkResult<Vec<RtnlEvent>> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|fd| {
                    fd.get_ref()
                        .recv(&mut &mut self.buffer[..], 0)
                        .map_err(std::io::Error::from)
                }) {
                    Ok(Ok(len)) => return Ok(parse_buffer(&self.buffer[..len])),
                    Ok(Err(e)) => {
                        return Err(NetlinkError::Socket(format!("recv: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }

    /// Splits a receive buffer into netlink messages and decodes each.
    fn parse_buffer(buf: &[u8]) -> Vec<RtnlEvent> {
        let mut events = Vec::new();
        let mut offset = 0;

        while offset + 16 <= buf.len() {
            let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "undecodable rtnetlink message, dropping rest of buffer");
                    break;
                }
            };
            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            offset += (length + 3) & !3;

            if let Some(event) = decode_message(&msg) {
                events.push(event);
            }
        }
        trace!(count = events.len(), "decoded rtnetlink events");
        events
    }

    fn decode_message(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<RtnlEvent> {
        match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                decode_link(link).map(RtnlEvent::NewLink)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)) => {
                Some(RtnlEvent::NewNeigh(decode_neigh(neigh)))
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelNeighbour(neigh)) => {
                Some(RtnlEvent::DelNeigh(decode_neigh(neigh)))
            }
            _ => None,
        }
    }

    fn decode_link(link: &LinkMessage) -> Option<LinkEvent> {
        let mut ifname = None;
        let mut is_vxlan = false;
        let mut vni = None;

        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => ifname = Some(name.clone()),
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        match info {
                            LinkInfo::Kind(kind) => {
                                is_vxlan = matches!(kind, InfoKind::Vxlan);
                            }
                            LinkInfo::Data(InfoData::Vxlan(vxlan_infos)) => {
                                is_vxlan = true;
                                for vx in vxlan_infos {
                                    if let InfoVxlan::Id(id) = vx {
                                        vni = Some(*id);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        Some(LinkEvent {
            ifindex: link.header.index,
            ifname: ifname?,
            vxlan_vni: if is_vxlan { vni } else { None },
        })
    }

    fn decode_neigh(neigh: &NeighbourMessage) -> NeighEvent {
        let mut mac = MacAddress::ZERO;
        let mut dst = None;
        let mut vlan = None;

        for attr in &neigh.attributes {
            match attr {
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    if let Some(parsed) = MacAddress::from_slice(bytes) {
                        mac = parsed;
                    }
                }
                NeighbourAttribute::Destination(addr) => {
                    // Only IPv4 tunnel endpoints are supported; mapped
                    // v4-in-v6 endpoints decay to v4.
                    match addr {
                        NeighbourAddress::Inet(v4) => dst = Some(*v4),
                        NeighbourAddress::Inet6(v6) => dst = v6.to_ipv4_mapped(),
                        _ => {}
                    }
                }
                NeighbourAttribute::Vlan(vid) => vlan = Some(*vid),
                _ => {}
            }
        }

        NeighEvent {
            ifindex: neigh.header.ifindex,
            is_bridge: u8::from(neigh.header.family) as i32 == libc::AF_BRIDGE,
            mac,
            dst,
            state: neigh.header.state.into(),
            vlan,
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::RtnlSocket;

/// Stub for non-Linux development hosts; produces no events.
#[cfg(not(target_os = "linux"))]
mod stub {
    use super::RtnlEvent;
    use crate::error::NetlinkResult;

    pub struct RtnlSocket;

    impl RtnlSocket {
        pub fn new() -> NetlinkResult<Self> {
            Ok(Self)
        }

        pub fn as_raw_fd(&self) -> i32 {
            -1
        }

        pub fn dump_links(&mut self) -> NetlinkResult<()> {
            Ok(())
        }

        pub fn dump_neighbors(&mut self) -> NetlinkResult<()> {
            Ok(())
        }

        pub async fn recv_events(&mut self) -> NetlinkResult<Vec<RtnlEvent>> {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::RtnlSocket;
