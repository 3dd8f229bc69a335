//! Typed kernel bridge-FDB writes.
//!
//! Builds RTM_NEWNEIGH / RTM_DELNEIGH AF_BRIDGE requests directly instead of
//! shelling out to `bridge fdb`. Each call blocks until the kernel acks;
//! a non-zero ack surfaces as [`crate::NetlinkError::KernelAck`] which the
//! agents log and treat as best-effort.

use std::net::Ipv4Addr;

/// Whether the entry ages out (`dynamic`) or is pinned (`static`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdbEntryType {
    Dynamic,
    Static,
}

impl FdbEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FdbEntryType::Dynamic => "dynamic",
            FdbEntryType::Static => "static",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dynamic" => Some(FdbEntryType::Dynamic),
            "static" => Some(FdbEntryType::Static),
            _ => None,
        }
    }
}

/// Where the FDB entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdbDest {
    /// Bridge-master entry on a front-panel port (`dev <port> master`).
    Master { port: String },
    /// VXLAN netdevice entry with a tunnel endpoint
    /// (`dev <ifname> dst <vtep>`).
    Vtep { ifname: String, vtep: Ipv4Addr },
}

impl FdbDest {
    fn dev(&self) -> &str {
        match self {
            FdbDest::Master { port } => port,
            FdbDest::Vtep { ifname, .. } => ifname,
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{FdbDest, FdbEntryType};
    use crate::error::{NetlinkError, NetlinkResult};
    use crate::rtnl::{NTF_MASTER, NTF_SELF, NUD_NOARP, NUD_REACHABLE};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE,
        NLM_F_REQUEST,
    };
    use netlink_packet_route::neighbour::{
        NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use sonic_types::MacAddress;
    use tracing::debug;

    /// Blocking request/ack socket for bridge-FDB mutations.
    pub struct KernelFdbWriter {
        socket: Socket,
        buffer: Vec<u8>,
        seq: u32,
    }

    impl KernelFdbWriter {
        pub fn new() -> NetlinkResult<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NetlinkError::Socket(format!("create: {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, 0))
                .map_err(|e| NetlinkError::Socket(format!("bind: {}", e)))?;
            Ok(Self {
                socket,
                buffer: vec![0u8; 8192],
                seq: 1,
            })
        }

        /// `bridge fdb replace` equivalent.
        pub fn replace(
            &mut self,
            mac: &MacAddress,
            vlan: u16,
            dest: &FdbDest,
            entry_type: FdbEntryType,
        ) -> NetlinkResult<()> {
            let msg = build_neigh(mac, vlan, dest, entry_type)?;
            self.request(
                RouteNetlinkMessage::NewNeighbour(msg),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            )
        }

        /// `bridge fdb del` equivalent.
        pub fn del(&mut self, mac: &MacAddress, vlan: u16, dest: &FdbDest) -> NetlinkResult<()> {
            let msg = build_neigh(mac, vlan, dest, FdbEntryType::Dynamic)?;
            self.request(
                RouteNetlinkMessage::DelNeighbour(msg),
                NLM_F_REQUEST | NLM_F_ACK,
            )
        }

        fn request(&mut self, payload: RouteNetlinkMessage, flags: u16) -> NetlinkResult<()> {
            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = self.seq;
            self.seq = self.seq.wrapping_add(1);

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| NetlinkError::Socket(format!("send: {}", e)))?;

            let len = self
                .socket
                .recv(&mut &mut self.buffer[..], 0)
                .map_err(|e| NetlinkError::Socket(format!("ack recv: {}", e)))?;
            let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&self.buffer[..len])
                .map_err(|e| NetlinkError::Decode(format!("ack: {}", e)))?;
            match reply.payload {
                NetlinkPayload::Error(err) => {
                    let code = err.raw_code();
                    if code == 0 {
                        Ok(())
                    } else {
                        Err(NetlinkError::KernelAck(code))
                    }
                }
                _ => Ok(()),
            }
        }
    }

    fn build_neigh(
        mac: &MacAddress,
        vlan: u16,
        dest: &FdbDest,
        entry_type: FdbEntryType,
    ) -> NetlinkResult<NeighbourMessage> {
        let dev = dest.dev();
        let ifindex = nix::net::if_::if_nametoindex(dev)
            .map_err(|_| NetlinkError::InterfaceNotFound(dev.to_string()))?;

        let mut msg = NeighbourMessage::default();
        msg.header.family = (libc::AF_BRIDGE as u8).into();
        msg.header.ifindex = ifindex;
        msg.header.state = match entry_type {
            FdbEntryType::Static => NUD_NOARP,
            FdbEntryType::Dynamic => NUD_REACHABLE,
        }
        .into();
        msg.attributes
            .push(NeighbourAttribute::LinkLocalAddress(mac.as_bytes().to_vec()));
        msg.attributes.push(NeighbourAttribute::Vlan(vlan));

        match dest {
            FdbDest::Master { port } => {
                msg.header.flags = NeighbourFlags::from_bits_retain(NTF_MASTER);
                debug!(mac = %mac, vlan, port = %port, "bridge fdb request (master)");
            }
            FdbDest::Vtep { ifname, vtep } => {
                msg.header.flags = NeighbourFlags::from_bits_retain(NTF_SELF);
                msg.attributes
                    .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(
                        *vtep,
                    )));
                debug!(mac = %mac, vlan, ifname = %ifname, vtep = %vtep, "bridge fdb request (vtep)");
            }
        }
        Ok(msg)
    }
}

#[cfg(target_os = "linux")]
pub use linux::KernelFdbWriter;

/// Stub for non-Linux development hosts; accepts and discards requests.
#[cfg(not(target_os = "linux"))]
mod stub {
    use super::{FdbDest, FdbEntryType};
    use crate::error::NetlinkResult;
    use sonic_types::MacAddress;

    pub struct KernelFdbWriter;

    impl KernelFdbWriter {
        pub fn new() -> NetlinkResult<Self> {
            Ok(Self)
        }

        pub fn replace(
            &mut self,
            _mac: &MacAddress,
            _vlan: u16,
            _dest: &FdbDest,
            _entry_type: FdbEntryType,
        ) -> NetlinkResult<()> {
            Ok(())
        }

        pub fn del(
            &mut self,
            _mac: &MacAddress,
            _vlan: u16,
            _dest: &FdbDest,
        ) -> NetlinkResult<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::KernelFdbWriter;
