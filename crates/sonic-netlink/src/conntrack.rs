//! Netfilter conntrack notification source.
//!
//! The codec is a small hand-rolled nfnetlink attribute walker: the
//! rtnetlink crates in use do not cover the netfilter subsystem, and the
//! agents need only the tuple pair, the status word and the id. The codec is
//! pure (byte slices in, [`ConntrackEvent`] out) so it is exercised directly
//! by tests; the socket side is Linux-only.

use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::net::Ipv4Addr;

// Conntrack status bits (linux/netfilter/nf_conntrack_common.h).
pub const IPS_EXPECTED: u32 = 1 << 0;
pub const IPS_SEEN_REPLY: u32 = 1 << 1;
pub const IPS_ASSURED: u32 = 1 << 2;
pub const IPS_CONFIRMED: u32 = 1 << 3;
pub const IPS_SRC_NAT: u32 = 1 << 4;
pub const IPS_DST_NAT: u32 = 1 << 5;
pub const IPS_SEQ_ADJUST: u32 = 1 << 6;
pub const IPS_SRC_NAT_DONE: u32 = 1 << 7;
pub const IPS_DST_NAT_DONE: u32 = 1 << 8;
pub const IPS_DYING: u32 = 1 << 9;
pub const IPS_FIXED_TIMEOUT: u32 = 1 << 10;

// IP protocol numbers the agents care about.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// nfnetlink framing (linux/netfilter/nfnetlink.h and nfnetlink_conntrack.h).
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_GET: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

const NLMSG_HDR_LEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

// Top-level conntrack attributes.
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_STATUS: u16 = 3;
const CTA_TIMEOUT: u16 = 7;
const CTA_ID: u16 = 12;

// Tuple nest.
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

// IP nest.
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;

// Proto nest.
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const AF_INET: u8 = 2;

/// Conntrack notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtMsgType {
    New,
    Delete,
}

/// One direction of a connection: addresses, ports, protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl Default for CtTuple {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
        }
    }
}

/// Decoded conntrack notification.
///
/// `orig` is the pre-NAT tuple; `reply` is the reply-direction tuple from
/// which the NAT'd addresses derive (`nat_src = reply.dst`,
/// `nat_dst = reply.src`, ports likewise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackEvent {
    pub msg_type: CtMsgType,
    pub family: u8,
    pub orig: CtTuple,
    pub reply: CtTuple,
    pub status: u32,
    pub id: u32,
}

impl ConntrackEvent {
    pub fn protocol(&self) -> u8 {
        self.orig.protocol
    }

    pub fn nat_src(&self) -> Ipv4Addr {
        self.reply.dst
    }

    pub fn nat_dst(&self) -> Ipv4Addr {
        self.reply.src
    }

    pub fn nat_src_port(&self) -> u16 {
        self.reply.dst_port
    }

    pub fn nat_dst_port(&self) -> u16 {
        self.reply.src_port
    }

    pub fn has_status(&self, bits: u32) -> bool {
        self.status & bits != 0
    }
}

/// Walks the netlink messages of one receive buffer, decoding every
/// conntrack NEW/DELETE notification.
pub fn decode_buffer(buf: &[u8]) -> Vec<ConntrackEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= buf.len() {
        let msg_len = NativeEndian::read_u32(&buf[offset..]) as usize;
        if msg_len < NLMSG_HDR_LEN || offset + msg_len > buf.len() {
            break;
        }
        let msg_type = NativeEndian::read_u16(&buf[offset + 4..]);
        if let Some(event) = decode_message(msg_type, &buf[offset + NLMSG_HDR_LEN..offset + msg_len])
        {
            events.push(event);
        }
        offset += (msg_len + 3) & !3;
    }
    events
}

/// Decodes one conntrack message payload (after the nlmsghdr).
pub fn decode_message(nlmsg_type: u16, payload: &[u8]) -> Option<ConntrackEvent> {
    if nlmsg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let msg_type = match nlmsg_type & 0xff {
        IPCTNL_MSG_CT_NEW => CtMsgType::New,
        IPCTNL_MSG_CT_DELETE => CtMsgType::Delete,
        _ => return None,
    };
    if payload.len() < NFGENMSG_LEN {
        return None;
    }
    let family = payload[0];

    let mut event = ConntrackEvent {
        msg_type,
        family,
        orig: CtTuple::default(),
        reply: CtTuple::default(),
        status: 0,
        id: 0,
    };

    for (attr_type, value) in AttrWalker::new(&payload[NFGENMSG_LEN..]) {
        match attr_type {
            CTA_TUPLE_ORIG => event.orig = decode_tuple(value),
            CTA_TUPLE_REPLY => event.reply = decode_tuple(value),
            CTA_STATUS if value.len() >= 4 => event.status = BigEndian::read_u32(value),
            CTA_ID if value.len() >= 4 => event.id = BigEndian::read_u32(value),
            _ => {}
        }
    }
    Some(event)
}

fn decode_tuple(nest: &[u8]) -> CtTuple {
    let mut tuple = CtTuple::default();
    for (attr_type, value) in AttrWalker::new(nest) {
        match attr_type {
            CTA_TUPLE_IP => {
                for (ip_type, ip_value) in AttrWalker::new(value) {
                    if ip_value.len() >= 4 {
                        let addr = Ipv4Addr::new(ip_value[0], ip_value[1], ip_value[2], ip_value[3]);
                        match ip_type {
                            CTA_IP_V4_SRC => tuple.src = addr,
                            CTA_IP_V4_DST => tuple.dst = addr,
                            _ => {}
                        }
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for (proto_type, proto_value) in AttrWalker::new(value) {
                    match proto_type {
                        CTA_PROTO_NUM if !proto_value.is_empty() => {
                            tuple.protocol = proto_value[0];
                        }
                        CTA_PROTO_SRC_PORT if proto_value.len() >= 2 => {
                            tuple.src_port = BigEndian::read_u16(proto_value);
                        }
                        CTA_PROTO_DST_PORT if proto_value.len() >= 2 => {
                            tuple.dst_port = BigEndian::read_u16(proto_value);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    tuple
}

/// Iterator over netlink attributes within a nest.
struct AttrWalker<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> AttrWalker<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for AttrWalker<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + NLA_HDR_LEN > self.buf.len() {
            return None;
        }
        let nla_len = NativeEndian::read_u16(&self.buf[self.offset..]) as usize;
        let nla_type = NativeEndian::read_u16(&self.buf[self.offset + 2..]) & NLA_TYPE_MASK;
        if nla_len < NLA_HDR_LEN || self.offset + nla_len > self.buf.len() {
            return None;
        }
        let value = &self.buf[self.offset + NLA_HDR_LEN..self.offset + nla_len];
        self.offset += (nla_len + 3) & !3;
        Some((nla_type, value))
    }
}

/// Attribute writer used by the encode paths and the codec tests.
struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn attr(&mut self, attr_type: u16, value: &[u8]) {
        let nla_len = NLA_HDR_LEN + value.len();
        let mut hdr = [0u8; 4];
        NativeEndian::write_u16(&mut hdr[0..2], nla_len as u16);
        NativeEndian::write_u16(&mut hdr[2..4], attr_type);
        self.buf.extend_from_slice(&hdr);
        self.buf.extend_from_slice(value);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn nest(&mut self, attr_type: u16, build: impl FnOnce(&mut AttrWriter)) {
        let mut inner = AttrWriter::new();
        build(&mut inner);
        self.attr(attr_type | 0x8000, &inner.buf);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn encode_tuple(writer: &mut AttrWriter, tuple: &CtTuple) {
    writer.nest(CTA_TUPLE_IP, |ip| {
        ip.attr(CTA_IP_V4_SRC, &tuple.src.octets());
        ip.attr(CTA_IP_V4_DST, &tuple.dst.octets());
    });
    writer.nest(CTA_TUPLE_PROTO, |proto| {
        proto.attr(CTA_PROTO_NUM, &[tuple.protocol]);
        let mut port = [0u8; 2];
        BigEndian::write_u16(&mut port, tuple.src_port);
        proto.attr(CTA_PROTO_SRC_PORT, &port);
        BigEndian::write_u16(&mut port, tuple.dst_port);
        proto.attr(CTA_PROTO_DST_PORT, &port);
    });
}

/// Encodes an IPCTNL_MSG_CT_NEW request updating `status` and `timeout` of
/// the connection identified by the original tuple.
pub fn encode_update(event: &ConntrackEvent, status: u32, timeout_secs: u32, seq: u32) -> Vec<u8> {
    const NLM_F_REQUEST: u16 = 1;
    const NLM_F_ACK: u16 = 4;

    let mut attrs = AttrWriter::new();
    attrs.nest(CTA_TUPLE_ORIG, |nest| encode_tuple(nest, &event.orig));
    let mut be32 = [0u8; 4];
    BigEndian::write_u32(&mut be32, status);
    attrs.attr(CTA_STATUS, &be32);
    BigEndian::write_u32(&mut be32, timeout_secs);
    attrs.attr(CTA_TIMEOUT, &be32);
    let attrs = attrs.into_bytes();

    let msg_len = NLMSG_HDR_LEN + NFGENMSG_LEN + attrs.len();
    let mut buf = Vec::with_capacity(msg_len);
    let mut hdr = [0u8; NLMSG_HDR_LEN];
    NativeEndian::write_u32(&mut hdr[0..4], msg_len as u32);
    NativeEndian::write_u16(
        &mut hdr[4..6],
        (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW,
    );
    NativeEndian::write_u16(&mut hdr[6..8], NLM_F_REQUEST | NLM_F_ACK);
    NativeEndian::write_u32(&mut hdr[8..12], seq);
    // nlmsg_pid stays zero.
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(&[AF_INET, 0, 0, 0]); // nfgenmsg: family, version, res_id
    buf.extend_from_slice(&attrs);
    buf
}

/// Encodes an IPCTNL_MSG_CT_GET dump request.
pub fn encode_dump_request(seq: u32) -> Vec<u8> {
    const NLM_F_REQUEST: u16 = 1;
    const NLM_F_DUMP: u16 = 0x300;

    let msg_len = NLMSG_HDR_LEN + NFGENMSG_LEN;
    let mut buf = Vec::with_capacity(msg_len);
    let mut hdr = [0u8; NLMSG_HDR_LEN];
    NativeEndian::write_u32(&mut hdr[0..4], msg_len as u32);
    NativeEndian::write_u16(
        &mut hdr[4..6],
        (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET,
    );
    NativeEndian::write_u16(&mut hdr[6..8], NLM_F_REQUEST | NLM_F_DUMP);
    NativeEndian::write_u32(&mut hdr[8..12], seq);
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(&[AF_INET, 0, 0, 0]);
    buf
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::error::{NetlinkError, NetlinkResult};
    use netlink_sys::{protocols::NETLINK_NETFILTER, Socket, SocketAddr};
    use tokio::io::unix::AsyncFd;
    use tracing::debug;

    // Conntrack multicast groups (linux/netfilter/nfnetlink.h).
    const NFNLGRP_CONNTRACK_NEW: u32 = 1;
    const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
    const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

    /// Socket subscribed to conntrack NEW/UPDATE/DESTROY groups.
    pub struct ConntrackSocket {
        fd: AsyncFd<Socket>,
        buffer: Vec<u8>,
        seq: u32,
    }

    impl ConntrackSocket {
        pub fn new() -> NetlinkResult<Self> {
            let mut socket = Socket::new(NETLINK_NETFILTER)
                .map_err(|e| NetlinkError::Socket(format!("create: {}", e)))?;
            let groups = (1 << (NFNLGRP_CONNTRACK_NEW - 1))
                | (1 << (NFNLGRP_CONNTRACK_UPDATE - 1))
                | (1 << (NFNLGRP_CONNTRACK_DESTROY - 1));
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| NetlinkError::Socket(format!("bind: {}", e)))?;
            socket.set_non_blocking(true)?;
            debug!("conntrack socket bound to NEW | UPDATE | DESTROY groups");

            Ok(Self {
                fd: AsyncFd::new(socket)?,
                buffer: vec![0u8; 65536],
                seq: 1,
            })
        }

        /// Requests a dump of the current conntrack table.
        pub fn dump(&mut self) -> NetlinkResult<()> {
            let buf = encode_dump_request(self.seq);
            self.seq = self.seq.wrapping_add(1);
            self.fd
                .get_ref()
                .send(&buf, 0)
                .map_err(|e| NetlinkError::Socket(format!("dump request: {}", e)))?;
            Ok(())
        }

        /// Waits for readability and drains every decodable notification.
        pub async fn recv_events(&mut self) -> NetlinkResult<Vec<ConntrackEvent>> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|fd| {
                    fd.get_ref()
                        .recv(&mut &mut self.buffer[..], 0)
                        .map_err(std::io::Error::from)
                }) {
                    Ok(Ok(len)) => return Ok(decode_buffer(&self.buffer[..len])),
                    Ok(Err(e)) => return Err(NetlinkError::Socket(format!("recv: {}", e))),
                    Err(_would_block) => continue,
                }
            }
        }

        /// Writes an updated status/timeout for `event`'s connection. Used to
        /// pin UDP entries the application now owns the aging for.
        pub fn update_entry(
            &mut self,
            event: &ConntrackEvent,
            status: u32,
            timeout_secs: u32,
        ) -> NetlinkResult<()> {
            let buf = encode_update(event, status, timeout_secs, self.seq);
            self.seq = self.seq.wrapping_add(1);
            self.fd
                .get_ref()
                .send(&buf, 0)
                .map_err(|e| NetlinkError::Socket(format!("ct update: {}", e)))?;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::ConntrackSocket;

/// Stub for non-Linux development hosts; produces no events.
#[cfg(not(target_os = "linux"))]
mod stub {
    use super::ConntrackEvent;
    use crate::error::NetlinkResult;

    pub struct ConntrackSocket;

    impl ConntrackSocket {
        pub fn new() -> NetlinkResult<Self> {
            Ok(Self)
        }

        pub fn dump(&mut self) -> NetlinkResult<()> {
            Ok(())
        }

        pub async fn recv_events(&mut self) -> NetlinkResult<Vec<ConntrackEvent>> {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }

        pub fn update_entry(
            &mut self,
            _event: &ConntrackEvent,
            _status: u32,
            _timeout_secs: u32,
        ) -> NetlinkResult<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::ConntrackSocket;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_event() -> ConntrackEvent {
        ConntrackEvent {
            msg_type: CtMsgType::New,
            family: AF_INET,
            orig: CtTuple {
                src: "10.1.1.1".parse().unwrap(),
                dst: "8.8.8.8".parse().unwrap(),
                src_port: 5000,
                dst_port: 80,
                protocol: IPPROTO_TCP,
            },
            reply: CtTuple {
                src: "10.2.2.2".parse().unwrap(),
                dst: "192.0.2.1".parse().unwrap(),
                src_port: 8080,
                dst_port: 40000,
                protocol: IPPROTO_TCP,
            },
            status: IPS_ASSURED | IPS_CONFIRMED | IPS_SRC_NAT_DONE | IPS_DST_NAT_DONE,
            id: 0xdeadbeef,
        }
    }

    /// Builds a full notification message the way the kernel would.
    fn encode_notification(event: &ConntrackEvent) -> Vec<u8> {
        let subtype = match event.msg_type {
            CtMsgType::New => IPCTNL_MSG_CT_NEW,
            CtMsgType::Delete => IPCTNL_MSG_CT_DELETE,
        };
        let mut attrs = AttrWriter::new();
        attrs.nest(CTA_TUPLE_ORIG, |nest| encode_tuple(nest, &event.orig));
        attrs.nest(CTA_TUPLE_REPLY, |nest| encode_tuple(nest, &event.reply));
        let mut be32 = [0u8; 4];
        BigEndian::write_u32(&mut be32, event.status);
        attrs.attr(CTA_STATUS, &be32);
        BigEndian::write_u32(&mut be32, event.id);
        attrs.attr(CTA_ID, &be32);
        let attrs = attrs.into_bytes();

        let msg_len = NLMSG_HDR_LEN + NFGENMSG_LEN + attrs.len();
        let mut buf = Vec::with_capacity(msg_len);
        let mut hdr = [0u8; NLMSG_HDR_LEN];
        NativeEndian::write_u32(&mut hdr[0..4], msg_len as u32);
        NativeEndian::write_u16(&mut hdr[4..6], (NFNL_SUBSYS_CTNETLINK << 8) | subtype);
        buf.extend_from_slice(&hdr);
        buf.extend_from_slice(&[event.family, 0, 0, 0]);
        buf.extend_from_slice(&attrs);
        buf
    }

    #[test]
    fn test_notification_round_trip() {
        let event = sample_event();
        let buf = encode_notification(&event);
        let decoded = decode_buffer(&buf);
        assert_eq!(decoded, vec![event]);
    }

    #[test]
    fn test_delete_round_trip() {
        let mut event = sample_event();
        event.msg_type = CtMsgType::Delete;
        let buf = encode_notification(&event);
        assert_eq!(decode_buffer(&buf), vec![event]);
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let a = sample_event();
        let mut b = sample_event();
        b.msg_type = CtMsgType::Delete;
        let mut buf = encode_notification(&a);
        buf.extend_from_slice(&encode_notification(&b));
        assert_eq!(decode_buffer(&buf), vec![a, b]);
    }

    #[test]
    fn test_non_conntrack_subsystem_ignored() {
        let event = sample_event();
        let mut buf = encode_notification(&event);
        // Rewrite the subsystem id to something unrelated.
        NativeEndian::write_u16(&mut buf[4..6], (5 << 8) | IPCTNL_MSG_CT_NEW);
        assert!(decode_buffer(&buf).is_empty());
    }

    #[test]
    fn test_truncated_buffer_is_safe() {
        let buf = encode_notification(&sample_event());
        for cut in 0..buf.len() {
            // Must never panic regardless of where the buffer is cut.
            let _ = decode_buffer(&buf[..cut]);
        }
    }

    #[test]
    fn test_nat_accessors_swap_reply_tuple() {
        let event = sample_event();
        assert_eq!(event.nat_src().to_string(), "192.0.2.1");
        assert_eq!(event.nat_dst().to_string(), "10.2.2.2");
        assert_eq!(event.nat_src_port(), 40000);
        assert_eq!(event.nat_dst_port(), 8080);
    }

    #[test]
    fn test_encode_update_carries_status_and_timeout() {
        let event = sample_event();
        let buf = encode_update(&event, IPS_SEEN_REPLY | IPS_ASSURED, 600, 7);
        // Header type: conntrack subsystem, CT_NEW.
        let msg_type = NativeEndian::read_u16(&buf[4..6]);
        assert_eq!(msg_type >> 8, NFNL_SUBSYS_CTNETLINK);
        assert_eq!(msg_type & 0xff, IPCTNL_MSG_CT_NEW);

        // The status and timeout attributes survive a decode of the payload.
        let payload = &buf[NLMSG_HDR_LEN + NFGENMSG_LEN..];
        let mut saw_status = None;
        let mut saw_timeout = None;
        for (attr_type, value) in AttrWalker::new(payload) {
            match attr_type {
                CTA_STATUS => saw_status = Some(BigEndian::read_u32(value)),
                CTA_TIMEOUT => saw_timeout = Some(BigEndian::read_u32(value)),
                _ => {}
            }
        }
        assert_eq!(saw_status, Some(IPS_SEEN_REPLY | IPS_ASSURED));
        assert_eq!(saw_timeout, Some(600));
    }
}
