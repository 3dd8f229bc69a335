//! MCLAG peer wire protocol.
//!
//! Every message is `{version u8, type u8, length u16}` followed by the
//! body; `length` is the total including the 4-byte header and must stay
//! within `HDR_LEN..=4096`. Multi-byte integers are little-endian, the host
//! order of every supported platform (the peer runs on the same box).
//! Message bodies are either a concatenation of fixed-size records or a run
//! of `{op_type u8, op_len u16, value}` sub-option TLVs.

use crate::error::McLagError;
use byteorder::{ByteOrder, LittleEndian};
use sonic_types::MacAddress;

/// Protocol version emitted in every header.
pub const MCLAG_PROTO_VERSION: u8 = 1;

/// Largest frame in either direction, header included.
pub const MCLAG_MAX_MSG_LEN: usize = 4096;

/// Fixed message header size.
pub const MCLAG_MSG_HDR_LEN: usize = 4;

/// Sub-option TLV header size (`op_type u8` + `op_len u16`).
pub const MCLAG_SUB_OPTION_HDR_LEN: usize = 3;

/// Loopback address and port the server binds.
pub const MCLAG_DEFAULT_IP: [u8; 4] = [127, 0, 0, 6];
pub const MCLAG_DEFAULT_PORT: u16 = 2626;

/// Message types received from the peer.
pub mod msg_type {
    pub const NONE: u8 = 0;
    pub const PORT_ISOLATE: u8 = 1;
    pub const PORT_MAC_LEARN_MODE: u8 = 2;
    pub const FLUSH_FDB: u8 = 3;
    pub const SET_INTF_MAC: u8 = 4;
    pub const SET_FDB: u8 = 5;
    pub const SET_TRAFFIC_DIST_ENABLE: u8 = 7;
    pub const SET_TRAFFIC_DIST_DISABLE: u8 = 8;
    pub const SET_ICCP_STATE: u8 = 9;
    pub const SET_ICCP_ROLE: u8 = 10;
    pub const SET_ICCP_SYSTEM_ID: u8 = 11;
    pub const SET_REMOTE_IF_STATE: u8 = 12;
    pub const DEL_REMOTE_IF_INFO: u8 = 13;
    pub const SET_PEER_LINK_ISOLATION: u8 = 14;
    pub const SET_ICCP_PEER_SYSTEM_ID: u8 = 15;
    pub const DEL_ICCP_INFO: u8 = 16;
}

/// Message types sent to the peer.
pub mod syncd_msg_type {
    pub const FDB_OPERATION: u8 = 1;
    pub const CFG_MCLAG_DOMAIN: u8 = 2;
    pub const CFG_MCLAG_IFACE: u8 = 3;
    pub const VLAN_MBR_UPDATES: u8 = 4;
    pub const CFG_MCLAG_UNIQUE_IP: u8 = 5;
}

/// Sub-option TLV types.
pub mod sub_option {
    pub const ISOLATE_SRC: u8 = 1;
    pub const ISOLATE_DST: u8 = 2;
    pub const MAC_LEARN_ENABLE: u8 = 3;
    pub const MAC_LEARN_DISABLE: u8 = 4;
    pub const SET_MAC_SRC: u8 = 5;
    pub const SET_MAC_DST: u8 = 6;
    pub const MCLAG_ID: u8 = 7;
    pub const OPER_STATUS: u8 = 8;
    pub const ICCP_ROLE: u8 = 9;
    pub const SYSTEM_ID: u8 = 10;
    pub const MCLAG_INTF_NAME: u8 = 11;
    pub const ISOLATION_STATE: u8 = 12;
    pub const PEER_SYSTEM_ID: u8 = 13;
}

/// FDB record operation codes.
pub const FDB_OPER_ADD: u8 = 1;
pub const FDB_OPER_DEL: u8 = 2;

/// FDB record MAC types.
pub const FDB_TYPE_STATIC: u8 = 1;
pub const FDB_TYPE_DYNAMIC: u8 = 2;

/// Configuration record operation codes.
pub const CFG_OPER_ADD: u8 = 1;
pub const CFG_OPER_DEL: u8 = 2;
pub const CFG_OPER_UPDATE: u8 = 3;
pub const CFG_OPER_ATTR_DEL: u8 = 4;

/// Domain configuration attribute bits.
pub const CFG_ATTR_SRC_ADDR: u32 = 1 << 0;
pub const CFG_ATTR_PEER_ADDR: u32 = 1 << 1;
pub const CFG_ATTR_PEER_LINK: u32 = 1 << 2;
pub const CFG_ATTR_KEEPALIVE_INTERVAL: u32 = 1 << 3;
pub const CFG_ATTR_SESSION_TIMEOUT: u32 = 1 << 4;

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
}

impl MsgHeader {
    pub fn encode(&self) -> [u8; MCLAG_MSG_HDR_LEN] {
        let mut buf = [0u8; MCLAG_MSG_HDR_LEN];
        buf[0] = self.version;
        buf[1] = self.msg_type;
        LittleEndian::write_u16(&mut buf[2..4], self.length);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < MCLAG_MSG_HDR_LEN {
            return None;
        }
        Some(Self {
            version: buf[0],
            msg_type: buf[1],
            length: LittleEndian::read_u16(&buf[2..4]),
        })
    }

    /// A header is well-formed when its type is set and the declared length
    /// covers the header without exceeding the frame bound.
    pub fn is_well_formed(&self) -> bool {
        self.msg_type != msg_type::NONE
            && (self.length as usize) >= MCLAG_MSG_HDR_LEN
            && (self.length as usize) <= MCLAG_MAX_MSG_LEN
    }
}

/// Accumulating frame decoder for the peer byte stream.
///
/// Bytes are appended as they arrive; complete frames are taken off the
/// front, partial frames stay buffered. An out-of-range length terminates
/// the connection.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes the next complete frame, returning its type and body.
    pub fn next_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, McLagError> {
        let Some(header) = MsgHeader::decode(&self.buf) else {
            return Ok(None);
        };
        if !header.is_well_formed() {
            return Err(McLagError::MalformedFrame {
                length: header.length,
            });
        }
        let total = header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[MCLAG_MSG_HDR_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header.msg_type, body)))
    }
}

/// Iterator over sub-option TLVs; stops at the message boundary.
pub struct TlvReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + MCLAG_SUB_OPTION_HDR_LEN > self.buf.len() {
            return None;
        }
        let op_type = self.buf[self.offset];
        let op_len = LittleEndian::read_u16(&self.buf[self.offset + 1..]) as usize;
        let value_start = self.offset + MCLAG_SUB_OPTION_HDR_LEN;
        if value_start + op_len > self.buf.len() {
            return None;
        }
        self.offset = value_start + op_len;
        Some((op_type, &self.buf[value_start..value_start + op_len]))
    }
}

/// Sub-option TLV writer (test support and future outbound TLV messages).
#[derive(Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op_type: u8, value: &[u8]) -> &mut Self {
        self.buf.push(op_type);
        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, value.len() as u16);
        self.buf.extend_from_slice(&len);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Batches fixed-size records into frames no larger than
/// [`MCLAG_MAX_MSG_LEN`].
///
/// The scratch area always begins with a header; when a record would
/// overflow, the current frame is sealed and a fresh header started. The
/// trailing partial frame is sealed by `finish`; an empty batch produces
/// nothing.
pub struct RecordBatcher {
    msg_type: u8,
    buf: Vec<u8>,
    frames: Vec<Vec<u8>>,
}

impl RecordBatcher {
    pub fn new(msg_type: u8) -> Self {
        Self {
            msg_type,
            buf: vec![0u8; MCLAG_MSG_HDR_LEN],
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, record: &[u8]) {
        if self.buf.len() + record.len() > MCLAG_MAX_MSG_LEN {
            self.seal();
        }
        self.buf.extend_from_slice(record);
    }

    fn seal(&mut self) {
        if self.buf.len() <= MCLAG_MSG_HDR_LEN {
            return;
        }
        let header = MsgHeader {
            version: MCLAG_PROTO_VERSION,
            msg_type: self.msg_type,
            length: self.buf.len() as u16,
        };
        self.buf[..MCLAG_MSG_HDR_LEN].copy_from_slice(&header.encode());
        let frame = std::mem::replace(&mut self.buf, vec![0u8; MCLAG_MSG_HDR_LEN]);
        self.frames.push(frame);
    }

    /// Seals the trailing frame and returns every completed frame in order.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        self.seal();
        self.frames
    }
}

fn write_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn read_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// One FDB update record (body of FDB_OPERATION and SET_FDB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbRecord {
    pub mac: MacAddress,
    pub vid: u32,
    pub port_name: String,
    pub fdb_type: u8,
    pub op: u8,
}

/// mac[6] + vid u32 + port[20] + type u8 + op u8.
pub const FDB_RECORD_SIZE: usize = 32;

impl FdbRecord {
    pub fn encode(&self) -> [u8; FDB_RECORD_SIZE] {
        let mut buf = [0u8; FDB_RECORD_SIZE];
        buf[0..6].copy_from_slice(self.mac.as_bytes());
        LittleEndian::write_u32(&mut buf[6..10], self.vid);
        write_fixed_str(&mut buf[10..30], &self.port_name);
        buf[30] = self.fdb_type;
        buf[31] = self.op;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FDB_RECORD_SIZE {
            return None;
        }
        Some(Self {
            mac: MacAddress::from_slice(&buf[0..6])?,
            vid: LittleEndian::read_u32(&buf[6..10]),
            port_name: read_fixed_str(&buf[10..30]),
            fdb_type: buf[30],
            op: buf[31],
        })
    }
}

/// One MCLAG domain configuration record (body of CFG_MCLAG_DOMAIN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainCfgRecord {
    pub op: u8,
    pub domain_id: u32,
    pub attr_bmap: u32,
    pub keepalive_interval: i32,
    pub session_timeout: i32,
    pub local_ip: String,
    pub peer_ip: String,
    pub peer_ifname: String,
    pub system_mac: MacAddress,
}

/// op u8 + domain u32 + bmap u32 + keepalive i32 + timeout i32 +
/// local_ip[16] + peer_ip[16] + peer_ifname[20] + mac[6].
pub const DOMAIN_CFG_RECORD_SIZE: usize = 75;

impl DomainCfgRecord {
    pub fn encode(&self) -> [u8; DOMAIN_CFG_RECORD_SIZE] {
        let mut buf = [0u8; DOMAIN_CFG_RECORD_SIZE];
        buf[0] = self.op;
        LittleEndian::write_u32(&mut buf[1..5], self.domain_id);
        LittleEndian::write_u32(&mut buf[5..9], self.attr_bmap);
        LittleEndian::write_i32(&mut buf[9..13], self.keepalive_interval);
        LittleEndian::write_i32(&mut buf[13..17], self.session_timeout);
        write_fixed_str(&mut buf[17..33], &self.local_ip);
        write_fixed_str(&mut buf[33..49], &self.peer_ip);
        write_fixed_str(&mut buf[49..69], &self.peer_ifname);
        buf[69..75].copy_from_slice(self.system_mac.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DOMAIN_CFG_RECORD_SIZE {
            return None;
        }
        Some(Self {
            op: buf[0],
            domain_id: LittleEndian::read_u32(&buf[1..5]),
            attr_bmap: LittleEndian::read_u32(&buf[5..9]),
            keepalive_interval: LittleEndian::read_i32(&buf[9..13]),
            session_timeout: LittleEndian::read_i32(&buf[13..17]),
            local_ip: read_fixed_str(&buf[17..33]),
            peer_ip: read_fixed_str(&buf[33..49]),
            peer_ifname: read_fixed_str(&buf[49..69]),
            system_mac: MacAddress::from_slice(&buf[69..75])?,
        })
    }
}

/// One MCLAG interface configuration record (body of CFG_MCLAG_IFACE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceCfgRecord {
    pub op: u8,
    pub domain_id: u32,
    pub ifname: String,
}

/// op u8 + domain u32 + ifname[20].
pub const IFACE_CFG_RECORD_SIZE: usize = 25;

impl IfaceCfgRecord {
    pub fn encode(&self) -> [u8; IFACE_CFG_RECORD_SIZE] {
        let mut buf = [0u8; IFACE_CFG_RECORD_SIZE];
        buf[0] = self.op;
        LittleEndian::write_u32(&mut buf[1..5], self.domain_id);
        write_fixed_str(&mut buf[5..25], &self.ifname);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < IFACE_CFG_RECORD_SIZE {
            return None;
        }
        Some(Self {
            op: buf[0],
            domain_id: LittleEndian::read_u32(&buf[1..5]),
            ifname: read_fixed_str(&buf[5..25]),
        })
    }
}

/// One MCLAG unique-IP interface record (body of CFG_MCLAG_UNIQUE_IP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIpCfgRecord {
    pub op: u8,
    pub ifname: String,
}

/// op u8 + ifname[20].
pub const UNIQUE_IP_CFG_RECORD_SIZE: usize = 21;

impl UniqueIpCfgRecord {
    pub fn encode(&self) -> [u8; UNIQUE_IP_CFG_RECORD_SIZE] {
        let mut buf = [0u8; UNIQUE_IP_CFG_RECORD_SIZE];
        buf[0] = self.op;
        write_fixed_str(&mut buf[1..21], &self.ifname);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < UNIQUE_IP_CFG_RECORD_SIZE {
            return None;
        }
        Some(Self {
            op: buf[0],
            ifname: read_fixed_str(&buf[1..21]),
        })
    }
}

/// One VLAN membership transition record (body of VLAN_MBR_UPDATES).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanMbrRecord {
    pub op: u8,
    pub vid: u32,
    pub ifname: String,
}

/// op u8 + vid u32 + ifname[20].
pub const VLAN_MBR_RECORD_SIZE: usize = 25;

impl VlanMbrRecord {
    pub fn encode(&self) -> [u8; VLAN_MBR_RECORD_SIZE] {
        let mut buf = [0u8; VLAN_MBR_RECORD_SIZE];
        buf[0] = self.op;
        LittleEndian::write_u32(&mut buf[1..5], self.vid);
        write_fixed_str(&mut buf[5..25], &self.ifname);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < VLAN_MBR_RECORD_SIZE {
            return None;
        }
        Some(Self {
            op: buf[0],
            vid: LittleEndian::read_u32(&buf[1..5]),
            ifname: read_fixed_str(&buf[5..25]),
        })
    }
}

/// Reads a little-endian integer TLV value of up to 4 bytes.
pub fn tlv_i32(value: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    let n = value.len().min(4);
    buf[..n].copy_from_slice(&value[..n]);
    LittleEndian::read_i32(&buf)
}

/// Reads a boolean TLV value (first byte non-zero).
pub fn tlv_bool(value: &[u8]) -> bool {
    value.first().is_some_and(|&b| b != 0)
}
