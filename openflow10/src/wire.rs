// GreenFlow: joint flow routing and link sleeping for hybrid SDN networks
// Copyright (C) 2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Byte-accurate codec for the OpenFlow 1.0 message subset spoken by this controller.
//!
//! Every message starts with the fixed 8-byte [`Header`]. Multi-byte fields are network byte
//! order on the wire and host byte order in the decoded structures. [`Message::marshal`] produces
//! a complete framed message (header included); [`Message::parse`] consumes the body that follows
//! an already-read header.

use std::io::{Cursor, Read};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::Error;

/// The protocol version this crate speaks.
pub const OFP_VERSION: u8 = 0x01;

/// Size of the fixed OpenFlow header in bytes.
pub const HEADER_LEN: usize = 8;

/// Pseudo port: not associated with a physical port.
pub const OFPP_NONE: u16 = 0xffff;
/// Pseudo port: send to the controller.
pub const OFPP_CONTROLLER: u16 = 0xfffd;
/// Pseudo port: flood on all ports except the ingress port.
pub const OFPP_FLOOD: u16 = 0xfffb;

/// Port config bit: port is administratively down.
pub const OFPPC_PORT_DOWN: u32 = 1 << 0;

/// Port feature bit: 10 Mbps full duplex.
pub const OFPPF_10MB_FD: u32 = 1 << 1;
/// Port feature bit: 100 Mbps full duplex.
pub const OFPPF_100MB_FD: u32 = 1 << 3;
/// Port feature bit: 1 Gbps full duplex.
pub const OFPPF_1GB_FD: u32 = 1 << 5;
/// Port feature bit: 10 Gbps full duplex.
pub const OFPPF_10GB_FD: u32 = 1 << 6;

/// Stats type for per-port counters.
pub const OFPST_PORT: u16 = 4;

/// Process-wide transaction id counter. Every marshalled message gets a fresh, monotonically
/// increasing xid unless the caller echoes one explicitly (echo replies).
static XID: AtomicU32 = AtomicU32::new(1);

/// Obtain a fresh transaction id.
pub fn next_xid() -> u32 {
    XID.fetch_add(1, Ordering::Relaxed)
}

/// Map a requested port speed to the corresponding advertise feature bit.
pub fn advertise_for_speed(speed_mbps: u32) -> u32 {
    if speed_mbps >= 10_000 {
        OFPPF_10GB_FD
    } else if speed_mbps >= 1_000 {
        OFPPF_1GB_FD
    } else if speed_mbps >= 100 {
        OFPPF_100MB_FD
    } else if speed_mbps >= 10 {
        OFPPF_10MB_FD
    } else {
        0
    }
}

/// All OpenFlow 1.0 message types. Only a subset is modeled as a [`Message`]; the rest is
/// recognized (so that a conforming switch never kills the session) and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MsgType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
}

impl TryFrom<u8> for MsgType {
    type Error = crate::Error;

    fn try_from(x: u8) -> Result<Self, crate::Error> {
        if x <= MsgType::QueueGetConfigReply as u8 {
            // all discriminants from 0 to 21 are populated
            Ok(unsafe { std::mem::transmute::<u8, MsgType>(x) })
        } else {
            Err(crate::Error::UnknownType(x))
        }
    }
}

/// The fixed 8-byte header preceding every OpenFlow message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (always [`OFP_VERSION`] on valid sessions).
    pub version: u8,
    /// Raw message type octet.
    pub msg_type: u8,
    /// Total message length, header included.
    pub length: u16,
    /// Transaction id, echoed by the switch in replies.
    pub xid: u32,
}

impl Header {
    /// Parse a header from its 8 raw bytes. Fails if the version is not 0x01 or the announced
    /// length is smaller than the header itself; both are fatal for the session.
    pub fn parse(buf: [u8; HEADER_LEN]) -> Result<Self, Error> {
        let mut c = Cursor::new(buf);
        let h = Header {
            version: c.read_u8()?,
            msg_type: c.read_u8()?,
            length: c.read_u16::<BigEndian>()?,
            xid: c.read_u32::<BigEndian>()?,
        };
        if h.version != OFP_VERSION {
            return Err(Error::BadVersion(h.version));
        }
        if (h.length as usize) < HEADER_LEN {
            return Err(Error::BadLength(h.length));
        }
        Ok(h)
    }

    /// Number of body bytes following this header.
    pub fn body_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    fn marshal(buf: &mut Vec<u8>, msg_type: MsgType, length: usize, xid: u32) {
        buf.push(OFP_VERSION);
        buf.push(msg_type as u8);
        buf.write_u16::<BigEndian>(length as u16).unwrap();
        buf.write_u32::<BigEndian>(xid).unwrap();
    }
}

/// Wildcard bit: ignore the ingress port.
pub const OFPFW_IN_PORT: u32 = 1 << 0;
/// Wildcard bit: ignore the VLAN id.
pub const OFPFW_DL_VLAN: u32 = 1 << 1;
/// Wildcard bit: ignore the Ethernet source.
pub const OFPFW_DL_SRC: u32 = 1 << 2;
/// Wildcard bit: ignore the Ethernet destination.
pub const OFPFW_DL_DST: u32 = 1 << 3;
/// Wildcard bit: ignore the Ethernet type.
pub const OFPFW_DL_TYPE: u32 = 1 << 4;
/// Wildcard bit: ignore the IP protocol.
pub const OFPFW_NW_PROTO: u32 = 1 << 5;
/// Wildcard bit: ignore the L4 source port.
pub const OFPFW_TP_SRC: u32 = 1 << 6;
/// Wildcard bit: ignore the L4 destination port.
pub const OFPFW_TP_DST: u32 = 1 << 7;
/// Wildcard value: ignore the full IPv4 source address (32-bit prefix wildcard field).
pub const OFPFW_NW_SRC_ALL: u32 = 32 << 8;
/// Wildcard value: ignore the full IPv4 destination address.
pub const OFPFW_NW_DST_ALL: u32 = 32 << 14;
/// Wildcard bit: ignore the VLAN priority.
pub const OFPFW_DL_VLAN_PCP: u32 = 1 << 20;
/// Wildcard bit: ignore the IP ToS bits.
pub const OFPFW_NW_TOS: u32 = 1 << 21;
/// All wildcard bits set: the match accepts every packet.
pub const OFPFW_ALL: u32 = (1 << 22) - 1;

/// The fixed 40-byte OpenFlow 1.0 `ofp_match`. Fields whose wildcard bit is set are ignored by
/// the switch; the constructors below clear exactly the bits of the fields they populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Wildcard bitmask (`OFPFW_*`).
    pub wildcards: u32,
    /// Ingress port.
    pub in_port: u16,
    /// Ethernet source address.
    pub dl_src: [u8; 6],
    /// Ethernet destination address.
    pub dl_dst: [u8; 6],
    /// VLAN id.
    pub dl_vlan: u16,
    /// VLAN priority.
    pub dl_vlan_pcp: u8,
    /// Ethernet type.
    pub dl_type: u16,
    /// IP type of service.
    pub nw_tos: u8,
    /// IP protocol number.
    pub nw_proto: u8,
    /// IPv4 source address.
    pub nw_src: u32,
    /// IPv4 destination address.
    pub nw_dst: u32,
    /// L4 source port.
    pub tp_src: u16,
    /// L4 destination port.
    pub tp_dst: u16,
}

/// Encoded size of [`Match`] on the wire.
pub const MATCH_LEN: usize = 40;

impl Match {
    /// A match that accepts every packet.
    pub fn any() -> Self {
        Match {
            wildcards: OFPFW_ALL,
            in_port: 0,
            dl_src: [0; 6],
            dl_dst: [0; 6],
            dl_vlan: 0,
            dl_vlan_pcp: 0,
            dl_type: 0,
            nw_tos: 0,
            nw_proto: 0,
            nw_src: 0,
            nw_dst: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }

    /// Exact match on `(in_port, dl_dst)`, everything else wildcarded. This is the rule shape
    /// installed by the L2 learner.
    pub fn ethernet(in_port: u16, dl_dst: [u8; 6]) -> Self {
        let mut m = Match::any();
        m.wildcards &= !(OFPFW_IN_PORT | OFPFW_DL_DST);
        m.in_port = in_port;
        m.dl_dst = dl_dst;
        m
    }

    /// IPv4 match: the addresses are always exact; the ingress port and protocol are exact when
    /// nonzero and wildcarded when 0; the L4 ports are exact when given and wildcarded when
    /// `None`.
    pub fn ipv4(
        in_port: u16,
        nw_src: Ipv4Addr,
        nw_dst: Ipv4Addr,
        nw_proto: u8,
        tp_src: Option<u16>,
        tp_dst: Option<u16>,
    ) -> Self {
        let mut m = Match::any();
        m.wildcards &= !(OFPFW_DL_TYPE | OFPFW_NW_SRC_ALL | OFPFW_NW_DST_ALL);
        m.dl_type = 0x0800;
        m.nw_src = u32::from(nw_src);
        m.nw_dst = u32::from(nw_dst);
        if in_port != 0 {
            m.wildcards &= !OFPFW_IN_PORT;
            m.in_port = in_port;
        }
        if nw_proto != 0 {
            m.wildcards &= !OFPFW_NW_PROTO;
            m.nw_proto = nw_proto;
        }
        if let Some(p) = tp_src {
            m.wildcards &= !OFPFW_TP_SRC;
            m.tp_src = p;
        }
        if let Some(p) = tp_dst {
            m.wildcards &= !OFPFW_TP_DST;
            m.tp_dst = p;
        }
        m
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.wildcards).unwrap();
        buf.write_u16::<BigEndian>(self.in_port).unwrap();
        buf.extend_from_slice(&self.dl_src);
        buf.extend_from_slice(&self.dl_dst);
        buf.write_u16::<BigEndian>(self.dl_vlan).unwrap();
        buf.push(self.dl_vlan_pcp);
        buf.push(0); // pad
        buf.write_u16::<BigEndian>(self.dl_type).unwrap();
        buf.push(self.nw_tos);
        buf.push(self.nw_proto);
        buf.extend_from_slice(&[0; 2]); // pad
        buf.write_u32::<BigEndian>(self.nw_src).unwrap();
        buf.write_u32::<BigEndian>(self.nw_dst).unwrap();
        buf.write_u16::<BigEndian>(self.tp_src).unwrap();
        buf.write_u16::<BigEndian>(self.tp_dst).unwrap();
    }

    fn parse(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let mut m = Match::any();
        m.wildcards = c.read_u32::<BigEndian>()?;
        m.in_port = c.read_u16::<BigEndian>()?;
        c.read_exact(&mut m.dl_src).map_err(Error::Io)?;
        c.read_exact(&mut m.dl_dst).map_err(Error::Io)?;
        m.dl_vlan = c.read_u16::<BigEndian>()?;
        m.dl_vlan_pcp = c.read_u8()?;
        c.read_u8()?; // pad
        m.dl_type = c.read_u16::<BigEndian>()?;
        m.nw_tos = c.read_u8()?;
        m.nw_proto = c.read_u8()?;
        c.read_u16::<BigEndian>()?; // pad
        m.nw_src = c.read_u32::<BigEndian>()?;
        m.nw_dst = c.read_u32::<BigEndian>()?;
        m.tp_src = c.read_u16::<BigEndian>()?;
        m.tp_dst = c.read_u16::<BigEndian>()?;
        Ok(m)
    }
}

/// A flow action. Only `OUTPUT` is needed by this controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forward the packet on the given port (physical or pseudo port).
    Output {
        /// Destination port.
        port: u16,
    },
}

impl Action {
    const LEN: usize = 8;

    fn marshal(&self, buf: &mut Vec<u8>) {
        match self {
            Action::Output { port } => {
                buf.write_u16::<BigEndian>(0).unwrap(); // OFPAT_OUTPUT
                buf.write_u16::<BigEndian>(Self::LEN as u16).unwrap();
                buf.write_u16::<BigEndian>(*port).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap(); // max_len
            }
        }
    }

    fn parse(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let typ = c.read_u16::<BigEndian>()?;
        let len = c.read_u16::<BigEndian>()?;
        if typ != 0 || (len as usize) != Self::LEN {
            return Err(Error::Truncated("action", Self::LEN, len as usize));
        }
        let port = c.read_u16::<BigEndian>()?;
        c.read_u16::<BigEndian>()?; // max_len
        Ok(Action::Output { port })
    }
}

/// FLOW_MOD command. The controller only adds rules and strictly deletes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    /// Install a new flow (`OFPFC_ADD`).
    Add,
    /// Strictly delete a flow (`OFPFC_DELETE_STRICT`).
    DeleteStrict,
}

impl FlowModCommand {
    fn code(&self) -> u16 {
        match self {
            FlowModCommand::Add => 0,
            FlowModCommand::DeleteStrict => 4,
        }
    }
}

/// Decoded FEATURES_REPLY. The trailing port descriptions are not consumed; ports are learned
/// from the periodic statistics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchFeatures {
    /// 64-bit datapath id, read as one network-byte-order quantity.
    pub datapath_id: u64,
    /// Number of packet buffers on the switch.
    pub n_buffers: u32,
    /// Number of flow tables.
    pub n_tables: u8,
    /// Capability bitmap.
    pub capabilities: u32,
    /// Supported action bitmap.
    pub actions: u32,
}

/// Decoded PACKET_IN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    /// Buffer id on the switch, `0xffffffff` if the full frame is carried.
    pub buffer_id: u32,
    /// Full length of the frame on the wire (may exceed `data.len()` if truncated).
    pub total_len: u16,
    /// Ingress port.
    pub in_port: u16,
    /// Reason code (no-match or action).
    pub reason: u8,
    /// The carried frame bytes.
    pub data: Vec<u8>,
}

/// PACKET_OUT payload: either a buffered packet on the switch or a full frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// Buffer to release, `0xffffffff` when `data` carries the frame.
    pub buffer_id: u32,
    /// Ingress port the frame nominally arrived on, [`OFPP_NONE`] for controller-originated.
    pub in_port: u16,
    /// Actions applied to the packet.
    pub actions: Vec<Action>,
    /// Raw frame, empty when a buffer id is used.
    pub data: Vec<u8>,
}

/// FLOW_MOD message.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowMod {
    /// Match of the rule.
    pub m: Match,
    /// Opaque cookie.
    pub cookie: u64,
    /// Add or strict-delete.
    pub command: FlowModCommand,
    /// Idle timeout in seconds (0 = none).
    pub idle_timeout: u16,
    /// Hard timeout in seconds (0 = none).
    pub hard_timeout: u16,
    /// Rule priority.
    pub priority: u16,
    /// Buffered packet to apply the rule to, `0xffffffff` for none.
    pub buffer_id: u32,
    /// Output port filter for deletions, [`OFPP_NONE`] for none.
    pub out_port: u16,
    /// Flag bitmap.
    pub flags: u16,
    /// Actions of the rule.
    pub actions: Vec<Action>,
}

/// PORT_MOD message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMod {
    /// Port to modify.
    pub port_no: u16,
    /// Hardware address of the port (must match the switch's view).
    pub hw_addr: [u8; 6],
    /// New config bits (`OFPPC_*`), only those selected by `mask`.
    pub config: u32,
    /// Which config bits to change.
    pub mask: u32,
    /// Advertised features, 0 to leave unchanged.
    pub advertise: u32,
}

/// One per-port counter block from a port statistics reply. Only the byte counters are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStats {
    /// Port number.
    pub port_no: u16,
    /// Received bytes.
    pub rx_bytes: u64,
    /// Transmitted bytes.
    pub tx_bytes: u64,
}

const PORT_STATS_LEN: usize = 104;

/// A decoded OpenFlow message (the subset this controller speaks).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Version negotiation; body-less.
    Hello,
    /// Keepalive probe with an arbitrary payload.
    EchoRequest(Vec<u8>),
    /// Keepalive answer; must echo payload and xid of the request.
    EchoReply(Vec<u8>),
    /// Ask the switch for its datapath description.
    FeaturesRequest,
    /// The switch's datapath description.
    FeaturesReply(SwitchFeatures),
    /// Ask for the current switch config.
    GetConfigRequest,
    /// Set fragment handling and the packet-in payload length.
    SetConfig {
        /// Fragment handling flags (0 = normal).
        flags: u16,
        /// Number of frame bytes carried in PACKET_IN.
        miss_send_len: u16,
    },
    /// A frame delivered to the controller.
    PacketIn(PacketIn),
    /// A frame (or buffer) pushed out a port.
    PacketOut(PacketOut),
    /// Install or remove a flow rule.
    FlowMod(FlowMod),
    /// Change port administrative state.
    PortMod(PortMod),
    /// Request per-port counters (`OFPST_PORT`).
    PortStatsRequest {
        /// Port to query, `0xffff` for all ports.
        port_no: u16,
    },
    /// Per-port counter reply.
    PortStatsReply(Vec<PortStats>),
    /// Ordering checkpoint.
    BarrierRequest,
}

impl Message {
    fn msg_type(&self) -> MsgType {
        match self {
            Message::Hello => MsgType::Hello,
            Message::EchoRequest(_) => MsgType::EchoRequest,
            Message::EchoReply(_) => MsgType::EchoReply,
            Message::FeaturesRequest => MsgType::FeaturesRequest,
            Message::FeaturesReply(_) => MsgType::FeaturesReply,
            Message::GetConfigRequest => MsgType::GetConfigRequest,
            Message::SetConfig { .. } => MsgType::SetConfig,
            Message::PacketIn(_) => MsgType::PacketIn,
            Message::PacketOut(_) => MsgType::PacketOut,
            Message::FlowMod(_) => MsgType::FlowMod,
            Message::PortMod(_) => MsgType::PortMod,
            Message::PortStatsRequest { .. } => MsgType::StatsRequest,
            Message::PortStatsReply(_) => MsgType::StatsReply,
            Message::BarrierRequest => MsgType::BarrierRequest,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Hello
            | Message::FeaturesRequest
            | Message::GetConfigRequest
            | Message::BarrierRequest => 0,
            Message::EchoRequest(p) | Message::EchoReply(p) => p.len(),
            Message::FeaturesReply(_) => 24,
            Message::SetConfig { .. } => 4,
            Message::PacketIn(pi) => 10 + pi.data.len(),
            Message::PacketOut(po) => 8 + po.actions.len() * Action::LEN + po.data.len(),
            Message::FlowMod(fm) => MATCH_LEN + 24 + fm.actions.len() * Action::LEN,
            Message::PortMod(_) => 24,
            Message::PortStatsRequest { .. } => 12,
            Message::PortStatsReply(v) => 4 + v.len() * PORT_STATS_LEN,
        }
    }

    /// Encode the message as one framed byte buffer, header included.
    pub fn marshal(&self, xid: u32) -> Vec<u8> {
        let len = HEADER_LEN + self.body_len();
        let mut buf = Vec::with_capacity(len);
        Header::marshal(&mut buf, self.msg_type(), len, xid);
        match self {
            Message::Hello
            | Message::FeaturesRequest
            | Message::GetConfigRequest
            | Message::BarrierRequest => {}
            Message::EchoRequest(p) | Message::EchoReply(p) => buf.extend_from_slice(p),
            Message::FeaturesReply(f) => {
                buf.write_u64::<BigEndian>(f.datapath_id).unwrap();
                buf.write_u32::<BigEndian>(f.n_buffers).unwrap();
                buf.push(f.n_tables);
                buf.extend_from_slice(&[0; 3]); // pad
                buf.write_u32::<BigEndian>(f.capabilities).unwrap();
                buf.write_u32::<BigEndian>(f.actions).unwrap();
            }
            Message::SetConfig {
                flags,
                miss_send_len,
            } => {
                buf.write_u16::<BigEndian>(*flags).unwrap();
                buf.write_u16::<BigEndian>(*miss_send_len).unwrap();
            }
            Message::PacketIn(pi) => {
                buf.write_u32::<BigEndian>(pi.buffer_id).unwrap();
                buf.write_u16::<BigEndian>(pi.total_len).unwrap();
                buf.write_u16::<BigEndian>(pi.in_port).unwrap();
                buf.push(pi.reason);
                buf.push(0); // pad
                buf.extend_from_slice(&pi.data);
            }
            Message::PacketOut(po) => {
                buf.write_u32::<BigEndian>(po.buffer_id).unwrap();
                buf.write_u16::<BigEndian>(po.in_port).unwrap();
                buf.write_u16::<BigEndian>((po.actions.len() * Action::LEN) as u16)
                    .unwrap();
                for a in &po.actions {
                    a.marshal(&mut buf);
                }
                buf.extend_from_slice(&po.data);
            }
            Message::FlowMod(fm) => {
                fm.m.marshal(&mut buf);
                buf.write_u64::<BigEndian>(fm.cookie).unwrap();
                buf.write_u16::<BigEndian>(fm.command.code()).unwrap();
                buf.write_u16::<BigEndian>(fm.idle_timeout).unwrap();
                buf.write_u16::<BigEndian>(fm.hard_timeout).unwrap();
                buf.write_u16::<BigEndian>(fm.priority).unwrap();
                buf.write_u32::<BigEndian>(fm.buffer_id).unwrap();
                buf.write_u16::<BigEndian>(fm.out_port).unwrap();
                buf.write_u16::<BigEndian>(fm.flags).unwrap();
                for a in &fm.actions {
                    a.marshal(&mut buf);
                }
            }
            Message::PortMod(pm) => {
                buf.write_u16::<BigEndian>(pm.port_no).unwrap();
                buf.extend_from_slice(&pm.hw_addr);
                buf.write_u32::<BigEndian>(pm.config).unwrap();
                buf.write_u32::<BigEndian>(pm.mask).unwrap();
                buf.write_u32::<BigEndian>(pm.advertise).unwrap();
                buf.extend_from_slice(&[0; 4]); // pad
            }
            Message::PortStatsRequest { port_no } => {
                buf.write_u16::<BigEndian>(OFPST_PORT).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap(); // flags
                buf.write_u16::<BigEndian>(*port_no).unwrap();
                buf.extend_from_slice(&[0; 6]); // pad
            }
            Message::PortStatsReply(stats) => {
                buf.write_u16::<BigEndian>(OFPST_PORT).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap(); // flags
                for s in stats {
                    buf.write_u16::<BigEndian>(s.port_no).unwrap();
                    buf.extend_from_slice(&[0; 6]); // pad
                    for counter in [0, 0, s.rx_bytes, s.tx_bytes, 0, 0, 0, 0, 0, 0, 0, 0] {
                        buf.write_u64::<BigEndian>(counter).unwrap();
                    }
                }
            }
        }
        debug_assert_eq!(buf.len(), len);
        buf
    }

    /// Decode the body following `header`. Returns `Ok(None)` for valid OpenFlow 1.0 types this
    /// controller does not model (errors, vendor messages, replies it does not consume).
    pub fn parse(header: &Header, body: &[u8]) -> Result<Option<Message>, Error> {
        let typ = MsgType::try_from(header.msg_type)?;
        let mut c = Cursor::new(body);
        let need = |n: usize, what: &'static str| -> Result<(), Error> {
            if body.len() < n {
                Err(Error::Truncated(what, n, body.len()))
            } else {
                Ok(())
            }
        };
        let msg = match typ {
            MsgType::Hello => Message::Hello,
            MsgType::EchoRequest => Message::EchoRequest(body.to_vec()),
            MsgType::EchoReply => Message::EchoReply(body.to_vec()),
            MsgType::FeaturesRequest => Message::FeaturesRequest,
            MsgType::FeaturesReply => {
                need(24, "FEATURES_REPLY")?;
                let f = SwitchFeatures {
                    datapath_id: c.read_u64::<BigEndian>()?,
                    n_buffers: c.read_u32::<BigEndian>()?,
                    n_tables: {
                        let n = c.read_u8()?;
                        c.read_exact(&mut [0; 3]).map_err(Error::Io)?;
                        n
                    },
                    capabilities: c.read_u32::<BigEndian>()?,
                    actions: c.read_u32::<BigEndian>()?,
                };
                Message::FeaturesReply(f)
            }
            MsgType::GetConfigRequest => Message::GetConfigRequest,
            MsgType::SetConfig => {
                need(4, "SET_CONFIG")?;
                Message::SetConfig {
                    flags: c.read_u16::<BigEndian>()?,
                    miss_send_len: c.read_u16::<BigEndian>()?,
                }
            }
            MsgType::PacketIn => {
                need(10, "PACKET_IN")?;
                let buffer_id = c.read_u32::<BigEndian>()?;
                let total_len = c.read_u16::<BigEndian>()?;
                let in_port = c.read_u16::<BigEndian>()?;
                let reason = c.read_u8()?;
                c.read_u8()?; // pad
                Message::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    in_port,
                    reason,
                    data: body[10..].to_vec(),
                })
            }
            MsgType::PacketOut => {
                need(8, "PACKET_OUT")?;
                let buffer_id = c.read_u32::<BigEndian>()?;
                let in_port = c.read_u16::<BigEndian>()?;
                let actions_len = c.read_u16::<BigEndian>()? as usize;
                need(8 + actions_len, "PACKET_OUT actions")?;
                let mut actions = Vec::with_capacity(actions_len / Action::LEN);
                for _ in 0..actions_len / Action::LEN {
                    actions.push(Action::parse(&mut c)?);
                }
                Message::PacketOut(PacketOut {
                    buffer_id,
                    in_port,
                    actions,
                    data: body[8 + actions_len..].to_vec(),
                })
            }
            MsgType::FlowMod => {
                need(MATCH_LEN + 24, "FLOW_MOD")?;
                let m = Match::parse(&mut c)?;
                let cookie = c.read_u64::<BigEndian>()?;
                let command = match c.read_u16::<BigEndian>()? {
                    0 => FlowModCommand::Add,
                    4 => FlowModCommand::DeleteStrict,
                    x => return Err(Error::UnknownType(x as u8)),
                };
                let idle_timeout = c.read_u16::<BigEndian>()?;
                let hard_timeout = c.read_u16::<BigEndian>()?;
                let priority = c.read_u16::<BigEndian>()?;
                let buffer_id = c.read_u32::<BigEndian>()?;
                let out_port = c.read_u16::<BigEndian>()?;
                let flags = c.read_u16::<BigEndian>()?;
                let mut actions = Vec::new();
                while (c.position() as usize) < body.len() {
                    actions.push(Action::parse(&mut c)?);
                }
                Message::FlowMod(FlowMod {
                    m,
                    cookie,
                    command,
                    idle_timeout,
                    hard_timeout,
                    priority,
                    buffer_id,
                    out_port,
                    flags,
                    actions,
                })
            }
            MsgType::PortMod => {
                need(24, "PORT_MOD")?;
                let port_no = c.read_u16::<BigEndian>()?;
                let mut hw_addr = [0; 6];
                c.read_exact(&mut hw_addr).map_err(Error::Io)?;
                Message::PortMod(PortMod {
                    port_no,
                    hw_addr,
                    config: c.read_u32::<BigEndian>()?,
                    mask: c.read_u32::<BigEndian>()?,
                    advertise: c.read_u32::<BigEndian>()?,
                })
            }
            MsgType::StatsRequest => {
                need(12, "STATS_REQUEST")?;
                let styp = c.read_u16::<BigEndian>()?;
                c.read_u16::<BigEndian>()?; // flags
                if styp != OFPST_PORT {
                    return Ok(None);
                }
                Message::PortStatsRequest {
                    port_no: c.read_u16::<BigEndian>()?,
                }
            }
            MsgType::StatsReply => {
                need(4, "STATS_REPLY")?;
                let styp = c.read_u16::<BigEndian>()?;
                c.read_u16::<BigEndian>()?; // flags
                if styp != OFPST_PORT {
                    return Ok(None);
                }
                let mut stats = Vec::new();
                let mut off = 4;
                while off + PORT_STATS_LEN <= body.len() {
                    let port_no = c.read_u16::<BigEndian>()?;
                    c.read_exact(&mut [0; 6]).map_err(Error::Io)?;
                    let mut counters = [0u64; 12];
                    for x in counters.iter_mut() {
                        *x = c.read_u64::<BigEndian>()?;
                    }
                    stats.push(PortStats {
                        port_no,
                        rx_bytes: counters[2],
                        tx_bytes: counters[3],
                    });
                    off += PORT_STATS_LEN;
                }
                Message::PortStatsReply(stats)
            }
            MsgType::BarrierRequest => Message::BarrierRequest,
            // valid types the controller receives but does not act upon
            MsgType::Error
            | MsgType::Vendor
            | MsgType::GetConfigReply
            | MsgType::FlowRemoved
            | MsgType::PortStatus
            | MsgType::BarrierReply
            | MsgType::QueueGetConfigRequest
            | MsgType::QueueGetConfigReply => return Ok(None),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let bytes = msg.marshal(7);
        let mut hdr = [0; HEADER_LEN];
        hdr.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = Header::parse(hdr).unwrap();
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.xid, 7);
        Message::parse(&header, &bytes[HEADER_LEN..])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn header_layout() {
        let bytes = Message::Hello.marshal(0x01020304);
        assert_eq!(bytes, vec![0x01, 0x00, 0x00, 0x08, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn header_rejects_bad_version() {
        assert!(matches!(
            Header::parse([0x04, 0, 0, 8, 0, 0, 0, 0]),
            Err(Error::BadVersion(0x04))
        ));
    }

    #[test]
    fn header_rejects_short_length() {
        assert!(matches!(
            Header::parse([0x01, 0, 0, 7, 0, 0, 0, 0]),
            Err(Error::BadLength(7))
        ));
    }

    #[test]
    fn match_is_40_bytes_on_the_wire() {
        let mut buf = Vec::new();
        Match::any().marshal(&mut buf);
        assert_eq!(buf.len(), MATCH_LEN);
    }

    #[test]
    fn ethernet_match_clears_exactly_two_wildcards() {
        let m = Match::ethernet(3, [0xaa; 6]);
        assert_eq!(m.wildcards, OFPFW_ALL & !(OFPFW_IN_PORT | OFPFW_DL_DST));
        assert_eq!(m.in_port, 3);
        assert_eq!(m.dl_dst, [0xaa; 6]);
    }

    #[test]
    fn ipv4_match_wildcards_omitted_ports() {
        let m = Match::ipv4(
            1,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            6,
            Some(12345),
            None,
        );
        assert_eq!(m.wildcards & OFPFW_TP_SRC, 0);
        assert_eq!(m.wildcards & OFPFW_TP_DST, OFPFW_TP_DST);
        assert_eq!(m.dl_type, 0x0800);
        assert_eq!(m.nw_src, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn flow_mod_roundtrip() {
        let msg = Message::FlowMod(FlowMod {
            m: Match::ethernet(2, [1, 2, 3, 4, 5, 6]),
            cookie: 0x1,
            command: FlowModCommand::Add,
            idle_timeout: 30,
            hard_timeout: 0,
            priority: 100,
            buffer_id: 0x42,
            out_port: OFPP_NONE,
            flags: 0,
            actions: vec![Action::Output { port: 5 }],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
        // header (8) + match (40) + fixed flow-mod tail (24) + one action (8)
        assert_eq!(msg.marshal(1).len(), 80);
    }

    #[test]
    fn port_mod_is_32_bytes() {
        let msg = Message::PortMod(PortMod {
            port_no: 4,
            hw_addr: [0; 6],
            config: OFPPC_PORT_DOWN,
            mask: OFPPC_PORT_DOWN,
            advertise: OFPPF_10GB_FD,
        });
        assert_eq!(msg.marshal(1).len(), 32);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn features_reply_reads_full_network_order_dpid() {
        let msg = Message::FeaturesReply(SwitchFeatures {
            datapath_id: 0x0102030405060708,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
        });
        let bytes = msg.marshal(1);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn packet_in_roundtrip() {
        let msg = Message::PacketIn(PacketIn {
            buffer_id: 9,
            total_len: 60,
            in_port: 3,
            reason: 0,
            data: vec![0xde; 60],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn port_stats_reply_extracts_byte_counters() {
        let msg = Message::PortStatsReply(vec![
            PortStats {
                port_no: 1,
                rx_bytes: 1000,
                tx_bytes: 2000,
            },
            PortStats {
                port_no: 2,
                rx_bytes: 3000,
                tx_bytes: 4000,
            },
        ]);
        assert_eq!(roundtrip(msg.clone()), msg);
        // stats header (4) + two 104-byte blocks
        assert_eq!(msg.marshal(1).len(), HEADER_LEN + 4 + 2 * 104);
    }

    #[test]
    fn stats_request_targets_all_ports() {
        let bytes = Message::PortStatsRequest { port_no: 0xffff }.marshal(1);
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[8..10], &[0x00, 0x04]); // OFPST_PORT
        assert_eq!(&bytes[12..14], &[0xff, 0xff]);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let header = Header {
            version: OFP_VERSION,
            msg_type: 77,
            length: 8,
            xid: 0,
        };
        assert!(matches!(
            Message::parse(&header, &[]),
            Err(Error::UnknownType(77))
        ));
    }

    #[test]
    fn unmodeled_types_parse_to_none() {
        let header = Header {
            version: OFP_VERSION,
            msg_type: MsgType::PortStatus as u8,
            length: 8,
            xid: 0,
        };
        assert_eq!(Message::parse(&header, &[]).unwrap(), None);
    }

    #[test]
    fn advertise_bits_follow_speed_tiers() {
        assert_eq!(advertise_for_speed(10_000), OFPPF_10GB_FD);
        assert_eq!(advertise_for_speed(1_000), OFPPF_1GB_FD);
        assert_eq!(advertise_for_speed(100), OFPPF_100MB_FD);
        assert_eq!(advertise_for_speed(10), OFPPF_10MB_FD);
        assert_eq!(advertise_for_speed(9), 0);
    }
}
