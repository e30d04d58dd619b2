//! Chunk types and their wire encoding.

pub mod packet;
pub mod reconfig;

pub use reconfig::{ReconfigParam, ReconfigResult};

use crate::gap_list::GapBlock;
use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

// Chunk Types
const CT_DATA: u8 = 0;
const CT_INIT: u8 = 1;
const CT_INIT_ACK: u8 = 2;
const CT_SACK: u8 = 3;
const CT_HEARTBEAT: u8 = 4;
const CT_HEARTBEAT_ACK: u8 = 5;
const CT_ABORT: u8 = 6;
const CT_SHUTDOWN: u8 = 7;
const CT_SHUTDOWN_ACK: u8 = 8;
const CT_ERROR: u8 = 9;
const CT_COOKIE_ECHO: u8 = 10;
const CT_COOKIE_ACK: u8 = 11;
const CT_SHUTDOWN_COMPLETE: u8 = 14;
const CT_NR_SACK: u8 = 16;
const CT_ASCONF_ACK: u8 = 128;
const CT_PACKET_DROP: u8 = 129;
const CT_RECONFIG: u8 = 130;
const CT_FORWARD_TSN: u8 = 192;
const CT_ASCONF: u8 = 193;

/// Extensions advertised in INIT and INIT ACK.
pub(crate) const SUPPORTED_EXTENSIONS: [u8; 6] = [
    CT_NR_SACK,
    CT_ASCONF_ACK,
    CT_PACKET_DROP,
    CT_RECONFIG,
    CT_FORWARD_TSN,
    CT_ASCONF,
];

// DATA flags
const DATA_FLAG_END: u8 = 0x01;
const DATA_FLAG_BEGIN: u8 = 0x02;
const DATA_FLAG_UNORDERED: u8 = 0x04;
const DATA_FLAG_IMMEDIATE: u8 = 0x08;

const FLAG_TCB_REFLECTED: u8 = 0x01;
const NR_SACK_FLAG_SUBTRACT_R_GAPS: u8 = 0x01;

const PACKET_DROP_FLAG_MIDDLEBOX: u8 = 0x01;
const PACKET_DROP_FLAG_BAD_CHECKSUM: u8 = 0x02;
const PACKET_DROP_FLAG_TRUNCATED: u8 = 0x04;

// Parameter types
const PARAM_HEARTBEAT_INFO: u16 = 1;
const PARAM_IPV4: u16 = 5;
const PARAM_IPV6: u16 = 6;
const PARAM_STATE_COOKIE: u16 = 7;
const PARAM_SUPPORTED_EXTENSIONS: u16 = 0x8008;
const PARAM_FORWARD_TSN_SUPPORTED: u16 = 0xC000;
const PARAM_ADD_IP: u16 = 0xC001;
const PARAM_DELETE_IP: u16 = 0xC002;
const PARAM_ERROR_CAUSE_INDICATION: u16 = 0xC003;
const PARAM_SET_PRIMARY: u16 = 0xC004;

// Error cause codes
pub const CAUSE_INVALID_STREAM: u16 = 1;
pub const CAUSE_PROTOCOL_VIOLATION: u16 = 13;
pub const CAUSE_NO_USER_DATA: u16 = 9;
pub const CAUSE_USER_INITIATED_ABORT: u16 = 12;
pub const CAUSE_DELETE_LAST_ADDRESS: u16 = 0x00A0;
pub const CAUSE_RESOURCE_SHORTAGE: u16 = 0x00A1;
pub const CAUSE_DELETE_SOURCE_ADDRESS: u16 = 0x00A2;
pub const CAUSE_UNRESOLVABLE_ADDRESS: u16 = 5;

/// The closed set of chunk types the association understands. SACK and
/// NR-SACK share [`ChunkType::Sack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Data,
    Init,
    InitAck,
    Sack,
    Heartbeat,
    HeartbeatAck,
    Abort,
    Shutdown,
    ShutdownAck,
    Error,
    CookieEcho,
    CookieAck,
    ShutdownComplete,
    ForwardTsn,
    ReConfig,
    Asconf,
    AsconfAck,
    PacketDrop,
}

impl ChunkType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            CT_DATA => Self::Data,
            CT_INIT => Self::Init,
            CT_INIT_ACK => Self::InitAck,
            CT_SACK | CT_NR_SACK => Self::Sack,
            CT_HEARTBEAT => Self::Heartbeat,
            CT_HEARTBEAT_ACK => Self::HeartbeatAck,
            CT_ABORT => Self::Abort,
            CT_SHUTDOWN => Self::Shutdown,
            CT_SHUTDOWN_ACK => Self::ShutdownAck,
            CT_ERROR => Self::Error,
            CT_COOKIE_ECHO => Self::CookieEcho,
            CT_COOKIE_ACK => Self::CookieAck,
            CT_SHUTDOWN_COMPLETE => Self::ShutdownComplete,
            CT_FORWARD_TSN => Self::ForwardTsn,
            CT_RECONFIG => Self::ReConfig,
            CT_ASCONF => Self::Asconf,
            CT_ASCONF_ACK => Self::AsconfAck,
            CT_PACKET_DROP => Self::PacketDrop,
            _ => return None,
        })
    }

    /// Chunk types accepted without a matching verification tag. INIT arrives
    /// before any tag exists; ABORT and ERROR may carry the peer's own tag.
    pub fn bypasses_verification_tag(self) -> bool {
        matches!(self, Self::Init | Self::Abort | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    /// I bit: the receiver should acknowledge without delay.
    pub immediate: bool,
    pub payload: Bytes,
}

/// Body of INIT and INIT ACK. `cookie` is only present in INIT ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub addresses: Vec<IpAddr>,
    pub forward_tsn_supported: bool,
    pub supported_extensions: Vec<u8>,
    pub cookie: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sack {
    pub cum_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<GapBlock>,
    /// Non-zero count turns the chunk into an NR-SACK on the wire.
    pub nr_gap_blocks: Vec<GapBlock>,
    pub duplicates: Vec<u32>,
    pub nr_subtract_r_gaps: bool,
    /// Guard sequence number. Carried only between in-process peers; the
    /// wire format has no slot for it and decoding always yields `None`.
    pub sequence: Option<u32>,
}

impl Sack {
    pub fn is_nr(&self) -> bool {
        !self.nr_gap_blocks.is_empty() || self.nr_subtract_r_gaps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: u16,
    pub info: Bytes,
}

impl ErrorCause {
    pub fn new(code: u16, info: Bytes) -> Self {
        Self { code, info }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTsn {
    pub new_cum_tsn: u32,
    /// (stream id, stream sequence) pairs for skipped ordered messages.
    pub streams: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsconfRequest {
    AddIp(IpAddr),
    DeleteIp(IpAddr),
    SetPrimary(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsconfParam {
    pub correlation_id: u32,
    pub request: AsconfRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asconf {
    pub serial: u32,
    pub address: Option<IpAddr>,
    pub params: Vec<AsconfParam>,
}

/// Only failed requests are listed; anything missing succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsconfAck {
    pub serial: u32,
    pub failures: Vec<(u32, ErrorCause)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDrop {
    pub from_middlebox: bool,
    pub bad_checksum: bool,
    pub truncated: bool,
    pub bandwidth: u32,
    pub queue_size: u32,
    pub truncated_length: u16,
    /// Leading bytes of the dropped packet, common header included.
    pub packet: Bytes,
}

impl PacketDrop {
    /// TSNs of the DATA chunks contained in the reported packet.
    pub fn dropped_data_tsns(&self) -> Vec<u32> {
        let mut tsns = Vec::new();
        if self.packet.len() < packet::COMMON_HEADER_LEN {
            return tsns;
        }
        let mut buf = self.packet.slice(packet::COMMON_HEADER_LEN..);
        while buf.remaining() >= CHUNK_HEADER_SIZE {
            let kind = buf.get_u8();
            let _flags = buf.get_u8();
            let length = buf.get_u16() as usize;
            if length < CHUNK_HEADER_SIZE {
                break;
            }
            let body_len = length - CHUNK_HEADER_SIZE;
            if kind == CT_DATA && buf.remaining() >= 4 {
                tsns.push(buf.clone().get_u32());
            }
            if buf.remaining() < body_len {
                break;
            }
            buf.advance(body_len);
            let padding = (4 - (length % 4)) % 4;
            buf.advance(padding.min(buf.remaining()));
        }
        tsns
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Data),
    Init(Init),
    InitAck(Init),
    Sack(Sack),
    Heartbeat { info: Bytes },
    HeartbeatAck { info: Bytes },
    Abort { reflected: bool, causes: Vec<ErrorCause> },
    Shutdown { cum_tsn_ack: u32 },
    ShutdownAck,
    Error { causes: Vec<ErrorCause> },
    CookieEcho { cookie: Bytes },
    CookieAck,
    ShutdownComplete { reflected: bool },
    ForwardTsn(ForwardTsn),
    ReConfig { params: Vec<ReconfigParam> },
    Asconf(Asconf),
    AsconfAck(AsconfAck),
    PacketDrop(PacketDrop),
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Data(_) => ChunkType::Data,
            Chunk::Init(_) => ChunkType::Init,
            Chunk::InitAck(_) => ChunkType::InitAck,
            Chunk::Sack(_) => ChunkType::Sack,
            Chunk::Heartbeat { .. } => ChunkType::Heartbeat,
            Chunk::HeartbeatAck { .. } => ChunkType::HeartbeatAck,
            Chunk::Abort { .. } => ChunkType::Abort,
            Chunk::Shutdown { .. } => ChunkType::Shutdown,
            Chunk::ShutdownAck => ChunkType::ShutdownAck,
            Chunk::Error { .. } => ChunkType::Error,
            Chunk::CookieEcho { .. } => ChunkType::CookieEcho,
            Chunk::CookieAck => ChunkType::CookieAck,
            Chunk::ShutdownComplete { .. } => ChunkType::ShutdownComplete,
            Chunk::ForwardTsn(_) => ChunkType::ForwardTsn,
            Chunk::ReConfig { .. } => ChunkType::ReConfig,
            Chunk::Asconf(_) => ChunkType::Asconf,
            Chunk::AsconfAck(_) => ChunkType::AsconfAck,
            Chunk::PacketDrop(_) => ChunkType::PacketDrop,
        }
    }

    /// Appends the chunk, including trailing padding, to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        let (code, flags) = match self {
            Chunk::Data(data) => {
                body.put_u32(data.tsn);
                body.put_u16(data.stream_id);
                body.put_u16(data.stream_seq);
                body.put_u32(data.ppid);
                body.put_slice(&data.payload);
                let mut flags = 0;
                if data.ending {
                    flags |= DATA_FLAG_END;
                }
                if data.beginning {
                    flags |= DATA_FLAG_BEGIN;
                }
                if data.unordered {
                    flags |= DATA_FLAG_UNORDERED;
                }
                if data.immediate {
                    flags |= DATA_FLAG_IMMEDIATE;
                }
                (CT_DATA, flags)
            }
            Chunk::Init(init) => {
                encode_init(init, &mut body);
                (CT_INIT, 0)
            }
            Chunk::InitAck(init) => {
                encode_init(init, &mut body);
                (CT_INIT_ACK, 0)
            }
            Chunk::Sack(sack) => {
                body.put_u32(sack.cum_tsn_ack);
                body.put_u32(sack.a_rwnd);
                if sack.is_nr() {
                    body.put_u16(sack.gap_blocks.len() as u16);
                    body.put_u16(sack.nr_gap_blocks.len() as u16);
                    body.put_u16(sack.duplicates.len() as u16);
                    body.put_u16(0);
                    for block in sack.gap_blocks.iter().chain(sack.nr_gap_blocks.iter()) {
                        body.put_u16(block.start);
                        body.put_u16(block.end);
                    }
                } else {
                    body.put_u16(sack.gap_blocks.len() as u16);
                    body.put_u16(sack.duplicates.len() as u16);
                    for block in &sack.gap_blocks {
                        body.put_u16(block.start);
                        body.put_u16(block.end);
                    }
                }
                for dup in &sack.duplicates {
                    body.put_u32(*dup);
                }
                if sack.is_nr() {
                    let flags = if sack.nr_subtract_r_gaps {
                        NR_SACK_FLAG_SUBTRACT_R_GAPS
                    } else {
                        0
                    };
                    (CT_NR_SACK, flags)
                } else {
                    (CT_SACK, 0)
                }
            }
            Chunk::Heartbeat { info } => {
                put_param(&mut body, PARAM_HEARTBEAT_INFO, info);
                (CT_HEARTBEAT, 0)
            }
            Chunk::HeartbeatAck { info } => {
                put_param(&mut body, PARAM_HEARTBEAT_INFO, info);
                (CT_HEARTBEAT_ACK, 0)
            }
            Chunk::Abort { reflected, causes } => {
                encode_causes(causes, &mut body);
                (CT_ABORT, if *reflected { FLAG_TCB_REFLECTED } else { 0 })
            }
            Chunk::Shutdown { cum_tsn_ack } => {
                body.put_u32(*cum_tsn_ack);
                (CT_SHUTDOWN, 0)
            }
            Chunk::ShutdownAck => (CT_SHUTDOWN_ACK, 0),
            Chunk::Error { causes } => {
                encode_causes(causes, &mut body);
                (CT_ERROR, 0)
            }
            Chunk::CookieEcho { cookie } => {
                body.put_slice(cookie);
                (CT_COOKIE_ECHO, 0)
            }
            Chunk::CookieAck => (CT_COOKIE_ACK, 0),
            Chunk::ShutdownComplete { reflected } => (
                CT_SHUTDOWN_COMPLETE,
                if *reflected { FLAG_TCB_REFLECTED } else { 0 },
            ),
            Chunk::ForwardTsn(fwd) => {
                body.put_u32(fwd.new_cum_tsn);
                for (sid, ssn) in &fwd.streams {
                    body.put_u16(*sid);
                    body.put_u16(*ssn);
                }
                (CT_FORWARD_TSN, 0)
            }
            Chunk::ReConfig { params } => {
                for param in params {
                    param.encode(&mut body);
                }
                (CT_RECONFIG, 0)
            }
            Chunk::Asconf(asconf) => {
                body.put_u32(asconf.serial);
                if let Some(addr) = asconf.address {
                    put_address(&mut body, addr);
                }
                for param in &asconf.params {
                    let (kind, addr) = match param.request {
                        AsconfRequest::AddIp(a) => (PARAM_ADD_IP, a),
                        AsconfRequest::DeleteIp(a) => (PARAM_DELETE_IP, a),
                        AsconfRequest::SetPrimary(a) => (PARAM_SET_PRIMARY, a),
                    };
                    let mut value = BytesMut::new();
                    value.put_u32(param.correlation_id);
                    put_address(&mut value, addr);
                    put_param(&mut body, kind, &value);
                }
                (CT_ASCONF, 0)
            }
            Chunk::AsconfAck(ack) => {
                body.put_u32(ack.serial);
                for (correlation_id, cause) in &ack.failures {
                    let mut value = BytesMut::new();
                    value.put_u32(*correlation_id);
                    encode_causes(std::slice::from_ref(cause), &mut value);
                    put_param(&mut body, PARAM_ERROR_CAUSE_INDICATION, &value);
                }
                (CT_ASCONF_ACK, 0)
            }
            Chunk::PacketDrop(drop) => {
                body.put_u32(drop.bandwidth);
                body.put_u32(drop.queue_size);
                body.put_u16(drop.truncated_length);
                body.put_u16(0);
                body.put_slice(&drop.packet);
                let mut flags = 0;
                if drop.from_middlebox {
                    flags |= PACKET_DROP_FLAG_MIDDLEBOX;
                }
                if drop.bad_checksum {
                    flags |= PACKET_DROP_FLAG_BAD_CHECKSUM;
                }
                if drop.truncated {
                    flags |= PACKET_DROP_FLAG_TRUNCATED;
                }
                (CT_PACKET_DROP, flags)
            }
        };

        let length = CHUNK_HEADER_SIZE + body.len();
        buf.put_u8(code);
        buf.put_u8(flags);
        buf.put_u16(length as u16);
        buf.put_slice(&body);
        let padding = (4 - (length % 4)) % 4;
        buf.put_bytes(0, padding);
    }

    /// Encoded size including padding.
    pub fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }

    /// Decodes one chunk body. Returns `Ok(None)` for chunk types outside the
    /// supported set.
    pub fn decode(code: u8, flags: u8, mut buf: Bytes) -> Result<Option<Chunk>> {
        let Some(kind) = ChunkType::from_code(code) else {
            return Ok(None);
        };
        let chunk = match kind {
            ChunkType::Data => {
                ensure!(buf.remaining() >= 12, "DATA chunk too short");
                let tsn = buf.get_u32();
                let stream_id = buf.get_u16();
                let stream_seq = buf.get_u16();
                let ppid = buf.get_u32();
                Chunk::Data(Data {
                    tsn,
                    stream_id,
                    stream_seq,
                    ppid,
                    unordered: flags & DATA_FLAG_UNORDERED != 0,
                    beginning: flags & DATA_FLAG_BEGIN != 0,
                    ending: flags & DATA_FLAG_END != 0,
                    immediate: flags & DATA_FLAG_IMMEDIATE != 0,
                    payload: buf,
                })
            }
            ChunkType::Init => Chunk::Init(decode_init(buf)?),
            ChunkType::InitAck => Chunk::InitAck(decode_init(buf)?),
            ChunkType::Sack => Chunk::Sack(decode_sack(code == CT_NR_SACK, flags, buf)?),
            ChunkType::Heartbeat => Chunk::Heartbeat {
                info: decode_heartbeat_info(buf)?,
            },
            ChunkType::HeartbeatAck => Chunk::HeartbeatAck {
                info: decode_heartbeat_info(buf)?,
            },
            ChunkType::Abort => Chunk::Abort {
                reflected: flags & FLAG_TCB_REFLECTED != 0,
                causes: decode_causes(buf)?,
            },
            ChunkType::Shutdown => {
                ensure!(buf.remaining() >= 4, "SHUTDOWN chunk too short");
                Chunk::Shutdown {
                    cum_tsn_ack: buf.get_u32(),
                }
            }
            ChunkType::ShutdownAck => Chunk::ShutdownAck,
            ChunkType::Error => Chunk::Error {
                causes: decode_causes(buf)?,
            },
            ChunkType::CookieEcho => Chunk::CookieEcho { cookie: buf },
            ChunkType::CookieAck => Chunk::CookieAck,
            ChunkType::ShutdownComplete => Chunk::ShutdownComplete {
                reflected: flags & FLAG_TCB_REFLECTED != 0,
            },
            ChunkType::ForwardTsn => {
                ensure!(buf.remaining() >= 4, "FORWARD TSN chunk too short");
                let new_cum_tsn = buf.get_u32();
                let mut streams = Vec::new();
                while buf.remaining() >= 4 {
                    streams.push((buf.get_u16(), buf.get_u16()));
                }
                Chunk::ForwardTsn(ForwardTsn {
                    new_cum_tsn,
                    streams,
                })
            }
            ChunkType::ReConfig => {
                let mut params = Vec::new();
                for (kind, value) in params_iter(buf)? {
                    match ReconfigParam::decode(kind, value)? {
                        Some(param) => params.push(param),
                        None => tracing::trace!("Skipping unknown RE-CONFIG parameter {}", kind),
                    }
                }
                Chunk::ReConfig { params }
            }
            ChunkType::Asconf => Chunk::Asconf(decode_asconf(buf)?),
            ChunkType::AsconfAck => {
                ensure!(buf.remaining() >= 4, "ASCONF-ACK chunk too short");
                let serial = buf.get_u32();
                let mut failures = Vec::new();
                for (kind, mut value) in params_iter(buf)? {
                    if kind == PARAM_ERROR_CAUSE_INDICATION && value.remaining() >= 4 {
                        let correlation_id = value.get_u32();
                        if let Some(cause) = decode_causes(value)?.into_iter().next() {
                            failures.push((correlation_id, cause));
                        }
                    }
                }
                Chunk::AsconfAck(AsconfAck { serial, failures })
            }
            ChunkType::PacketDrop => {
                ensure!(buf.remaining() >= 12, "PACKET DROP chunk too short");
                let bandwidth = buf.get_u32();
                let queue_size = buf.get_u32();
                let truncated_length = buf.get_u16();
                buf.advance(2);
                Chunk::PacketDrop(PacketDrop {
                    from_middlebox: flags & PACKET_DROP_FLAG_MIDDLEBOX != 0,
                    bad_checksum: flags & PACKET_DROP_FLAG_BAD_CHECKSUM != 0,
                    truncated: flags & PACKET_DROP_FLAG_TRUNCATED != 0,
                    bandwidth,
                    queue_size,
                    truncated_length,
                    packet: buf,
                })
            }
        };
        Ok(Some(chunk))
    }
}

pub(crate) fn put_param(buf: &mut BytesMut, kind: u16, value: &[u8]) {
    let length = 4 + value.len();
    buf.put_u16(kind);
    buf.put_u16(length as u16);
    buf.put_slice(value);
    let padding = (4 - (length % 4)) % 4;
    buf.put_bytes(0, padding);
}

/// Splits a parameter list into (type, value) pairs.
pub(crate) fn params_iter(mut buf: Bytes) -> Result<Vec<(u16, Bytes)>> {
    let mut params = Vec::new();
    while buf.remaining() >= 4 {
        let kind = buf.get_u16();
        let length = buf.get_u16() as usize;
        if length < 4 || buf.remaining() < length - 4 {
            bail!("parameter {} has invalid length {}", kind, length);
        }
        let value = buf.split_to(length - 4);
        let padding = (4 - (length % 4)) % 4;
        buf.advance(padding.min(buf.remaining()));
        params.push((kind, value));
    }
    Ok(params)
}

pub(crate) fn put_address(buf: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => put_param(buf, PARAM_IPV4, &v4.octets()),
        IpAddr::V6(v6) => put_param(buf, PARAM_IPV6, &v6.octets()),
    }
}

pub(crate) fn decode_address(kind: u16, mut value: Bytes) -> Option<IpAddr> {
    match kind {
        PARAM_IPV4 if value.len() == 4 => Some(IpAddr::V4(Ipv4Addr::from(value.get_u32()))),
        PARAM_IPV6 if value.len() == 16 => Some(IpAddr::V6(Ipv6Addr::from(value.get_u128()))),
        _ => None,
    }
}

fn encode_init(init: &Init, body: &mut BytesMut) {
    body.put_u32(init.initiate_tag);
    body.put_u32(init.a_rwnd);
    body.put_u16(init.outbound_streams);
    body.put_u16(init.inbound_streams);
    body.put_u32(init.initial_tsn);
    for addr in &init.addresses {
        put_address(body, *addr);
    }
    if let Some(cookie) = &init.cookie {
        put_param(body, PARAM_STATE_COOKIE, cookie);
    }
    if !init.supported_extensions.is_empty() {
        put_param(body, PARAM_SUPPORTED_EXTENSIONS, &init.supported_extensions);
    }
    if init.forward_tsn_supported {
        put_param(body, PARAM_FORWARD_TSN_SUPPORTED, &[]);
    }
}

fn decode_init(mut buf: Bytes) -> Result<Init> {
    ensure!(buf.remaining() >= 16, "INIT chunk too short");
    let mut init = Init {
        initiate_tag: buf.get_u32(),
        a_rwnd: buf.get_u32(),
        outbound_streams: buf.get_u16(),
        inbound_streams: buf.get_u16(),
        initial_tsn: buf.get_u32(),
        addresses: Vec::new(),
        forward_tsn_supported: false,
        supported_extensions: Vec::new(),
        cookie: None,
    };
    for (kind, value) in params_iter(buf)? {
        match kind {
            PARAM_IPV4 | PARAM_IPV6 => {
                if let Some(addr) = decode_address(kind, value) {
                    init.addresses.push(addr);
                }
            }
            PARAM_STATE_COOKIE => init.cookie = Some(value),
            PARAM_SUPPORTED_EXTENSIONS => init.supported_extensions = value.to_vec(),
            PARAM_FORWARD_TSN_SUPPORTED => init.forward_tsn_supported = true,
            _ => tracing::trace!("Ignoring INIT parameter {:#06x}", kind),
        }
    }
    Ok(init)
}

fn decode_sack(nr: bool, flags: u8, mut buf: Bytes) -> Result<Sack> {
    ensure!(buf.remaining() >= 12, "SACK chunk too short");
    let cum_tsn_ack = buf.get_u32();
    let a_rwnd = buf.get_u32();
    let num_gaps = buf.get_u16() as usize;
    let (num_nr_gaps, num_dups) = if nr {
        ensure!(buf.remaining() >= 4, "NR-SACK chunk too short");
        let num_nr = buf.get_u16() as usize;
        let num_dups = buf.get_u16() as usize;
        buf.advance(2);
        (num_nr, num_dups)
    } else {
        (0, buf.get_u16() as usize)
    };
    ensure!(
        buf.remaining() >= (num_gaps + num_nr_gaps) * 4 + num_dups * 4,
        "SACK chunk truncated"
    );
    let gap_blocks = (0..num_gaps)
        .map(|_| GapBlock::new(buf.get_u16(), buf.get_u16()))
        .collect();
    let nr_gap_blocks = (0..num_nr_gaps)
        .map(|_| GapBlock::new(buf.get_u16(), buf.get_u16()))
        .collect();
    let duplicates = (0..num_dups).map(|_| buf.get_u32()).collect();
    Ok(Sack {
        cum_tsn_ack,
        a_rwnd,
        gap_blocks,
        nr_gap_blocks,
        duplicates,
        nr_subtract_r_gaps: nr && flags & NR_SACK_FLAG_SUBTRACT_R_GAPS != 0,
        sequence: None,
    })
}

fn decode_heartbeat_info(buf: Bytes) -> Result<Bytes> {
    params_iter(buf)?
        .into_iter()
        .find(|(kind, _)| *kind == PARAM_HEARTBEAT_INFO)
        .map(|(_, value)| value)
        .ok_or_else(|| anyhow::anyhow!("HEARTBEAT without info parameter"))
}

fn encode_causes(causes: &[ErrorCause], body: &mut BytesMut) {
    for cause in causes {
        put_param(body, cause.code, &cause.info);
    }
}

fn decode_causes(buf: Bytes) -> Result<Vec<ErrorCause>> {
    Ok(params_iter(buf)?
        .into_iter()
        .map(|(code, info)| ErrorCause { code, info })
        .collect())
}

fn decode_asconf(mut buf: Bytes) -> Result<Asconf> {
    ensure!(buf.remaining() >= 4, "ASCONF chunk too short");
    let serial = buf.get_u32();
    let mut asconf = Asconf {
        serial,
        address: None,
        params: Vec::new(),
    };
    for (kind, mut value) in params_iter(buf)? {
        match kind {
            PARAM_IPV4 | PARAM_IPV6 => asconf.address = decode_address(kind, value),
            PARAM_ADD_IP | PARAM_DELETE_IP | PARAM_SET_PRIMARY => {
                ensure!(value.remaining() >= 4, "ASCONF parameter too short");
                let correlation_id = value.get_u32();
                let Some((addr_kind, addr_value)) = params_iter(value)?.into_iter().next() else {
                    bail!("ASCONF parameter without address");
                };
                let Some(addr) = decode_address(addr_kind, addr_value) else {
                    bail!("ASCONF parameter with invalid address");
                };
                let request = match kind {
                    PARAM_ADD_IP => AsconfRequest::AddIp(addr),
                    PARAM_DELETE_IP => AsconfRequest::DeleteIp(addr),
                    _ => AsconfRequest::SetPrimary(addr),
                };
                asconf.params.push(AsconfParam {
                    correlation_id,
                    request,
                });
            }
            _ => tracing::trace!("Ignoring ASCONF parameter {:#06x}", kind),
        }
    }
    Ok(asconf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunk: &Chunk) -> Chunk {
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        assert_eq!(buf.len() % 4, 0, "chunks are padded to 4 bytes");
        let mut bytes = buf.freeze();
        let code = bytes.get_u8();
        let flags = bytes.get_u8();
        let length = bytes.get_u16() as usize;
        let body = bytes.split_to(length - CHUNK_HEADER_SIZE);
        Chunk::decode(code, flags, body)
            .expect("decode")
            .expect("known chunk type")
    }

    #[test]
    fn test_data_flags_and_payload() {
        let data = Chunk::Data(Data {
            tsn: 42,
            stream_id: 3,
            stream_seq: 7,
            ppid: 51,
            unordered: true,
            beginning: true,
            ending: false,
            immediate: true,
            payload: Bytes::from_static(b"hello"),
        });
        assert_eq!(round_trip(&data), data);
    }

    #[test]
    fn test_nr_sack_wire_layout() {
        let sack = Sack {
            cum_tsn_ack: 3,
            a_rwnd: 65536,
            gap_blocks: vec![GapBlock::new(2, 2)],
            nr_gap_blocks: vec![GapBlock::new(2, 2)],
            duplicates: vec![1],
            nr_subtract_r_gaps: false,
            sequence: Some(9),
        };
        let mut buf = BytesMut::new();
        Chunk::Sack(sack.clone()).encode(&mut buf);
        assert_eq!(buf[0], CT_NR_SACK);

        let decoded = round_trip(&Chunk::Sack(sack.clone()));
        let Chunk::Sack(decoded) = decoded else {
            panic!("expected SACK");
        };
        assert_eq!(decoded.sequence, None, "guard sequence never hits the wire");
        assert_eq!(decoded.gap_blocks, sack.gap_blocks);
        assert_eq!(decoded.nr_gap_blocks, sack.nr_gap_blocks);
        assert_eq!(decoded.duplicates, sack.duplicates);
    }

    #[test]
    fn test_init_ack_with_cookie_and_addresses() {
        let init = Chunk::InitAck(Init {
            initiate_tag: 0xdead_beef,
            a_rwnd: 1 << 20,
            outbound_streams: 10,
            inbound_streams: 12,
            initial_tsn: 1000,
            addresses: vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
            forward_tsn_supported: true,
            supported_extensions: vec![CT_RECONFIG, CT_FORWARD_TSN],
            cookie: Some(Bytes::from_static(b"cookie!")),
        });
        assert_eq!(round_trip(&init), init);
    }

    #[test]
    fn test_asconf_params() {
        let asconf = Chunk::Asconf(Asconf {
            serial: 5,
            address: Some("10.0.0.1".parse().unwrap()),
            params: vec![
                AsconfParam {
                    correlation_id: 1,
                    request: AsconfRequest::AddIp("10.0.0.2".parse().unwrap()),
                },
                AsconfParam {
                    correlation_id: 2,
                    request: AsconfRequest::SetPrimary("10.0.0.2".parse().unwrap()),
                },
            ],
        });
        assert_eq!(round_trip(&asconf), asconf);
    }

    #[test]
    fn test_unknown_chunk_type_is_skipped() {
        assert!(Chunk::decode(0x40, 0, Bytes::new()).unwrap().is_none());
    }

    #[test]
    fn test_verification_tag_exemptions() {
        assert!(ChunkType::Init.bypasses_verification_tag());
        assert!(ChunkType::Abort.bypasses_verification_tag());
        assert!(ChunkType::Error.bypasses_verification_tag());
        assert!(!ChunkType::Data.bypasses_verification_tag());
        assert!(!ChunkType::CookieEcho.bypasses_verification_tag());
    }

    #[test]
    fn test_packet_drop_lists_data_tsns() {
        let mut inner = BytesMut::new();
        inner.put_bytes(0, packet::COMMON_HEADER_LEN);
        Chunk::Data(Data {
            tsn: 77,
            stream_id: 0,
            stream_seq: 0,
            ppid: 0,
            unordered: false,
            beginning: true,
            ending: true,
            immediate: false,
            payload: Bytes::from_static(b"xyz"),
        })
        .encode(&mut inner);
        Chunk::CookieAck.encode(&mut inner);
        let drop = PacketDrop {
            from_middlebox: false,
            bad_checksum: false,
            truncated: false,
            bandwidth: 0,
            queue_size: 0,
            truncated_length: 0,
            packet: inner.freeze(),
        };
        assert_eq!(drop.dropped_data_tsns(), vec![77]);
    }
}
