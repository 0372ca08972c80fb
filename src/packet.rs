//! # Packet Codec
//!
//! Translates between raw bytes and [`Packet`] values. The header is
//! hand-framed little-endian:
//!
//! ```text
//! offset  size  field
//! 0       1     packet type
//! 1       1     resend counter
//! 2       2     flags
//! 4       4     packet id
//! next    4     relay id                (only if flags & RELAY)
//! next    2     packet size             (total bytes, header included)
//! next    1     update count U          (only if flags & UPDATE)
//! next    4·U   acknowledged packet ids
//! then          payload (possibly compressed)
//! ```
//!
//! A Data packet's payload is a sequence of message fragments, each framed by
//! a [`FragmentHeader`]; see [`encode_fragment_header`] / [`decode_fragment`].
//!
//! Compression is pluggable: when configured and the payload reaches the
//! threshold the codec invokes the hook on write and sets the COMPRESSED
//! flag. A hook returning `None` (or a larger buffer) leaves the packet
//! uncompressed, which is non-fatal. On read, a COMPRESSED packet that cannot
//! be decompressed is a frame error: the payload is unrecoverable.

use crate::error::Error;
use crate::message::{MessageFlags, MessageHeader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Hard upper bound for one on-wire packet, header included.
pub const PACKET_CAPACITY: usize = 4096;

/// Fixed part of the header: type, resend, flags, packet id.
pub const BASE_HEADER_SIZE: usize = 8;

/// Size of the packet-size field present in every header.
const SIZE_FIELD: usize = 2;

/// Smallest prefix from which a relay node can frame a packet:
/// base header + relay id + packet size.
pub const MIN_RELAY_READ_SIZE: usize = BASE_HEADER_SIZE + 4 + SIZE_FIELD;

/// Cap on piggybacked acknowledgments per packet.
pub const MAX_UPDATE_COUNT: usize = 16;

/// Largest relay frame a node may forward: it must fit one relay-flagged
/// packet even when a full update list rides along.
pub const RELAY_FRAME_MAX: usize =
    PACKET_CAPACITY - MIN_RELAY_READ_SIZE - (1 + 4 * MAX_UPDATE_COUNT);

/// One-byte packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Unknown = 0,
    KeepAlive = 1,
    Data = 2,
    Connect = 3,
    Accept = 4,
    Update = 5,
    Error = 6,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<PacketType> {
        match v {
            0 => Some(PacketType::Unknown),
            1 => Some(PacketType::KeepAlive),
            2 => Some(PacketType::Data),
            3 => Some(PacketType::Connect),
            4 => Some(PacketType::Accept),
            5 => Some(PacketType::Update),
            6 => Some(PacketType::Error),
            _ => None,
        }
    }
}

/// Two-byte packet flag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u16);

impl PacketFlags {
    pub const UPDATE: PacketFlags = PacketFlags(1);
    pub const COMPRESSED: PacketFlags = PacketFlags(2);
    pub const RELAY: PacketFlags = PacketFlags(4);
    pub const DEBUG: PacketFlags = PacketFlags(8);

    pub fn has(self, other: PacketFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn set(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn unset(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

/// Relay extension carried when the RELAY flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayInfo {
    pub relay_id: u32,
}

/// Decoded view of one on-wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub resend_count: u8,
    pub flags: PacketFlags,
    pub packet_id: u32,
    pub relay: Option<RelayInfo>,
    /// Piggybacked acknowledged packet ids, at most [`MAX_UPDATE_COUNT`].
    pub updates: Vec<u32>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, packet_id: u32) -> Self {
        Packet {
            packet_type,
            resend_count: 0,
            flags: PacketFlags::default(),
            packet_id,
            relay: None,
            updates: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn keepalive(packet_id: u32) -> Self {
        Packet::new(PacketType::KeepAlive, packet_id)
    }

    /// Update-only packet carrying nothing but acknowledgments.
    pub fn update_only(packet_id: u32, updates: Vec<u32>) -> Self {
        debug_assert!(updates.len() <= MAX_UPDATE_COUNT);
        let mut pkt = Packet::new(PacketType::Update, packet_id);
        if !updates.is_empty() {
            pkt.flags.set(PacketFlags::UPDATE);
            pkt.updates = updates;
        }
        pkt
    }

    pub fn set_relay(&mut self, relay_id: u32) {
        self.flags.set(PacketFlags::RELAY);
        self.relay = Some(RelayInfo { relay_id });
    }

    /// Header length for the current flag configuration.
    pub fn header_size(&self) -> usize {
        let mut sz = BASE_HEADER_SIZE;
        if self.flags.has(PacketFlags::RELAY) {
            sz += 4;
        }
        sz += SIZE_FIELD;
        if self.flags.has(PacketFlags::UPDATE) {
            sz += 1 + 4 * self.updates.len();
        }
        sz
    }

    /// Total on-wire length, header included.
    pub fn buffer_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// Payload room left under [`PACKET_CAPACITY`].
    pub fn payload_capacity(&self) -> usize {
        PACKET_CAPACITY - self.header_size()
    }
}

/// Pluggable compression pair. `compress` may decline by returning `None`.
#[derive(Clone)]
pub struct CompressionHooks {
    pub compress: Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>,
    pub decompress: Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>,
    /// Payloads shorter than this are written uncompressed.
    pub threshold: usize,
}

/// Outcome of a framing attempt over a byte buffer.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A whole packet was framed; `consumed` bytes were taken from the input.
    Packet { packet: Packet, consumed: usize },
    /// Not enough bytes yet; at least `need` total bytes are required.
    NeedMore { need: usize },
    /// The stream is corrupt and cannot be resynchronized.
    Malformed(&'static str),
}

/// Stateless packet encoder/decoder with optional compression hooks.
#[derive(Clone, Default)]
pub struct PacketCodec {
    compression: Option<CompressionHooks>,
}

impl PacketCodec {
    pub fn new(compression: Option<CompressionHooks>) -> Self {
        PacketCodec { compression }
    }

    /// Serialize `packet` onto the end of `out`.
    ///
    /// Applies compression when configured and worthwhile. Returns the number
    /// of bytes written.
    pub fn write_packet(&self, packet: &Packet, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut payload: &[u8] = &packet.payload;
        let mut compressed_buf;
        let mut flags = packet.flags;

        if let Some(hooks) = &self.compression {
            if payload.len() >= hooks.threshold {
                if let Some(smaller) = (hooks.compress)(payload) {
                    if smaller.len() < payload.len() {
                        compressed_buf = smaller;
                        payload = {
                            compressed_buf.shrink_to_fit();
                            &compressed_buf
                        };
                        flags.set(PacketFlags::COMPRESSED);
                    }
                }
            }
        }

        let mut header_size = BASE_HEADER_SIZE + SIZE_FIELD;
        if flags.has(PacketFlags::RELAY) {
            header_size += 4;
        }
        if flags.has(PacketFlags::UPDATE) {
            header_size += 1 + 4 * packet.updates.len();
        }
        let total = header_size + payload.len();
        if total > PACKET_CAPACITY {
            return Err(Error::FrameError("packet exceeds capacity"));
        }

        let start = out.len();
        out.push(packet.packet_type as u8);
        out.push(packet.resend_count);
        out.extend_from_slice(&flags.0.to_le_bytes());
        out.extend_from_slice(&packet.packet_id.to_le_bytes());
        if flags.has(PacketFlags::RELAY) {
            let relay = packet
                .relay
                .as_ref()
                .ok_or(Error::FrameError("relay flag without relay id"))?;
            out.extend_from_slice(&relay.relay_id.to_le_bytes());
        }
        out.extend_from_slice(&(total as u16).to_le_bytes());
        if flags.has(PacketFlags::UPDATE) {
            out.push(packet.updates.len() as u8);
            for id in &packet.updates {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        out.extend_from_slice(payload);
        debug_assert_eq!(out.len() - start, total);
        Ok(total)
    }

    /// Try to frame one packet from the front of `buf`.
    pub fn read_packet(&self, buf: &[u8]) -> ReadOutcome {
        if buf.len() < BASE_HEADER_SIZE + SIZE_FIELD {
            return ReadOutcome::NeedMore {
                need: BASE_HEADER_SIZE + SIZE_FIELD,
            };
        }

        let type_byte = buf[0];
        let packet_type = match PacketType::from_u8(type_byte) {
            Some(PacketType::Unknown) | None => {
                return ReadOutcome::Malformed("unknown packet type");
            }
            Some(t) => t,
        };
        let resend_count = buf[1];
        let flags = PacketFlags(u16::from_le_bytes([buf[2], buf[3]]));
        let packet_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let mut at = BASE_HEADER_SIZE;
        let relay = if flags.has(PacketFlags::RELAY) {
            if buf.len() < MIN_RELAY_READ_SIZE {
                return ReadOutcome::NeedMore {
                    need: MIN_RELAY_READ_SIZE,
                };
            }
            let relay_id = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            at += 4;
            Some(RelayInfo { relay_id })
        } else {
            None
        };

        let total = u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
        at += SIZE_FIELD;

        if total > PACKET_CAPACITY {
            return ReadOutcome::Malformed("declared size exceeds capacity");
        }
        if total < at {
            return ReadOutcome::Malformed("declared size smaller than header");
        }
        if buf.len() < total {
            return ReadOutcome::NeedMore { need: total };
        }

        let mut updates = Vec::new();
        if flags.has(PacketFlags::UPDATE) {
            if at >= total {
                return ReadOutcome::Malformed("truncated update list");
            }
            let count = buf[at] as usize;
            at += 1;
            if count > MAX_UPDATE_COUNT || at + 4 * count > total {
                return ReadOutcome::Malformed("truncated update list");
            }
            updates.reserve(count);
            for i in 0..count {
                let off = at + 4 * i;
                updates.push(u32::from_le_bytes([
                    buf[off],
                    buf[off + 1],
                    buf[off + 2],
                    buf[off + 3],
                ]));
            }
            at += 4 * count;
        }

        let mut payload = buf[at..total].to_vec();
        if flags.has(PacketFlags::COMPRESSED) {
            let hooks = match &self.compression {
                Some(h) => h,
                None => return ReadOutcome::Malformed("compressed packet without decompressor"),
            };
            payload = match (hooks.decompress)(&payload) {
                Some(p) => p,
                None => return ReadOutcome::Malformed("payload decompression failed"),
            };
        }

        let mut flags = flags;
        flags.unset(PacketFlags::COMPRESSED);

        ReadOutcome::Packet {
            packet: Packet {
                packet_type,
                resend_count,
                flags,
                packet_id,
                relay,
                updates,
                payload,
            },
            consumed: total,
        }
    }
}

// ---------------------------------------------------------------------------
// Fragment framing
// ---------------------------------------------------------------------------

/// First byte of every fragment inside a Data packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FragmentKind {
    /// Continues a message already announced on this connection.
    Continued = 1,
    /// Starts a new message; a [`MessageHeader`] follows.
    New = 2,
    /// Starts a response whose request id is already known on the receiving
    /// side; a [`MessageHeader`] follows, and completion routes to the
    /// waiting request instead of the receive hook.
    Old = 3,
}

impl FragmentKind {
    fn from_u8(v: u8) -> Option<FragmentKind> {
        match v {
            1 => Some(FragmentKind::Continued),
            2 => Some(FragmentKind::New),
            3 => Some(FragmentKind::Old),
            _ => None,
        }
    }
}

/// Per-fragment flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentFlags(pub u8);

impl FragmentFlags {
    /// This fragment completes its message.
    pub const LAST: FragmentFlags = FragmentFlags(1);
    /// Cancel terminator: the sender abandoned the message; discard the
    /// partial reassembly.
    pub const CANCEL: FragmentFlags = FragmentFlags(2);

    pub fn has(self, other: FragmentFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn set(&mut self, other: FragmentFlags) {
        self.0 |= other.0;
    }
}

/// Decoded fragment header. `message` is present for [`FragmentKind::New`]
/// and [`FragmentKind::Old`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub kind: FragmentKind,
    pub flags: FragmentFlags,
    pub request_id: u64,
    pub message: Option<MessageHeader>,
}

impl FragmentHeader {
    /// Encoded length of this header, data-length field included.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 1 + 8; // kind + flags + request id
        if let Some(msg) = &self.message {
            len += varint_len(msg.type_id as u64) + 2;
            if let Some(name) = &msg.relay_name {
                len += 1 + name.len();
            }
        }
        len + 2 // data length
    }
}

/// Append `header` plus the data-length field to `out`.
pub fn encode_fragment_header(header: &FragmentHeader, data_len: u16, out: &mut Vec<u8>) {
    out.push(header.kind as u8);
    out.push(header.flags.0);
    out.extend_from_slice(&header.request_id.to_le_bytes());
    if let Some(msg) = &header.message {
        debug_assert_ne!(header.kind, FragmentKind::Continued);
        put_varint(msg.type_id as u64, out);
        out.extend_from_slice(&msg.flags.wire_bits().to_le_bytes());
        if msg.flags.has(MessageFlags::RELAYED) {
            let name = msg.relay_name.as_deref().unwrap_or("");
            debug_assert!(name.len() <= u8::MAX as usize);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
    }
    out.extend_from_slice(&data_len.to_le_bytes());
}

/// Decode one fragment from the front of `buf`.
///
/// Returns the header, the fragment data, and the number of bytes consumed.
/// Truncation anywhere is a frame error: fragments never span packets.
pub fn decode_fragment(buf: &[u8]) -> Result<(FragmentHeader, &[u8], usize), Error> {
    if buf.len() < 1 + 1 + 8 {
        return Err(Error::FrameError("truncated fragment header"));
    }
    let kind =
        FragmentKind::from_u8(buf[0]).ok_or(Error::FrameError("invalid fragment kind"))?;
    let flags = FragmentFlags(buf[1]);
    let request_id = u64::from_le_bytes([
        buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
    ]);
    let mut at = 10;

    let message = if kind != FragmentKind::Continued {
        let (type_id, n) =
            get_varint(&buf[at..]).ok_or(Error::FrameError("truncated fragment header"))?;
        if type_id > u16::MAX as u64 {
            return Err(Error::FrameError("message type id out of range"));
        }
        at += n;
        if buf.len() < at + 2 {
            return Err(Error::FrameError("truncated fragment header"));
        }
        let wire_flags = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let flags = MessageFlags::from_wire_bits(wire_flags);
        let relay_name = if flags.has(MessageFlags::RELAYED) {
            if buf.len() < at + 1 {
                return Err(Error::FrameError("truncated relay name"));
            }
            let name_len = buf[at] as usize;
            at += 1;
            if buf.len() < at + name_len {
                return Err(Error::FrameError("truncated relay name"));
            }
            let name = std::str::from_utf8(&buf[at..at + name_len])
                .map_err(|_| Error::FrameError("relay name is not utf-8"))?
                .to_owned();
            at += name_len;
            // An already-relayed message keeps the flag but carries no
            // remaining path.
            (!name.is_empty()).then_some(name)
        } else {
            None
        };
        let mut header = MessageHeader::new(type_id as u16, request_id, flags);
        header.relay_name = relay_name;
        Some(header)
    } else {
        None
    };

    if buf.len() < at + 2 {
        return Err(Error::FrameError("truncated fragment header"));
    }
    let data_len = u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
    at += 2;
    if buf.len() < at + data_len {
        return Err(Error::FrameError("truncated fragment data"));
    }
    let data = &buf[at..at + data_len];
    Ok((
        FragmentHeader {
            kind,
            flags,
            request_id,
            message,
        },
        data,
        at + data_len,
    ))
}

// ---------------------------------------------------------------------------
// Handshake records
// ---------------------------------------------------------------------------

/// Payload of a Connect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectData {
    pub version_major: u16,
    pub version_minor: u16,
    pub sender_network_id: u32,
    pub receiver_network_id: u32,
    pub timestamp_secs: u64,
    pub timestamp_nanos: u32,
    /// Relay id the sender allocated for this session, zero when unused.
    pub relay_id: u32,
}

/// Payload of an Accept packet: the accepted relay id plus the echoed
/// Connect timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptData {
    pub relay_id: u32,
    pub timestamp_secs: u64,
    pub timestamp_nanos: u32,
}

// ---------------------------------------------------------------------------
// Varint helpers (LEB128)
// ---------------------------------------------------------------------------

pub(crate) fn put_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        v |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}

pub(crate) fn varint_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros().max(0) as usize;
    std::cmp::max(1, bits.div_ceil(7))
}
