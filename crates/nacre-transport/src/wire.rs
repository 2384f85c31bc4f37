//! # Nacre Wire Format
//!
//! Codec for the six wire message kinds exchanged by a nacre session.
//! Every message is one UDP datagram and starts with the 12-byte common
//! header; `hdr_len` points past any extensions so unknown extensions can
//! be skipped.
//!
//! ## Common Header (12 bytes, big-endian)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1v1XT|hdr_len|          Sequence (16)        |               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+   Source Id   |
//! |             Source Id (32)            |     Instance Id (16)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  GRTT (8)     |Backoff|GrpSize|        ... type body ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `hdr_len` is expressed in 32-bit words and covers the common header,
//! the type-specific fixed fields, and any extensions (the FEC object
//! transmission information). Variable-length content — segment payloads,
//! repair-request lists, acking-node lists — follows the header region.
//!
//! GRTT, backoff factor and group size travel quantized in every message
//! so late-joining receivers pick up the sender's timing state from any
//! datagram. The quantization tables live at the bottom of this module.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Common header size in bytes.
pub const COMMON_HEADER_LEN: usize = 12;

/// Node id reserved for "no node".
pub const NODE_NONE: u32 = 0;

/// Node id reserved for "any node".
pub const NODE_ANY: u32 = 0xFFFF_FFFF;

/// Largest block id representable in the FEC payload id (23 bits).
pub const MAX_BLOCK_ID: u32 = (1 << 23) - 1;

// ─── Message Type ────────────────────────────────────────────────────────────

/// Wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Info = 1,
    Data = 2,
    Cmd = 3,
    Nack = 4,
    Ack = 5,
    Report = 6,
}

impl MessageType {
    pub fn from_nibble(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageType::Info),
            2 => Some(MessageType::Data),
            3 => Some(MessageType::Cmd),
            4 => Some(MessageType::Nack),
            5 => Some(MessageType::Ack),
            6 => Some(MessageType::Report),
            _ => None,
        }
    }
}

// ─── Common Header ───────────────────────────────────────────────────────────

/// Decoded common header — present on every nacre datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    /// Per-sender datagram sequence number (loss-event detection).
    pub sequence: u16,
    /// Originating node id.
    pub source_id: u32,
    /// Sender instance id; a change means the sender restarted.
    pub instance_id: u16,
    /// Quantized GRTT estimate (see [`quantize_grtt`]).
    pub grtt: u8,
    /// Quantized backoff factor (4 bits).
    pub backoff: u8,
    /// Quantized group size estimate (4 bits).
    pub gsize: u8,
}

impl MsgHeader {
    fn encode(&self, msg_type: MessageType, hdr_words: u8, buf: &mut BytesMut) {
        buf.put_u8((PROTOCOL_VERSION << 4) | (msg_type as u8));
        buf.put_u8(hdr_words);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id);
        buf.put_u16(self.instance_id);
        buf.put_u8(self.grtt);
        buf.put_u8(((self.backoff & 0x0F) << 4) | (self.gsize & 0x0F));
    }

    /// Decode the common header, returning the message type and `hdr_len`
    /// in bytes alongside. `None` on truncation or version mismatch.
    fn decode(buf: &mut impl Buf) -> Option<(Self, MessageType, usize)> {
        if buf.remaining() < COMMON_HEADER_LEN {
            return None;
        }
        let b0 = buf.get_u8();
        if (b0 >> 4) != PROTOCOL_VERSION {
            return None;
        }
        let msg_type = MessageType::from_nibble(b0 & 0x0F)?;
        let hdr_words = buf.get_u8() as usize;
        let hdr_bytes = hdr_words * 4;
        if hdr_bytes < COMMON_HEADER_LEN {
            return None;
        }
        let sequence = buf.get_u16();
        let source_id = buf.get_u32();
        let instance_id = buf.get_u16();
        let grtt = buf.get_u8();
        let packed = buf.get_u8();
        Some((
            MsgHeader {
                sequence,
                source_id,
                instance_id,
                grtt,
                backoff: packed >> 4,
                gsize: packed & 0x0F,
            },
            msg_type,
            hdr_bytes,
        ))
    }
}

// ─── FEC Payload Id ──────────────────────────────────────────────────────────

/// Addresses one segment within an object's block space.
///
/// Packed into 32 bits on the wire: parity flag (1) | block id (23) |
/// segment index (8). The 8-bit segment index bounds `k + n` at 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FecPayloadId {
    pub block_id: u32,
    pub segment_id: u8,
    pub parity: bool,
}

impl FecPayloadId {
    pub fn source(block_id: u32, segment_id: u8) -> Self {
        FecPayloadId {
            block_id,
            segment_id,
            parity: false,
        }
    }

    pub fn parity(block_id: u32, segment_id: u8) -> Self {
        FecPayloadId {
            block_id,
            segment_id,
            parity: true,
        }
    }

    pub fn pack(self) -> u32 {
        ((self.parity as u32) << 31) | ((self.block_id & MAX_BLOCK_ID) << 8) | self.segment_id as u32
    }

    pub fn unpack(raw: u32) -> Self {
        FecPayloadId {
            block_id: (raw >> 8) & MAX_BLOCK_ID,
            segment_id: (raw & 0xFF) as u8,
            parity: (raw >> 31) != 0,
        }
    }
}

// ─── FEC Object Transmission Information ────────────────────────────────────

/// FTI extension: everything a receiver needs to lay out an object's block
/// space from a single datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtiExt {
    /// Total object size in bytes. Streams use [`FtiExt::STREAM_SIZE`].
    pub object_size: u64,
    /// Segment payload size in bytes.
    pub segment_size: u16,
    /// Source segments per block (k).
    pub block_len: u8,
    /// Parity segments computed per block (n).
    pub parity_len: u8,
}

impl FtiExt {
    /// Sentinel object size for open-ended streams.
    pub const STREAM_SIZE: u64 = u64::MAX;

    pub const ENCODED_LEN: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.object_size);
        buf.put_u16(self.segment_size);
        buf.put_u8(self.block_len);
        buf.put_u8(self.parity_len);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(FtiExt {
            object_size: buf.get_u64(),
            segment_size: buf.get_u16(),
            block_len: buf.get_u8(),
            parity_len: buf.get_u8(),
        })
    }
}

// ─── Data / Info Flags ───────────────────────────────────────────────────────

/// Flag bits shared by DATA and INFO messages.
pub mod flags {
    /// Segment is a retransmission.
    pub const REPAIR: u8 = 0x01;
    /// The object carries an INFO payload.
    pub const INFO_PRESENT: u8 = 0x02;
    /// FTI extension present in this header.
    pub const FTI: u8 = 0x04;
    /// Stream segment whose payload ends an application message.
    pub const EOM: u8 = 0x08;
    /// First segment of a stream object (join point for stream sync).
    pub const STREAM_START: u8 = 0x10;
    /// The object is a stream.
    pub const STREAM: u8 = 0x20;
    /// The object is a file.
    pub const FILE: u8 = 0x40;
    /// Stream segment whose payload begins an application message
    /// (resync anchor for `stream_seek_msg_start`).
    pub const MSG_START: u8 = 0x80;
}

// ─── DATA ────────────────────────────────────────────────────────────────────

/// DATA message: one source or parity segment of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub object_id: u16,
    pub flags: u8,
    pub fec_id: FecPayloadId,
    pub fti: Option<FtiExt>,
    pub payload: Bytes,
}

impl DataMsg {
    // object_id(2) + flags(1) + pad(1) + fec_id(4)
    const FIXED_LEN: usize = 8;

    fn hdr_words(&self) -> u8 {
        let mut len = COMMON_HEADER_LEN + Self::FIXED_LEN;
        if self.fti.is_some() {
            len += FtiExt::ENCODED_LEN;
        }
        (len / 4) as u8
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = self.flags;
        if self.fti.is_some() {
            flags |= flags::FTI;
        } else {
            flags &= !flags::FTI;
        }
        buf.put_u16(self.object_id);
        buf.put_u8(flags);
        buf.put_u8(0);
        buf.put_u32(self.fec_id.pack());
        if let Some(fti) = &self.fti {
            fti.encode(buf);
        }
        buf.extend_from_slice(&self.payload);
    }

    fn decode(buf: &mut Bytes, hdr_remaining: usize) -> Option<Self> {
        if buf.remaining() < Self::FIXED_LEN || hdr_remaining < Self::FIXED_LEN {
            return None;
        }
        let object_id = buf.get_u16();
        let flags = buf.get_u8();
        let _pad = buf.get_u8();
        let fec_id = FecPayloadId::unpack(buf.get_u32());
        let mut consumed = Self::FIXED_LEN;
        let fti = if flags & flags::FTI != 0 {
            let fti = FtiExt::decode(buf)?;
            consumed += FtiExt::ENCODED_LEN;
            Some(fti)
        } else {
            None
        };
        // Skip extensions this implementation does not know about.
        let skip = hdr_remaining.checked_sub(consumed)?;
        if buf.remaining() < skip {
            return None;
        }
        buf.advance(skip);
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(DataMsg {
            object_id,
            flags,
            fec_id,
            fti,
            payload,
        })
    }
}

// ─── INFO ────────────────────────────────────────────────────────────────────

/// INFO message: the out-of-band metadata payload for an object (≤ one
/// segment). Wire layout matches DATA with a zero FEC payload id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoMsg {
    pub object_id: u16,
    pub flags: u8,
    pub fti: Option<FtiExt>,
    pub payload: Bytes,
}

impl InfoMsg {
    fn to_data(&self) -> DataMsg {
        DataMsg {
            object_id: self.object_id,
            flags: self.flags | flags::INFO_PRESENT,
            fec_id: FecPayloadId::source(0, 0),
            fti: self.fti,
            payload: self.payload.clone(),
        }
    }

    fn from_data(d: DataMsg) -> Self {
        InfoMsg {
            object_id: d.object_id,
            flags: d.flags,
            fti: d.fti,
            payload: d.payload,
        }
    }
}

// ─── Repair Requests ─────────────────────────────────────────────────────────

/// One entry in a NACK (or REPAIR_ADV) repair-request list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairRequest {
    /// Everything of the object: INFO plus all blocks.
    Object { object_id: u16 },
    /// Only the object's INFO segment.
    Info { object_id: u16 },
    /// A contiguous run of whole blocks.
    Blocks { object_id: u16, start: u32, count: u32 },
    /// A contiguous run of segments within one block.
    Segments {
        object_id: u16,
        block_id: u32,
        start: u8,
        count: u16,
    },
}

mod request_form {
    pub const OBJECT: u8 = 1;
    pub const INFO: u8 = 2;
    pub const BLOCKS: u8 = 3;
    pub const SEGMENTS: u8 = 4;
}

impl RepairRequest {
    pub fn object_id(&self) -> u16 {
        match *self {
            RepairRequest::Object { object_id }
            | RepairRequest::Info { object_id }
            | RepairRequest::Blocks { object_id, .. }
            | RepairRequest::Segments { object_id, .. } => object_id,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            RepairRequest::Object { object_id } => {
                buf.put_u8(request_form::OBJECT);
                buf.put_u8(0);
                buf.put_u16(object_id);
            }
            RepairRequest::Info { object_id } => {
                buf.put_u8(request_form::INFO);
                buf.put_u8(0);
                buf.put_u16(object_id);
            }
            RepairRequest::Blocks {
                object_id,
                start,
                count,
            } => {
                buf.put_u8(request_form::BLOCKS);
                buf.put_u8(0);
                buf.put_u16(object_id);
                buf.put_u32(start);
                buf.put_u32(count);
            }
            RepairRequest::Segments {
                object_id,
                block_id,
                start,
                count,
            } => {
                buf.put_u8(request_form::SEGMENTS);
                buf.put_u8(0);
                buf.put_u16(object_id);
                buf.put_u32(block_id);
                buf.put_u8(start);
                buf.put_u8(0);
                buf.put_u16(count);
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let form = buf.get_u8();
        let _pad = buf.get_u8();
        let object_id = buf.get_u16();
        match form {
            request_form::OBJECT => Some(RepairRequest::Object { object_id }),
            request_form::INFO => Some(RepairRequest::Info { object_id }),
            request_form::BLOCKS => {
                if buf.remaining() < 8 {
                    return None;
                }
                Some(RepairRequest::Blocks {
                    object_id,
                    start: buf.get_u32(),
                    count: buf.get_u32(),
                })
            }
            request_form::SEGMENTS => {
                if buf.remaining() < 8 {
                    return None;
                }
                let block_id = buf.get_u32();
                let start = buf.get_u8();
                let _pad = buf.get_u8();
                let count = buf.get_u16();
                Some(RepairRequest::Segments {
                    object_id,
                    block_id,
                    start,
                    count,
                })
            }
            _ => None,
        }
    }
}

/// Decode a repair-request list until the buffer is exhausted.
fn decode_request_list(buf: &mut impl Buf) -> Option<Vec<RepairRequest>> {
    let mut requests = Vec::new();
    while buf.has_remaining() {
        requests.push(RepairRequest::decode(buf)?);
        if requests.len() > 1024 {
            return None; // sanity limit
        }
    }
    Some(requests)
}

/// Coalesce sorted, deduplicated segment indices into `Segments` runs.
pub fn coalesce_segments(object_id: u16, block_id: u32, indices: &[u8]) -> Vec<RepairRequest> {
    let mut runs = Vec::new();
    let mut iter = indices.iter().copied();
    let Some(first) = iter.next() else {
        return runs;
    };
    let mut start = first;
    let mut count: u16 = 1;
    for idx in iter {
        if idx as u16 == start as u16 + count {
            count += 1;
        } else {
            runs.push(RepairRequest::Segments {
                object_id,
                block_id,
                start,
                count,
            });
            start = idx;
            count = 1;
        }
    }
    runs.push(RepairRequest::Segments {
        object_id,
        block_id,
        start,
        count,
    });
    runs
}

// ─── NACK ────────────────────────────────────────────────────────────────────

/// NACK message: a receiver's repair request, addressed at one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackMsg {
    /// Node id of the sender whose content is being NACKed.
    pub sender_id: u32,
    pub requests: Vec<RepairRequest>,
}

impl NackMsg {
    const FIXED_LEN: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_id);
        for req in &self.requests {
            req.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes, hdr_remaining: usize) -> Option<Self> {
        if buf.remaining() < Self::FIXED_LEN || hdr_remaining < Self::FIXED_LEN {
            return None;
        }
        let sender_id = buf.get_u32();
        let skip = hdr_remaining.checked_sub(Self::FIXED_LEN)?;
        if buf.remaining() < skip {
            return None;
        }
        buf.advance(skip);
        let requests = decode_request_list(buf)?;
        Some(NackMsg {
            sender_id,
            requests,
        })
    }
}

// ─── ACK ─────────────────────────────────────────────────────────────────────

/// What an ACK acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckType {
    /// Watermark / flush point reached.
    Watermark = 1,
    /// Application-defined acknowledgment (payload carried through).
    App = 2,
}

impl AckType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(AckType::Watermark),
            2 => Some(AckType::App),
            _ => None,
        }
    }
}

/// ACK message: positive acknowledgment of a watermark point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
    /// Node id of the sender being acknowledged.
    pub sender_id: u32,
    pub ack_type: AckType,
    /// Echoed watermark point.
    pub object_id: u16,
    pub fec_id: FecPayloadId,
    /// Optional application payload (≤ one segment).
    pub payload: Bytes,
}

impl AckMsg {
    // sender_id(4) + type(1) + pad(1) + object_id(2) + fec_id(4)
    const FIXED_LEN: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_id);
        buf.put_u8(self.ack_type as u8);
        buf.put_u8(0);
        buf.put_u16(self.object_id);
        buf.put_u32(self.fec_id.pack());
        buf.extend_from_slice(&self.payload);
    }

    fn decode(buf: &mut Bytes, hdr_remaining: usize) -> Option<Self> {
        if buf.remaining() < Self::FIXED_LEN || hdr_remaining < Self::FIXED_LEN {
            return None;
        }
        let sender_id = buf.get_u32();
        let ack_type = AckType::from_byte(buf.get_u8())?;
        let _pad = buf.get_u8();
        let object_id = buf.get_u16();
        let fec_id = FecPayloadId::unpack(buf.get_u32());
        let skip = hdr_remaining.checked_sub(Self::FIXED_LEN)?;
        if buf.remaining() < skip {
            return None;
        }
        buf.advance(skip);
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(AckMsg {
            sender_id,
            ack_type,
            object_id,
            fec_id,
            payload,
        })
    }
}

// ─── CMD ─────────────────────────────────────────────────────────────────────

mod cmd_subtype {
    pub const FLUSH: u8 = 1;
    pub const ACK_REQ: u8 = 2;
    pub const CC_PROBE: u8 = 3;
    pub const CC_REPORT: u8 = 4;
    pub const SQUELCH: u8 = 5;
    pub const REPAIR_ADV: u8 = 6;
}

/// CMD(FLUSH): sender reached the given transmit point and is going idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushCmd {
    pub object_id: u16,
    pub fec_id: FecPayloadId,
    /// End of transmission — the sender will enqueue nothing further.
    pub eot: bool,
}

/// CMD(ACK_REQ): demand positive ACK of a watermark point from the listed
/// acking nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReqCmd {
    pub object_id: u16,
    pub fec_id: FecPayloadId,
    pub acking_nodes: Vec<u32>,
}

/// CMD(CC_PROBE): GRTT/congestion probe carrying the sender's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcProbeCmd {
    pub cc_sequence: u16,
    /// Sender clock at transmit, microseconds.
    pub send_time_us: u64,
}

/// CMD(CC_REPORT): receiver's reply to a CC probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcReportCmd {
    pub cc_sequence: u16,
    /// Loss event rate, fixed-point `p × 65535`.
    pub loss_quantized: u16,
    /// Echoed probe timestamp.
    pub send_time_us: u64,
    /// Processing delay between probe receipt and this reply, microseconds.
    pub delay_us: u32,
    /// Receive rate observed from this sender, bytes/second.
    pub recv_rate: u64,
}

impl CcReportCmd {
    /// Loss event rate as a float in [0, 1].
    pub fn loss_rate(&self) -> f64 {
        self.loss_quantized as f64 / 65535.0
    }

    pub fn quantize_loss(p: f64) -> u16 {
        (p.clamp(0.0, 1.0) * 65535.0).round() as u16
    }
}

/// CMD(SQUELCH): repair for anything older than `oldest_object_id` is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquelchCmd {
    pub oldest_object_id: u16,
}

/// CMD(REPAIR_ADV): sender advertises its aggregated repair state so
/// unicast-NACKing receivers can suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairAdvCmd {
    pub requests: Vec<RepairRequest>,
}

/// A decoded CMD with its typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdBody {
    Flush(FlushCmd),
    AckReq(AckReqCmd),
    CcProbe(CcProbeCmd),
    CcReport(CcReportCmd),
    Squelch(SquelchCmd),
    RepairAdv(RepairAdvCmd),
}

impl CmdBody {
    // subtype(1) + flags(1) + reserved(2)
    const FIXED_LEN: usize = 4;

    const FLAG_EOT: u8 = 0x01;

    fn fixed_len(&self) -> usize {
        Self::FIXED_LEN
            + match self {
                CmdBody::Flush(_) => 8,
                CmdBody::AckReq(_) => 8,
                CmdBody::CcProbe(_) => 12,
                CmdBody::CcReport(_) => 24,
                CmdBody::Squelch(_) => 4,
                CmdBody::RepairAdv(_) => 0,
            }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            CmdBody::Flush(c) => {
                buf.put_u8(cmd_subtype::FLUSH);
                buf.put_u8(if c.eot { Self::FLAG_EOT } else { 0 });
                buf.put_u16(0);
                buf.put_u16(c.object_id);
                buf.put_u16(0);
                buf.put_u32(c.fec_id.pack());
            }
            CmdBody::AckReq(c) => {
                buf.put_u8(cmd_subtype::ACK_REQ);
                buf.put_u8(0);
                buf.put_u16(0);
                buf.put_u16(c.object_id);
                buf.put_u16(c.acking_nodes.len() as u16);
                buf.put_u32(c.fec_id.pack());
                for &node in &c.acking_nodes {
                    buf.put_u32(node);
                }
            }
            CmdBody::CcProbe(c) => {
                buf.put_u8(cmd_subtype::CC_PROBE);
                buf.put_u8(0);
                buf.put_u16(0);
                buf.put_u16(c.cc_sequence);
                buf.put_u16(0);
                buf.put_u64(c.send_time_us);
            }
            CmdBody::CcReport(c) => {
                buf.put_u8(cmd_subtype::CC_REPORT);
                buf.put_u8(0);
                buf.put_u16(0);
                buf.put_u16(c.cc_sequence);
                buf.put_u16(c.loss_quantized);
                buf.put_u64(c.send_time_us);
                buf.put_u32(c.delay_us);
                buf.put_u64(c.recv_rate);
            }
            CmdBody::Squelch(c) => {
                buf.put_u8(cmd_subtype::SQUELCH);
                buf.put_u8(0);
                buf.put_u16(0);
                buf.put_u16(c.oldest_object_id);
                buf.put_u16(0);
            }
            CmdBody::RepairAdv(c) => {
                buf.put_u8(cmd_subtype::REPAIR_ADV);
                buf.put_u8(0);
                buf.put_u16(0);
                for req in &c.requests {
                    req.encode(buf);
                }
            }
        }
    }

    fn decode(buf: &mut Bytes, hdr_remaining: usize) -> Option<Self> {
        if buf.remaining() < Self::FIXED_LEN || hdr_remaining < Self::FIXED_LEN {
            return None;
        }
        let subtype = buf.get_u8();
        let cmd_flags = buf.get_u8();
        let _reserved = buf.get_u16();
        let mut consumed = Self::FIXED_LEN;
        let body = match subtype {
            cmd_subtype::FLUSH => {
                if buf.remaining() < 8 {
                    return None;
                }
                let object_id = buf.get_u16();
                let _pad = buf.get_u16();
                let fec_id = FecPayloadId::unpack(buf.get_u32());
                consumed += 8;
                CmdBody::Flush(FlushCmd {
                    object_id,
                    fec_id,
                    eot: cmd_flags & Self::FLAG_EOT != 0,
                })
            }
            cmd_subtype::ACK_REQ => {
                if buf.remaining() < 8 {
                    return None;
                }
                let object_id = buf.get_u16();
                let node_count = buf.get_u16() as usize;
                let fec_id = FecPayloadId::unpack(buf.get_u32());
                consumed += 8;
                if node_count > 256 {
                    return None; // sanity limit
                }
                // The node list sits past the header region.
                let skip = hdr_remaining.checked_sub(consumed)?;
                if buf.remaining() < skip + node_count * 4 {
                    return None;
                }
                buf.advance(skip);
                let mut acking_nodes = Vec::with_capacity(node_count);
                for _ in 0..node_count {
                    acking_nodes.push(buf.get_u32());
                }
                return Some(CmdBody::AckReq(AckReqCmd {
                    object_id,
                    fec_id,
                    acking_nodes,
                }));
            }
            cmd_subtype::CC_PROBE => {
                if buf.remaining() < 12 {
                    return None;
                }
                let cc_sequence = buf.get_u16();
                let _pad = buf.get_u16();
                let send_time_us = buf.get_u64();
                consumed += 12;
                CmdBody::CcProbe(CcProbeCmd {
                    cc_sequence,
                    send_time_us,
                })
            }
            cmd_subtype::CC_REPORT => {
                if buf.remaining() < 24 {
                    return None;
                }
                let cc_sequence = buf.get_u16();
                let loss_quantized = buf.get_u16();
                let send_time_us = buf.get_u64();
                let delay_us = buf.get_u32();
                let recv_rate = buf.get_u64();
                consumed += 24;
                CmdBody::CcReport(CcReportCmd {
                    cc_sequence,
                    loss_quantized,
                    send_time_us,
                    delay_us,
                    recv_rate,
                })
            }
            cmd_subtype::SQUELCH => {
                if buf.remaining() < 4 {
                    return None;
                }
                let oldest_object_id = buf.get_u16();
                let _pad = buf.get_u16();
                consumed += 4;
                CmdBody::Squelch(SquelchCmd { oldest_object_id })
            }
            cmd_subtype::REPAIR_ADV => {
                let skip = hdr_remaining.checked_sub(consumed)?;
                if buf.remaining() < skip {
                    return None;
                }
                buf.advance(skip);
                let requests = decode_request_list(buf)?;
                return Some(CmdBody::RepairAdv(RepairAdvCmd { requests }));
            }
            _ => return None,
        };
        let skip = hdr_remaining.checked_sub(consumed)?;
        if buf.remaining() < skip {
            return None;
        }
        buf.advance(skip);
        Some(body)
    }
}

// ─── REPORT ──────────────────────────────────────────────────────────────────

/// REPORT message: a coarse counters snapshot. Drives no protocol state;
/// exists for on-wire observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportMsg {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub nacks_sent: u64,
    pub repairs_sent: u64,
}

impl ReportMsg {
    const FIXED_LEN: usize = 32;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.packets_sent);
        buf.put_u64(self.packets_received);
        buf.put_u64(self.nacks_sent);
        buf.put_u64(self.repairs_sent);
    }

    fn decode(buf: &mut Bytes, hdr_remaining: usize) -> Option<Self> {
        if buf.remaining() < Self::FIXED_LEN || hdr_remaining < Self::FIXED_LEN {
            return None;
        }
        Some(ReportMsg {
            packets_sent: buf.get_u64(),
            packets_received: buf.get_u64(),
            nacks_sent: buf.get_u64(),
            repairs_sent: buf.get_u64(),
        })
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Info(InfoMsg),
    Data(DataMsg),
    Cmd(CmdBody),
    Nack(NackMsg),
    Ack(AckMsg),
    Report(ReportMsg),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Info(_) => MessageType::Info,
            MessageBody::Data(_) => MessageType::Data,
            MessageBody::Cmd(_) => MessageType::Cmd,
            MessageBody::Nack(_) => MessageType::Nack,
            MessageBody::Ack(_) => MessageType::Ack,
            MessageBody::Report(_) => MessageType::Report,
        }
    }
}

/// A complete wire message: common header + typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub body: MessageBody,
}

impl Message {
    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMON_HEADER_LEN + 64);
        let hdr_words = |fixed: usize| ((COMMON_HEADER_LEN + fixed) / 4) as u8;
        match &self.body {
            MessageBody::Info(info) => {
                let d = info.to_data();
                self.header.encode(MessageType::Info, d.hdr_words(), &mut buf);
                d.encode(&mut buf);
            }
            MessageBody::Data(d) => {
                self.header.encode(MessageType::Data, d.hdr_words(), &mut buf);
                d.encode(&mut buf);
            }
            MessageBody::Cmd(c) => {
                self.header
                    .encode(MessageType::Cmd, hdr_words(c.fixed_len()), &mut buf);
                c.encode(&mut buf);
            }
            MessageBody::Nack(n) => {
                self.header
                    .encode(MessageType::Nack, hdr_words(NackMsg::FIXED_LEN), &mut buf);
                n.encode(&mut buf);
            }
            MessageBody::Ack(a) => {
                self.header
                    .encode(MessageType::Ack, hdr_words(AckMsg::FIXED_LEN), &mut buf);
                a.encode(&mut buf);
            }
            MessageBody::Report(r) => {
                self.header
                    .encode(MessageType::Report, hdr_words(ReportMsg::FIXED_LEN), &mut buf);
                r.encode(&mut buf);
            }
        }
        buf
    }

    /// Decode a complete datagram. `None` on truncation, version mismatch,
    /// or unknown type/subtype — callers count and drop.
    pub fn decode(raw: Bytes) -> Option<Message> {
        let mut buf = raw;
        let total = buf.remaining();
        let (header, msg_type, hdr_bytes) = MsgHeader::decode(&mut buf)?;
        if total < hdr_bytes {
            return None;
        }
        let hdr_remaining = hdr_bytes - COMMON_HEADER_LEN;
        let body = match msg_type {
            MessageType::Info => {
                MessageBody::Info(InfoMsg::from_data(DataMsg::decode(&mut buf, hdr_remaining)?))
            }
            MessageType::Data => MessageBody::Data(DataMsg::decode(&mut buf, hdr_remaining)?),
            MessageType::Cmd => MessageBody::Cmd(CmdBody::decode(&mut buf, hdr_remaining)?),
            MessageType::Nack => MessageBody::Nack(NackMsg::decode(&mut buf, hdr_remaining)?),
            MessageType::Ack => MessageBody::Ack(AckMsg::decode(&mut buf, hdr_remaining)?),
            MessageType::Report => MessageBody::Report(ReportMsg::decode(&mut buf, hdr_remaining)?),
        };
        Some(Message { header, body })
    }
}

// ─── Quantization ───────────────────────────────────────────────────────────
//
// One table, used everywhere. Linear at 1 µs resolution below 32 µs,
// log-scale above, continuous at the boundary, range [1 µs, 1000 s].

/// Smallest representable round-trip time, seconds.
pub const RTT_MIN: f64 = 1.0e-6;

/// Largest representable round-trip time, seconds.
pub const RTT_MAX: f64 = 1.0e3;

/// Quantize an RTT/GRTT value (seconds) into the 8-bit wire field.
pub fn quantize_grtt(rtt: f64) -> u8 {
    let rtt = rtt.clamp(RTT_MIN, RTT_MAX);
    if rtt < 3.3e-5 {
        ((rtt / RTT_MIN) as u8).saturating_sub(1)
    } else {
        (255.5 - 13.0 * (RTT_MAX / rtt).ln()) as u8
    }
}

/// Invert [`quantize_grtt`].
pub fn unquantize_grtt(q: u8) -> f64 {
    if q < 31 {
        (q as f64 + 1.0) * RTT_MIN
    } else {
        RTT_MAX / (((255 - q) as f64) / 13.0).exp()
    }
}

/// Quantize a backoff factor into the 4-bit wire field.
pub fn quantize_backoff(backoff: f64) -> u8 {
    backoff.round().clamp(0.0, 15.0) as u8
}

/// Invert [`quantize_backoff`].
pub fn unquantize_backoff(q: u8) -> f64 {
    (q & 0x0F) as f64
}

/// Quantize a group-size estimate into the 4-bit half-decade exponent.
pub fn quantize_gsize(size: f64) -> u8 {
    (2.0 * size.max(1.0).log10()).round().clamp(0.0, 15.0) as u8
}

/// Invert [`quantize_gsize`].
pub fn unquantize_gsize(q: u8) -> f64 {
    10f64.powf((q & 0x0F) as f64 / 2.0)
}
