//! Meridian wire format: the datagram header, packet type tags and the
//! throttle categories outbound traffic is classified into.
//!
//! The header is a fixed 10-byte packed struct. Everything after it is a
//! packet body, see `packets.rs`. Header integers are big-endian, body
//! integers are little-endian. Changing anything here breaks every client.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// 16-byte identifier for agents, sessions, assets, items and transfers.
/// Rendered as lowercase hex in logs.
pub type Uuid = [u8; 16];

pub const UUID_ZERO: Uuid = [0u8; 16];

/// Parse the hyphenated textual form (`8-4-4-4-12`) or bare 32-char hex.
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let compact: String = text.trim().chars().filter(|c| *c != '-').collect();
    if compact.len() != 32 {
        return None;
    }
    let bytes = hex::decode(compact).ok()?;
    bytes.try_into().ok()
}

/// Hyphenated textual form of a uuid.
pub fn format_uuid(id: &Uuid) -> String {
    let h = hex::encode(id);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

// ── Packet Header ────────────────────────────────────────────────────────────

/// Precedes every datagram in both directions.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// FLAG_RELIABLE | FLAG_RESENT. Other bits are ignored on receive.
    pub flags: u8,

    /// Per-connection sequence number, assigned by the sender at release time.
    pub sequence: U32<BigEndian>,

    /// Length of an extra header block. Always zero; non-zero is rejected.
    pub extra: u8,

    /// PacketType tag.
    pub packet_type: U32<BigEndian>,
}

assert_eq_size!(PacketHeader, [u8; 10]);

pub const HEADER_LEN: usize = std::mem::size_of::<PacketHeader>();

/// Sender expects a PacketAck for this sequence number.
pub const FLAG_RELIABLE: u8 = 0x40;

/// Datagram is a retransmission.
pub const FLAG_RESENT: u8 = 0x20;

/// Largest datagram the transport will accept or emit.
pub const MAX_PACKET_SIZE: usize = 4096;

impl PacketHeader {
    pub fn new(packet_type: PacketType, sequence: u32, flags: u8) -> Self {
        Self {
            flags,
            sequence: U32::new(sequence),
            extra: 0,
            packet_type: U32::new(packet_type.into()),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.get()
    }

    pub fn packet_type(&self) -> PacketType {
        PacketType::from(self.packet_type.get())
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & FLAG_RELIABLE != 0
    }

    pub fn is_resent(&self) -> bool {
        self.flags & FLAG_RESENT != 0
    }
}

/// Split a received datagram into its header and body.
pub fn split_datagram(data: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(WireError::PacketTooLarge(data.len()));
    }
    let header = PacketHeader::read_from_prefix(data).ok_or(WireError::Truncated {
        what: "packet header",
        need: HEADER_LEN,
        have: data.len(),
    })?;
    if header.extra != 0 {
        return Err(WireError::ExtraHeader(header.extra));
    }
    Ok((header, &data[HEADER_LEN..]))
}

/// Build a datagram from a header and an encoded body.
pub fn frame(header: &PacketHeader, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

// ── Packet Types ─────────────────────────────────────────────────────────────

/// Every message the transport core knows by name. Unknown tags are carried
/// through so the dispatcher can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    StartPingCheck,
    CompletePingCheck,
    LayerData,
    TransferPacket,
    SendXferPacket,
    ConfirmXferPacket,
    UseCircuitCode,
    AgentThrottle,
    TransferRequest,
    TransferInfo,
    TransferAbort,
    RequestXfer,
    AbortXfer,
    KickUser,
    LogoutRequest,
    LogoutReply,
    GenericMessage,
    PacketAck,
    Unknown(u32),
}

impl From<u32> for PacketType {
    fn from(tag: u32) -> Self {
        match tag {
            0x0000_0001 => PacketType::StartPingCheck,
            0x0000_0002 => PacketType::CompletePingCheck,
            0x0000_000B => PacketType::LayerData,
            0x0000_0011 => PacketType::TransferPacket,
            0x0000_0012 => PacketType::SendXferPacket,
            0x0000_0013 => PacketType::ConfirmXferPacket,
            0xFFFF_0003 => PacketType::UseCircuitCode,
            0xFFFF_0051 => PacketType::AgentThrottle,
            0xFFFF_0099 => PacketType::TransferRequest,
            0xFFFF_009A => PacketType::TransferInfo,
            0xFFFF_009B => PacketType::TransferAbort,
            0xFFFF_009C => PacketType::RequestXfer,
            0xFFFF_009D => PacketType::AbortXfer,
            0xFFFF_00A3 => PacketType::KickUser,
            0xFFFF_00FC => PacketType::LogoutRequest,
            0xFFFF_00FD => PacketType::LogoutReply,
            0xFFFF_0105 => PacketType::GenericMessage,
            0xFFFF_FFFB => PacketType::PacketAck,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u32 {
    fn from(t: PacketType) -> u32 {
        match t {
            PacketType::StartPingCheck => 0x0000_0001,
            PacketType::CompletePingCheck => 0x0000_0002,
            PacketType::LayerData => 0x0000_000B,
            PacketType::TransferPacket => 0x0000_0011,
            PacketType::SendXferPacket => 0x0000_0012,
            PacketType::ConfirmXferPacket => 0x0000_0013,
            PacketType::UseCircuitCode => 0xFFFF_0003,
            PacketType::AgentThrottle => 0xFFFF_0051,
            PacketType::TransferRequest => 0xFFFF_0099,
            PacketType::TransferInfo => 0xFFFF_009A,
            PacketType::TransferAbort => 0xFFFF_009B,
            PacketType::RequestXfer => 0xFFFF_009C,
            PacketType::AbortXfer => 0xFFFF_009D,
            PacketType::KickUser => 0xFFFF_00A3,
            PacketType::LogoutRequest => 0xFFFF_00FC,
            PacketType::LogoutReply => 0xFFFF_00FD,
            PacketType::GenericMessage => 0xFFFF_0105,
            PacketType::PacketAck => 0xFFFF_FFFB,
            PacketType::Unknown(tag) => tag,
        }
    }
}

// ── Throttle Categories ──────────────────────────────────────────────────────

/// Traffic class of an outbound packet. Each category owns one token bucket
/// and one FIFO queue in the outbound throttle.
///
/// The first seven appear, in this order, in the packed AgentThrottle array.
/// State and AvatarInfo are server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThrottleCategory {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    Task = 4,
    Texture = 5,
    Asset = 6,
    State = 7,
    AvatarInfo = 8,
}

impl ThrottleCategory {
    pub const COUNT: usize = 9;

    pub const ALL: [ThrottleCategory; Self::COUNT] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
        ThrottleCategory::State,
        ThrottleCategory::AvatarInfo,
    ];

    /// Categories carried in the packed throttle array, in wire order.
    pub const PACKED: [ThrottleCategory; PACKED_THROTTLE_COUNT] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ThrottleCategory::Resend => "resend",
            ThrottleCategory::Land => "land",
            ThrottleCategory::Wind => "wind",
            ThrottleCategory::Cloud => "cloud",
            ThrottleCategory::Task => "task",
            ThrottleCategory::Texture => "texture",
            ThrottleCategory::Asset => "asset",
            ThrottleCategory::State => "state",
            ThrottleCategory::AvatarInfo => "avatar_info",
        }
    }
}

impl TryFrom<u8> for ThrottleCategory {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ThrottleCategory::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownCategory(value))
    }
}

pub const PACKED_THROTTLE_COUNT: usize = 7;

/// Byte length of the packed throttle array: seven little-endian f32.
pub const PACKED_THROTTLE_LEN: usize = PACKED_THROTTLE_COUNT * 4;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("datagram of {0} bytes exceeds maximum {}", MAX_PACKET_SIZE)]
    PacketTooLarge(usize),

    #[error("extra header blocks are not supported (length {0})")]
    ExtraHeader(u8),

    #[error("unknown throttle category: {0}")]
    UnknownCategory(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
