//! Packet bodies. Every body is a little-endian byte layout that follows the
//! 10-byte header; variable-length fields carry a u8 or u16 length prefix.
//!
//! Decoders check lengths before every read and never panic on short input.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::{PacketType, Uuid, WireError};

/// A typed packet body.
pub trait PacketBody: Sized {
    const TYPE: PacketType;

    fn encode_into(&self, buf: &mut BytesMut);

    fn decode(body: &[u8]) -> Result<Self, WireError>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

// ── Read helpers ─────────────────────────────────────────────────────────────

fn need(buf: &&[u8], n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated {
            what,
            need: n,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn get_uuid(buf: &mut &[u8], what: &'static str) -> Result<Uuid, WireError> {
    need(buf, 16, what)?;
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    Ok(id)
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, WireError> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, WireError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

fn get_i32(buf: &mut &[u8], what: &'static str) -> Result<i32, WireError> {
    need(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

fn get_u64(buf: &mut &[u8], what: &'static str) -> Result<u64, WireError> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_var8(buf: &mut &[u8], what: &'static str) -> Result<Bytes, WireError> {
    let len = get_u8(buf, what)? as usize;
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

fn get_var16(buf: &mut &[u8], what: &'static str) -> Result<Bytes, WireError> {
    need(buf, 2, what)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

/// Strings are length-prefixed and may carry a trailing NUL.
fn get_string(buf: &mut &[u8], what: &'static str) -> Result<String, WireError> {
    let raw = get_var8(buf, what)?;
    let text = String::from_utf8_lossy(&raw);
    Ok(text.trim_end_matches('\0').to_string())
}

// Over-long variable fields are truncated to what the prefix can express.
fn put_var8_lossy(buf: &mut BytesMut, data: &[u8]) {
    let len = data.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&data[..len]);
}

fn put_var16_lossy(buf: &mut BytesMut, data: &[u8]) {
    let len = data.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&data[..len]);
}

// ── AgentData ────────────────────────────────────────────────────────────────

/// Identity block prefixed to client messages that act on behalf of an agent.
/// Receivers compare it with the connection's identity and drop mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl AgentData {
    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            agent_id: get_uuid(buf, "agent id")?,
            session_id: get_uuid(buf, "session id")?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.agent_id);
        buf.put_slice(&self.session_id);
    }
}

// ── Circuit ──────────────────────────────────────────────────────────────────

/// First packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl PacketBody for UseCircuitCode {
    const TYPE: PacketType = PacketType::UseCircuitCode;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.code);
        buf.put_slice(&self.session_id);
        buf.put_slice(&self.agent_id);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            code: get_u32(buf, "circuit code")?,
            session_id: get_uuid(buf, "session id")?,
            agent_id: get_uuid(buf, "agent id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPingCheck {
    pub ping_id: u8,
    pub oldest_unacked: u32,
}

impl PacketBody for StartPingCheck {
    const TYPE: PacketType = PacketType::StartPingCheck;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            ping_id: get_u8(buf, "ping id")?,
            oldest_unacked: get_u32(buf, "oldest unacked")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl PacketBody for CompletePingCheck {
    const TYPE: PacketType = PacketType::CompletePingCheck;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            ping_id: get_u8(&mut body, "ping id")?,
        })
    }
}

/// Acknowledges reliable packets by sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAck {
    pub sequences: Vec<u32>,
}

impl PacketBody for PacketAck {
    const TYPE: PacketType = PacketType::PacketAck;

    fn encode_into(&self, buf: &mut BytesMut) {
        let count = self.sequences.len().min(u8::MAX as usize);
        buf.put_u8(count as u8);
        for seq in &self.sequences[..count] {
            buf.put_u32_le(*seq);
        }
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        let count = get_u8(buf, "ack count")? as usize;
        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            sequences.push(get_u32(buf, "ack sequence")?);
        }
        Ok(Self { sequences })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub agent: AgentData,
}

impl PacketBody for LogoutRequest {
    const TYPE: PacketType = PacketType::LogoutRequest;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.agent.write(buf);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            agent: AgentData::read(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutReply {
    pub agent: AgentData,
}

impl PacketBody for LogoutReply {
    const TYPE: PacketType = PacketType::LogoutReply;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.agent.write(buf);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            agent: AgentData::read(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickUser {
    pub agent: AgentData,
    pub reason: String,
}

impl PacketBody for KickUser {
    const TYPE: PacketType = PacketType::KickUser;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.agent.write(buf);
        put_var8_lossy(buf, self.reason.as_bytes());
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            agent: AgentData::read(buf)?,
            reason: get_string(buf, "kick reason")?,
        })
    }
}

/// Client-requested bandwidth split. `throttles` is the packed array of
/// seven little-endian f32 in bits per second.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentThrottle {
    pub agent: AgentData,
    pub circuit_code: u32,
    pub gen_counter: u32,
    pub throttles: Bytes,
}

impl PacketBody for AgentThrottle {
    const TYPE: PacketType = PacketType::AgentThrottle;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.agent.write(buf);
        buf.put_u32_le(self.circuit_code);
        buf.put_u32_le(self.gen_counter);
        put_var8_lossy(buf, &self.throttles);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            agent: AgentData::read(buf)?,
            circuit_code: get_u32(buf, "circuit code")?,
            gen_counter: get_u32(buf, "gen counter")?,
            throttles: get_var8(buf, "throttles")?,
        })
    }
}

// ── Asset transfer ───────────────────────────────────────────────────────────

/// Client asks for an asset. `params` layout depends on `source_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub transfer_id: Uuid,
    pub channel_type: i32,
    pub source_type: i32,
    pub priority: f32,
    pub params: Bytes,
}

impl PacketBody for TransferRequest {
    const TYPE: PacketType = PacketType::TransferRequest;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.transfer_id);
        buf.put_i32_le(self.channel_type);
        buf.put_i32_le(self.source_type);
        buf.put_f32_le(self.priority);
        put_var16_lossy(buf, &self.params);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        let transfer_id = get_uuid(buf, "transfer id")?;
        let channel_type = get_i32(buf, "channel type")?;
        let source_type = get_i32(buf, "source type")?;
        need(buf, 4, "priority")?;
        let priority = buf.get_f32_le();
        Ok(Self {
            transfer_id,
            channel_type,
            source_type,
            priority,
            params: get_var16(buf, "transfer params")?,
        })
    }
}

/// Announces a transfer's outcome and total size before any data chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub transfer_id: Uuid,
    pub channel_type: i32,
    pub target_type: i32,
    pub status: i32,
    pub size: i32,
    pub params: Bytes,
}

impl PacketBody for TransferInfo {
    const TYPE: PacketType = PacketType::TransferInfo;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.transfer_id);
        buf.put_i32_le(self.channel_type);
        buf.put_i32_le(self.target_type);
        buf.put_i32_le(self.status);
        buf.put_i32_le(self.size);
        put_var16_lossy(buf, &self.params);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            transfer_id: get_uuid(buf, "transfer id")?,
            channel_type: get_i32(buf, "channel type")?,
            target_type: get_i32(buf, "target type")?,
            status: get_i32(buf, "status")?,
            size: get_i32(buf, "size")?,
            params: get_var16(buf, "transfer params")?,
        })
    }
}

/// One chunk of asset data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPacket {
    pub transfer_id: Uuid,
    pub channel_type: i32,
    pub packet: i32,
    pub status: i32,
    pub data: Bytes,
}

impl PacketBody for TransferPacket {
    const TYPE: PacketType = PacketType::TransferPacket;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.transfer_id);
        buf.put_i32_le(self.channel_type);
        buf.put_i32_le(self.packet);
        buf.put_i32_le(self.status);
        put_var16_lossy(buf, &self.data);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            transfer_id: get_uuid(buf, "transfer id")?,
            channel_type: get_i32(buf, "channel type")?,
            packet: get_i32(buf, "packet number")?,
            status: get_i32(buf, "status")?,
            data: get_var16(buf, "transfer data")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAbort {
    pub transfer_id: Uuid,
    pub channel_type: i32,
}

impl PacketBody for TransferAbort {
    const TYPE: PacketType = PacketType::TransferAbort;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.transfer_id);
        buf.put_i32_le(self.channel_type);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            transfer_id: get_uuid(buf, "transfer id")?,
            channel_type: get_i32(buf, "channel type")?,
        })
    }
}

// ── Xfer ─────────────────────────────────────────────────────────────────────

/// Starts a generic file transfer. Sent by the client to download a named
/// file, or by the server to pull an upload from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestXfer {
    pub id: u64,
    pub filename: String,
    pub delete_on_completion: bool,
    pub vfile_id: Uuid,
    pub vfile_type: i16,
}

impl PacketBody for RequestXfer {
    const TYPE: PacketType = PacketType::RequestXfer;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        put_var8_lossy(buf, self.filename.as_bytes());
        buf.put_u8(self.delete_on_completion as u8);
        buf.put_slice(&self.vfile_id);
        buf.put_i16_le(self.vfile_type);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        let id = get_u64(buf, "xfer id")?;
        let filename = get_string(buf, "filename")?;
        let delete_on_completion = get_u8(buf, "delete flag")? != 0;
        let vfile_id = get_uuid(buf, "vfile id")?;
        need(buf, 2, "vfile type")?;
        Ok(Self {
            id,
            filename,
            delete_on_completion,
            vfile_id,
            vfile_type: buf.get_i16_le(),
        })
    }
}

/// One xfer chunk. Bit 31 of `packet` marks the final chunk; packet 0 starts
/// with the total length as a little-endian u32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendXferPacket {
    pub id: u64,
    pub packet: u32,
    pub data: Bytes,
}

impl PacketBody for SendXferPacket {
    const TYPE: PacketType = PacketType::SendXferPacket;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.packet);
        put_var16_lossy(buf, &self.data);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            id: get_u64(buf, "xfer id")?,
            packet: get_u32(buf, "packet number")?,
            data: get_var16(buf, "xfer data")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmXferPacket {
    pub id: u64,
    pub packet: u32,
}

impl PacketBody for ConfirmXferPacket {
    const TYPE: PacketType = PacketType::ConfirmXferPacket;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.packet);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            id: get_u64(buf, "xfer id")?,
            packet: get_u32(buf, "packet number")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortXfer {
    pub id: u64,
    pub result: i32,
}

impl PacketBody for AbortXfer {
    const TYPE: PacketType = PacketType::AbortXfer;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_i32_le(self.result);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            id: get_u64(buf, "xfer id")?,
            result: get_i32(buf, "result")?,
        })
    }
}

// ── Generic message & terrain ────────────────────────────────────────────────

/// Named method call carrying opaque parameter blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    pub agent: AgentData,
    pub method: String,
    pub invoice: Uuid,
    pub params: Vec<Bytes>,
}

impl PacketBody for GenericMessage {
    const TYPE: PacketType = PacketType::GenericMessage;

    fn encode_into(&self, buf: &mut BytesMut) {
        self.agent.write(buf);
        put_var8_lossy(buf, self.method.as_bytes());
        buf.put_slice(&self.invoice);
        let count = self.params.len().min(u8::MAX as usize);
        buf.put_u8(count as u8);
        for p in &self.params[..count] {
            put_var8_lossy(buf, p);
        }
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        let agent = AgentData::read(buf)?;
        let method = get_string(buf, "method")?;
        let invoice = get_uuid(buf, "invoice")?;
        let count = get_u8(buf, "param count")? as usize;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            params.push(get_var8(buf, "param")?);
        }
        Ok(Self {
            agent,
            method,
            invoice,
            params,
        })
    }
}

/// Bit-packed terrain patches, see `terrain::build_layer_packets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerData {
    pub layer_type: u8,
    pub data: Bytes,
}

impl PacketBody for LayerData {
    const TYPE: PacketType = PacketType::LayerData;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.layer_type);
        put_var16_lossy(buf, &self.data);
    }

    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        Ok(Self {
            layer_type: get_u8(buf, "layer type")?,
            data: get_var16(buf, "layer data")?,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
