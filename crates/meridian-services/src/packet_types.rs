//! Packet types: what handlers receive and what the throttle queues.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use meridian_core::packets::PacketBody;
use meridian_core::wire::{PacketHeader, PacketType, ThrottleCategory, HEADER_LEN};

/// A received packet after header parsing.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub packet_type: PacketType,
    pub sequence: u32,
    pub reliable: bool,
    pub resent: bool,
    pub body: Bytes,
}

impl InboundPacket {
    pub fn new(header: &PacketHeader, body: Bytes) -> Self {
        Self {
            packet_type: header.packet_type(),
            sequence: header.sequence(),
            reliable: header.is_reliable(),
            resent: header.is_resent(),
            body,
        }
    }

    /// Build an unsequenced packet from a typed body. Used by tests and by
    /// code that loops packets back into dispatch.
    pub fn from_body<B: PacketBody>(body: &B) -> Self {
        Self {
            packet_type: B::TYPE,
            sequence: 0,
            reliable: false,
            resent: false,
            body: body.encode(),
        }
    }

    pub fn decode<B: PacketBody>(&self) -> Result<B, meridian_core::WireError> {
        B::decode(&self.body)
    }
}

/// Fired once the packet has been written to the socket.
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Fired every time the packet is put back in the queue for retransmission.
pub type ResendCallback = Arc<dyn Fn(&OutgoingPacket) + Send + Sync>;

/// A packet waiting in the outbound throttle. The sequence number is
/// assigned when the send worker releases it.
pub struct OutgoingPacket {
    pub packet_type: PacketType,
    pub body: Bytes,
    pub category: ThrottleCategory,
    pub reliable: bool,
    pub resent: bool,
    pub on_resend: Option<ResendCallback>,
    pub on_complete: Option<CompletionCallback>,
}

impl OutgoingPacket {
    pub fn new(packet_type: PacketType, body: Bytes, category: ThrottleCategory) -> Self {
        Self {
            packet_type,
            body,
            category,
            reliable: false,
            resent: false,
            on_resend: None,
            on_complete: None,
        }
    }

    pub fn from_body<B: PacketBody>(body: &B, category: ThrottleCategory) -> Self {
        Self::new(B::TYPE, body.encode(), category)
    }

    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    pub fn with_completion(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn with_resend(mut self, callback: impl Fn(&OutgoingPacket) + Send + Sync + 'static) -> Self {
        self.on_resend = Some(Arc::new(callback));
        self
    }

    /// Bytes this packet costs against a token bucket.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn header_flags(&self) -> u8 {
        let mut flags = 0;
        if self.reliable {
            flags |= meridian_core::wire::FLAG_RELIABLE;
        }
        if self.resent {
            flags |= meridian_core::wire::FLAG_RESENT;
        }
        flags
    }

    /// Flag the packet as a retransmission on the Resend category and run
    /// the resend callback.
    pub fn mark_resent(&mut self) {
        self.resent = true;
        self.category = ThrottleCategory::Resend;
        if let Some(callback) = self.on_resend.clone() {
            callback(self);
        }
    }

    /// Run the completion callback, if any. Safe to call more than once.
    pub fn complete(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback();
        }
    }
}

impl fmt::Debug for OutgoingPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingPacket")
            .field("packet_type", &self.packet_type)
            .field("category", &self.category)
            .field("len", &self.body.len())
            .field("reliable", &self.reliable)
            .field("resent", &self.resent)
            .finish()
    }
}
