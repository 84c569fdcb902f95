//! Connection management. One `ClientConnection` per remote endpoint, owned
//! by the connection table and shared with handlers and the send worker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;

use meridian_core::config::{ThrottleConfig, TransferConfig};
use meridian_core::packets::{AgentData, LayerData, PacketBody};
use meridian_core::terrain::{build_layer_packets, TerrainData, TerrainError};
use meridian_core::wire::{ThrottleCategory, Uuid, HEADER_LEN};

use crate::asset_transfer::TransferBook;
use crate::handlers::LocalHandlers;
use crate::packet_types::OutgoingPacket;
use crate::qos::OutboundThrottle;
use crate::xfer::XferBook;

/// LayerData payload budget: a 1400-byte datagram minus the header, the
/// layer type byte and the u16 length prefix.
const LAYER_PAYLOAD_BUDGET: usize = 1400 - HEADER_LEN - 3;

/// Identity of a connection, fixed at handshake.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
}

pub struct ClientConnection {
    pub meta: ConnectionMeta,
    pub handlers: LocalHandlers,
    pub transfers: TransferBook,
    pub xfers: XferBook,
    throttle: Mutex<OutboundThrottle>,
    outbound_ready: Arc<Notify>,
    last_activity: Mutex<Instant>,
    sequence: AtomicU32,
    active: AtomicBool,
    transfer_config: TransferConfig,
}

impl ClientConnection {
    pub fn new(meta: ConnectionMeta, rates: &ThrottleConfig, transfer_config: TransferConfig) -> Self {
        Self {
            meta,
            handlers: LocalHandlers::new(),
            transfers: TransferBook::new(),
            xfers: XferBook::default(),
            throttle: Mutex::new(OutboundThrottle::new(rates)),
            outbound_ready: Arc::new(Notify::new()),
            last_activity: Mutex::new(Instant::now()),
            sequence: AtomicU32::new(0),
            active: AtomicBool::new(true),
            transfer_config,
        }
    }

    /// Share one wake-up signal between many connections, so a single send
    /// worker can wait on all of them.
    pub fn with_outbound_notify(mut self, notify: Arc<Notify>) -> Self {
        self.outbound_ready = notify;
        self
    }

    pub fn agent_id(&self) -> Uuid {
        self.meta.agent_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.meta.remote_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer_config
    }

    /// Packets that carry an AgentData block must name this connection.
    pub fn verify_agent(&self, agent: &AgentData) -> bool {
        agent.agent_id == self.meta.agent_id && agent.session_id == self.meta.session_id
    }

    /// Queue a packet behind the throttle. Returns false once the
    /// connection is closed; the packet is dropped.
    pub fn out_packet(&self, packet: OutgoingPacket) -> bool {
        if !self.is_active() {
            tracing::trace!(
                agent = hex::encode(self.meta.agent_id),
                packet_type = ?packet.packet_type,
                "dropping packet for closed connection"
            );
            return false;
        }
        self.with_throttle(|t| t.enqueue(packet));
        self.outbound_ready.notify_one();
        true
    }

    pub fn send<B: PacketBody>(&self, body: &B, category: ThrottleCategory) -> bool {
        self.out_packet(OutgoingPacket::from_body(body, category))
    }

    pub fn send_reliable<B: PacketBody>(&self, body: &B, category: ThrottleCategory) -> bool {
        self.out_packet(OutgoingPacket::from_body(body, category).reliable())
    }

    /// Requeue a packet for retransmission. The resend callback runs before
    /// the throttle lock is taken.
    pub fn resend(&self, mut packet: OutgoingPacket) -> bool {
        if !self.is_active() {
            return false;
        }
        packet.mark_resent();
        self.with_throttle(|t| t.enqueue(packet));
        self.outbound_ready.notify_one();
        true
    }

    /// Sequence numbers start at 1 and wrap.
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn dequeue_ready(&self, now: Instant) -> Vec<OutgoingPacket> {
        self.with_throttle(|t| t.dequeue_ready(now))
    }

    pub fn drain_all(&self) -> Vec<OutgoingPacket> {
        self.with_throttle(|t| t.drain_all())
    }

    pub fn with_throttle<R>(&self, f: impl FnOnce(&mut OutboundThrottle) -> R) -> R {
        let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut throttle)
    }

    /// Woken whenever a packet is queued.
    pub fn outbound_ready(&self) -> Arc<Notify> {
        self.outbound_ready.clone()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    /// Mark the connection closed and drop per-connection state. Returns
    /// true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.handlers.clear();
        self.transfers.clear();
        self.xfers.clear();
        self.outbound_ready.notify_one();
        true
    }

    /// Compress the given terrain patches and queue them as LayerData on the
    /// Land category. Returns the number of packets queued.
    pub fn send_land_patches(
        &self,
        terrain: &TerrainData,
        patches: &[(u32, u32)],
    ) -> Result<usize, TerrainError> {
        let (layer, payloads) = build_layer_packets(terrain, patches, LAYER_PAYLOAD_BUDGET)
            .inspect_err(|e| {
                tracing::error!(
                    agent = hex::encode(self.meta.agent_id),
                    error = %e,
                    "terrain encode failed, nothing sent"
                )
            })?;
        let mut queued = 0;
        for data in payloads {
            let body = LayerData {
                layer_type: layer as u8,
                data,
            };
            if self.send(&body, ThrottleCategory::Land) {
                queued += 1;
            }
        }
        Ok(queued)
    }
}

// ── Hooks ────────────────────────────────────────────────────────────────────

pub type ConnectionCallback = Arc<dyn Fn(&Arc<ClientConnection>) + Send + Sync>;

/// Single-subscriber lifecycle callbacks.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_established: Option<ConnectionCallback>,
    pub on_closed: Option<ConnectionCallback>,
}

impl ConnectionHooks {
    pub fn established(&self, conn: &Arc<ClientConnection>) {
        if let Some(hook) = &self.on_established {
            hook(conn);
        }
    }

    pub fn closed(&self, conn: &Arc<ClientConnection>) {
        if let Some(hook) = &self.on_closed {
            hook(conn);
        }
    }
}

// ── Connection table ─────────────────────────────────────────────────────────

/// Live connections keyed by remote address, plus connections that were
/// closed but still have queued packets for the send worker to flush.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    active: Arc<DashMap<SocketAddr, Arc<ClientConnection>>>,
    closing: Arc<Mutex<Vec<Arc<ClientConnection>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the address already has a connection.
    pub fn insert(&self, conn: Arc<ClientConnection>) -> bool {
        match self.active.entry(conn.meta.remote_addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<ClientConnection>> {
        self.active.get(addr).map(|c| c.value().clone())
    }

    pub fn find_agent(&self, agent_id: &Uuid) -> Option<Arc<ClientConnection>> {
        self.active
            .iter()
            .find(|c| &c.meta.agent_id == agent_id)
            .map(|c| c.value().clone())
    }

    /// Remove and close a connection. Its queued packets are kept for one
    /// final flush.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<ClientConnection>> {
        let (_, conn) = self.active.remove(addr)?;
        if conn.close() {
            self.closing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn.clone());
        }
        Some(conn)
    }

    pub fn take_closing(&self) -> Vec<Arc<ClientConnection>> {
        std::mem::take(&mut *self.closing.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.active.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
