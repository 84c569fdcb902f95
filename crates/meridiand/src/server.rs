//! The server: turns datagrams into connection events and dispatched packets.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, Notify};

use meridian_core::config::MeridianConfig;
use meridian_core::packets::{AgentData, KickUser, PacketAck, UseCircuitCode};
use meridian_core::wire::{split_datagram, PacketType, ThrottleCategory, Uuid};
use meridian_services::{
    dispatch, AssetLookup, AssetTransferService, ClientConnection, ConnectionHooks,
    ConnectionMeta, ConnectionTable, GlobalHandlers, InboundPacket, PooledBuffer, SceneAccess,
    XferService,
};

use crate::circuit::CircuitManager;
use crate::client_handlers;
use crate::transport::PacketSink;

pub struct MeridianServer {
    me: Weak<MeridianServer>,
    pub connections: ConnectionTable,
    pub circuits: CircuitManager,
    pub globals: GlobalHandlers,
    pub transfers: AssetTransferService,
    pub xfers: XferService,
    pub hooks: ConnectionHooks,
    config: MeridianConfig,
    outbound_ready: Arc<Notify>,
}

impl MeridianServer {
    pub fn new(
        config: MeridianConfig,
        assets: Arc<dyn AssetLookup>,
        scene: Arc<dyn SceneAccess>,
        hooks: ConnectionHooks,
    ) -> Arc<Self> {
        let server = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connections: ConnectionTable::new(),
            circuits: CircuitManager::new(),
            globals: GlobalHandlers::new(),
            transfers: AssetTransferService::new(assets, scene),
            xfers: XferService::new(),
            hooks,
            config,
            outbound_ready: Arc::new(Notify::new()),
        });
        client_handlers::register_global(&server.globals);
        server.circuits.apply_config(&server.config.circuits);
        server
    }

    /// Signalled whenever any connection queues a packet.
    pub fn outbound_ready(&self) -> Arc<Notify> {
        self.outbound_ready.clone()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.connection_timeout_secs)
    }

    pub fn handle_datagram(&self, from: SocketAddr, data: &[u8]) {
        let (header, body) = match split_datagram(data) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!(%from, error = %e, "malformed datagram, discarding");
                return;
            }
        };
        let packet = InboundPacket::new(&header, Bytes::copy_from_slice(body));

        if packet.packet_type == PacketType::UseCircuitCode {
            self.use_circuit_code(from, &packet);
            return;
        }

        let Some(conn) = self.connections.get(&from) else {
            tracing::trace!(%from, packet_type = ?packet.packet_type, "packet from unknown endpoint");
            return;
        };
        conn.touch();
        if packet.reliable {
            acknowledge(&conn, packet.sequence);
        }
        if packet.packet_type == PacketType::PacketAck {
            return;
        }
        dispatch(&conn, &self.globals, packet);
    }

    fn use_circuit_code(&self, from: SocketAddr, packet: &InboundPacket) {
        if let Some(existing) = self.connections.get(&from) {
            tracing::debug!(%from, "duplicate UseCircuitCode ignored");
            if packet.reliable {
                acknowledge(&existing, packet.sequence);
            }
            return;
        }

        let request = match packet.decode::<UseCircuitCode>() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%from, error = %e, "malformed UseCircuitCode");
                return;
            }
        };
        let circuit = match self.circuits.authorize(&request) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%from, error = %e, "UseCircuitCode rejected");
                return;
            }
        };

        let meta = ConnectionMeta {
            agent_id: circuit.agent_id,
            session_id: circuit.session_id,
            secure_session_id: circuit.secure_session_id,
            circuit_code: circuit.circuit_code,
            remote_addr: from,
            established_at: Instant::now(),
        };
        let conn = Arc::new(
            ClientConnection::new(meta, &self.config.throttle, self.config.transfer.clone())
                .with_outbound_notify(self.outbound_ready.clone()),
        );
        client_handlers::register_local(&conn, &self.me);
        if !self.connections.insert(conn.clone()) {
            conn.close();
            return;
        }

        tracing::info!(
            %from,
            agent = hex::encode(conn.meta.agent_id),
            circuit = circuit.circuit_code,
            "connection established"
        );
        if packet.reliable {
            acknowledge(&conn, packet.sequence);
        }
        self.hooks.established(&conn);
    }

    /// Tear a connection down. Packets it already queued are still flushed.
    pub fn close_connection(&self, addr: &SocketAddr, reason: &str) -> bool {
        let Some(conn) = self.connections.remove(addr) else {
            return false;
        };
        self.circuits.remove_circuit(conn.meta.circuit_code);
        tracing::info!(
            %addr,
            agent = hex::encode(conn.meta.agent_id),
            reason,
            "connection closed"
        );
        self.hooks.closed(&conn);
        true
    }

    /// Send KickUser to the agent and close its connection.
    pub fn kick(&self, agent_id: &Uuid, reason: &str) -> bool {
        let Some(conn) = self.connections.find_agent(agent_id) else {
            return false;
        };
        let kick = KickUser {
            agent: AgentData {
                agent_id: conn.meta.agent_id,
                session_id: conn.meta.session_id,
            },
            reason: reason.to_string(),
        };
        conn.send_reliable(&kick, ThrottleCategory::Task);
        self.close_connection(&conn.meta.remote_addr, "kicked")
    }

    /// Kick every connected agent. Returns how many were closed.
    pub fn kick_all(&self, reason: &str) -> usize {
        self.connections
            .snapshot()
            .iter()
            .filter(|conn| self.kick(&conn.meta.agent_id, reason))
            .count()
    }

    /// Close every connection idle longer than the configured timeout.
    pub fn expire_idle(&self, now: Instant) -> usize {
        let timeout = self.connection_timeout();
        let mut expired = 0;
        for conn in self.connections.snapshot() {
            if conn.idle_for(now) > timeout && self.close_connection(&conn.meta.remote_addr, "timeout") {
                expired += 1;
            }
        }
        expired
    }

    pub async fn expiry_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("expiry loop shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let expired = self.expire_idle(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "expired idle connections");
                    }
                }
            }
        }
    }
}

impl PacketSink for MeridianServer {
    fn packet_received(&self, from: SocketAddr, data: PooledBuffer) {
        self.handle_datagram(from, &data);
    }
}

fn acknowledge(conn: &ClientConnection, sequence: u32) {
    let ack = PacketAck {
        sequences: vec![sequence],
    };
    conn.send(&ack, ThrottleCategory::Resend);
}
