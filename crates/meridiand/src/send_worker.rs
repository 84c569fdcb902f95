//! Send worker: releases packets from every connection's throttle, stamps
//! sequence numbers and writes them to the socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};

use meridian_core::wire::{frame, PacketHeader, MAX_PACKET_SIZE};
use meridian_services::{ClientConnection, ConnectionTable, OutgoingPacket};

use crate::transport::UdpTransport;

pub struct SendWorker {
    transport: Arc<UdpTransport>,
    connections: ConnectionTable,
    notify: Arc<Notify>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        transport: Arc<UdpTransport>,
        connections: ConnectionTable,
        notify: Arc<Notify>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            connections,
            notify,
            interval,
            shutdown,
        }
    }

    /// Flush whenever something is queued, and on every tick so packets
    /// held back by the throttle go out once tokens refill.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    self.flush_closing().await;
                    return Ok(());
                }
                _ = self.notify.notified() => {}
                _ = tick.tick() => {}
            }
            self.flush().await;
        }
    }

    async fn flush(&self) {
        let now = Instant::now();
        for conn in self.connections.snapshot() {
            for packet in conn.dequeue_ready(now) {
                self.transmit(&conn, packet).await;
            }
        }
        self.flush_closing().await;
    }

    /// Closed connections get everything they queued before closing,
    /// regardless of throttle state.
    async fn flush_closing(&self) {
        for conn in self.connections.take_closing() {
            let packets = conn.drain_all();
            if !packets.is_empty() {
                tracing::debug!(
                    addr = %conn.meta.remote_addr,
                    count = packets.len(),
                    "flushing closed connection"
                );
            }
            for packet in packets {
                self.transmit(&conn, packet).await;
            }
        }
    }

    async fn transmit(&self, conn: &ClientConnection, mut packet: OutgoingPacket) {
        let header = PacketHeader::new(packet.packet_type, conn.next_sequence(), packet.header_flags());
        let datagram = frame(&header, &packet.body);
        if datagram.len() > MAX_PACKET_SIZE {
            tracing::warn!(
                packet_type = ?packet.packet_type,
                len = datagram.len(),
                "outgoing packet exceeds maximum size, dropped"
            );
            return;
        }

        match self.transport.send(conn.meta.remote_addr, &datagram).await {
            Ok(_) => packet.complete(),
            Err(e) => {
                tracing::warn!(addr = %conn.meta.remote_addr, error = %e, "send failed");
            }
        }
    }
}
