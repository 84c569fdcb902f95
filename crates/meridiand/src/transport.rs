//! Datagram transport. Owns the UDP socket and hands every datagram to a
//! `PacketSink`; knows nothing about the protocol.

use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use meridian_core::config::NetworkConfig;
use meridian_core::wire::MAX_PACKET_SIZE;
use meridian_services::{BufferPool, PooledBuffer};

/// Consecutive remote-reset errors tolerated before backing off.
const MAX_RESET_RETRIES: u32 = 100;
const RESET_BACKOFF: Duration = Duration::from_millis(100);

/// Idle receive buffers kept around.
const POOL_SIZE: usize = 256;

/// Entry point for received datagrams. `data` is exactly the datagram.
pub trait PacketSink: Send + Sync + 'static {
    fn packet_received(&self, from: SocketAddr, data: PooledBuffer);
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    pool: BufferPool,
    async_mode: bool,
}

impl UdpTransport {
    /// Bind the socket described by `config`.
    pub fn start(config: &NetworkConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .with_context(|| format!("invalid bind address {}", config.bind_address))?;
        let socket = bind_socket(addr, config.receive_buffer_size)?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        Ok(Self {
            socket: Arc::new(socket),
            pool: BufferPool::new(POOL_SIZE, MAX_PACKET_SIZE),
            async_mode: config.async_packet_handling,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("local_addr")
    }

    /// Best-effort send: a non-blocking write first, an awaited one if the
    /// socket buffer is full.
    pub async fn send(&self, to: SocketAddr, data: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(data, to) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.socket.send_to(data, to).await,
            other => other,
        }
    }

    /// Receive until shutdown. In async mode each datagram is handled on its
    /// own task and the next receive is posted immediately.
    ///
    /// Sending on `shutdown` is the stop path: the pending receive is
    /// abandoned, the loop returns, and the socket closes once the last
    /// `Arc<UdpTransport>` is dropped.
    pub async fn run<S: PacketSink>(
        self: Arc<Self>,
        sink: Arc<S>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            async_mode = self.async_mode,
            "transport receiving"
        );

        let mut resets = 0u32;
        loop {
            let mut buf = self.pool.acquire();
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transport shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf[..]) => {
                    match result {
                        Ok((len, from)) => {
                            resets = 0;
                            buf.truncate(len);
                            self.deliver(&sink, from, buf);
                        }
                        Err(e) if is_remote_reset(&e) => {
                            resets += 1;
                            if resets >= MAX_RESET_RETRIES {
                                tracing::warn!(resets, "repeated remote resets, backing off");
                                tokio::time::sleep(RESET_BACKOFF).await;
                                resets = 0;
                            } else {
                                tracing::warn!(error = %e, "remote reset on receive, retrying");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                        }
                    }
                }
            }
        }
    }

    fn deliver<S: PacketSink>(&self, sink: &Arc<S>, from: SocketAddr, buf: PooledBuffer) {
        if self.async_mode {
            let sink = sink.clone();
            tokio::spawn(async move { handle_guarded(&*sink, from, buf) });
        } else {
            handle_guarded(&**sink, from, buf);
        }
    }
}

fn handle_guarded<S: PacketSink>(sink: &S, from: SocketAddr, buf: PooledBuffer) {
    if catch_unwind(AssertUnwindSafe(|| sink.packet_received(from, buf))).is_err() {
        tracing::error!(%from, "packet handling panicked");
    }
}

/// ICMP port-unreachable from an earlier send surfaces on the next receive.
fn is_remote_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

fn bind_socket(addr: SocketAddr, receive_buffer_size: usize) -> Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if receive_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(receive_buffer_size) {
            tracing::warn!(error = %e, requested = receive_buffer_size, "SO_RCVBUF not applied");
        }
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).with_context(|| format!("bind({addr})"))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        arrived: Notify,
    }

    impl PacketSink for Recorder {
        fn packet_received(&self, from: SocketAddr, data: PooledBuffer) {
            if data.first() == Some(&0xFF) {
                panic!("bad packet");
            }
            self.seen.lock().unwrap().push((from, data.to_vec()));
            self.arrived.notify_one();
        }
    }

    fn loopback(async_mode: bool) -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            async_packet_handling: async_mode,
            ..NetworkConfig::default()
        }
    }

    async fn exchange(async_mode: bool) {
        let transport = Arc::new(UdpTransport::start(&loopback(async_mode)).unwrap());
        let addr = transport.local_addr().unwrap();
        let sink = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.clone().run(sink.clone(), shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xFF], addr).await.unwrap();
        client.send_to(&[1, 2, 3], addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), sink.arrived.notified())
            .await
            .unwrap();
        {
            let seen = sink.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, client.local_addr().unwrap());
            assert_eq!(seen[0].1, vec![1, 2, 3]);
        }

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn sync_mode_survives_handler_panic() {
        exchange(false).await;
    }

    #[tokio::test]
    async fn async_mode_delivers() {
        exchange(true).await;
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let transport = UdpTransport::start(&loopback(false)).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transport.send(peer.local_addr().unwrap(), b"hi").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hi");
        assert_eq!(from, transport.local_addr().unwrap());
    }
}
