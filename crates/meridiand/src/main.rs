//! meridiand — region UDP client stack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use meridian_core::config::MeridianConfig;
use meridian_services::{ClientConnection, ConnectionHooks, EmptyScene, InMemoryAssets};

mod circuit;
mod client_handlers;
mod send_worker;
mod server;
mod transport;

use send_worker::SendWorker;
use server::MeridianServer;
use transport::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeridianConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeridianConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeridianConfig::default()
    });

    // Bind
    let transport = Arc::new(UdpTransport::start(&config.network).context("failed to start transport")?);
    tracing::info!(
        addr = %transport.local_addr()?,
        async_packet_handling = config.network.async_packet_handling,
        "meridiand starting"
    );

    let send_interval = Duration::from_millis(config.network.send_interval_ms.max(1));

    // Shared state
    let assets = Arc::new(InMemoryAssets::new());
    let hooks = ConnectionHooks {
        on_established: Some(Arc::new(|conn: &Arc<ClientConnection>| {
            tracing::info!(agent = hex::encode(conn.agent_id()), "agent entered region");
        })),
        on_closed: Some(Arc::new(|conn: &Arc<ClientConnection>| {
            tracing::info!(agent = hex::encode(conn.agent_id()), "agent left region");
        })),
    };
    let server = MeridianServer::new(config, assets, Arc::new(EmptyScene), hooks);
    tracing::info!(count = server.circuits.len(), "expected circuits from config");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            // Kicked connections are flushed by the send worker on its way out.
            let kicked = server.kick_all("region shutting down");
            tracing::info!(kicked, "agents kicked");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receive_task = tokio::spawn(transport.clone().run(server.clone(), shutdown_tx.subscribe()));

    let send_worker_task = tokio::spawn(
        SendWorker::new(
            transport,
            server.connections.clone(),
            server.outbound_ready(),
            send_interval,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let expiry_task = tokio::spawn(server.clone().expiry_loop(shutdown_tx.subscribe()));

    let connection_printer = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(count = server.connections.len(), "connection table snapshot");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = receive_task         => tracing::error!("receive task exited: {:?}", r),
        r = send_worker_task     => tracing::error!("send worker exited: {:?}", r),
        r = expiry_task          => tracing::error!("expiry task exited: {:?}", r),
        r = connection_printer   => tracing::error!("connection printer exited: {:?}", r),
    }

    Ok(())
}
