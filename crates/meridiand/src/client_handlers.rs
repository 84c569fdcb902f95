//! Packet handlers installed on every connection, plus the global ones.

use std::sync::{Arc, Weak};

use anyhow::Context;

use meridian_core::packets::{
    AbortXfer, AgentData, AgentThrottle, CompletePingCheck, ConfirmXferPacket, GenericMessage,
    LogoutReply, LogoutRequest, PacketBody, RequestXfer, SendXferPacket, StartPingCheck,
    TransferAbort, TransferRequest,
};
use meridian_core::wire::ThrottleCategory;
use meridian_services::{ClientConnection, GlobalHandlers, PacketMethod};

use crate::server::MeridianServer;

pub fn register_global(globals: &GlobalHandlers) {
    let ping: PacketMethod = Arc::new(|conn, packet| {
        let ping = packet.decode::<StartPingCheck>().context("malformed StartPingCheck")?;
        conn.send(&CompletePingCheck { ping_id: ping.ping_id }, ThrottleCategory::Resend);
        Ok(true)
    });
    globals.register(StartPingCheck::TYPE, ping);
}

/// Register a typed handler on `conn`. The handler sees the decoded body and
/// the server, if it is still alive.
fn local<B, F>(conn: &ClientConnection, server: &Weak<MeridianServer>, run_async: bool, handler: F)
where
    B: PacketBody + 'static,
    F: Fn(&MeridianServer, &Arc<ClientConnection>, B) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let server = server.clone();
    let method: PacketMethod = Arc::new(move |conn, packet| {
        let Some(server) = server.upgrade() else {
            return Ok(false);
        };
        let body = packet
            .decode::<B>()
            .with_context(|| format!("malformed {:?}", B::TYPE))?;
        handler(&server, conn, body)?;
        Ok(true)
    });
    conn.handlers.register(B::TYPE, method, run_async);
}

fn agent_matches(conn: &ClientConnection, agent: &AgentData) -> bool {
    if conn.verify_agent(agent) {
        return true;
    }
    tracing::debug!(
        agent = hex::encode(conn.meta.agent_id),
        claimed = hex::encode(agent.agent_id),
        "agent data mismatch, dropping packet"
    );
    false
}

pub fn register_local(conn: &ClientConnection, server: &Weak<MeridianServer>) {
    local(conn, server, true, |server, conn, request: TransferRequest| {
        server.transfers.handle_request(conn, request);
        Ok(())
    });

    local(conn, server, false, |server, conn, abort: TransferAbort| {
        server.transfers.handle_abort(conn, &abort);
        Ok(())
    });

    local(conn, server, false, |server, conn, request: RequestXfer| {
        server.xfers.request_xfer(conn, &request);
        Ok(())
    });

    local(conn, server, false, |server, conn, confirm: ConfirmXferPacket| {
        server.xfers.confirm(conn, &confirm);
        Ok(())
    });

    local(conn, server, false, |server, conn, abort: AbortXfer| {
        server.xfers.abort(conn, &abort);
        Ok(())
    });

    local(conn, server, false, |server, conn, packet: SendXferPacket| {
        if !server.xfers.receive_packet(conn, &packet) {
            tracing::debug!(xfer = packet.id, "xfer packet for unknown upload");
        }
        Ok(())
    });

    local(conn, server, false, |_, conn, throttle: AgentThrottle| {
        if !agent_matches(conn, &throttle.agent) || throttle.circuit_code != conn.meta.circuit_code {
            return Ok(());
        }
        let applied = conn.with_throttle(|t| t.set_throttles(&throttle.throttles));
        if !applied {
            tracing::debug!(len = throttle.throttles.len(), "ignoring throttle array of wrong length");
        }
        Ok(())
    });

    local(conn, server, false, |server, conn, logout: LogoutRequest| {
        if !agent_matches(conn, &logout.agent) {
            return Ok(());
        }
        conn.send_reliable(&LogoutReply { agent: logout.agent }, ThrottleCategory::Task);
        server.close_connection(&conn.meta.remote_addr, "logout");
        Ok(())
    });

    local(conn, server, false, |_, conn, message: GenericMessage| {
        if !agent_matches(conn, &message.agent) {
            return Ok(());
        }
        if !conn.handlers.dispatch_generic(conn, &message) {
            tracing::debug!(method = %message.method, "no handler for generic message");
        }
        Ok(())
    });
}
