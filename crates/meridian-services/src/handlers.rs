//! Packet handler registries and dispatch.
//!
//! Two scopes: the global table is shared by every connection and set up at
//! startup; each connection carries its own local table. Local handlers
//! shadow global ones. In both scopes the first registration for a packet
//! type wins and later ones are refused.
//!
//! Handlers never run under a map lock: the method is cloned out of the
//! table and the guard dropped before it is called.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, warn};

use meridian_core::packets::GenericMessage;
use meridian_core::wire::PacketType;

use crate::packet_types::InboundPacket;
use crate::session::ClientConnection;

/// A packet handler. The returned bool is advisory.
pub type PacketMethod =
    Arc<dyn Fn(&Arc<ClientConnection>, &InboundPacket) -> anyhow::Result<bool> + Send + Sync>;

/// Handler for one named GenericMessage method.
pub type GenericMethod =
    Arc<dyn Fn(&Arc<ClientConnection>, &GenericMessage) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct GlobalHandlers {
    table: Arc<DashMap<PacketType, PacketMethod>>,
}

impl GlobalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the type already has a handler.
    pub fn register(&self, packet_type: PacketType, method: PacketMethod) -> bool {
        match self.table.entry(packet_type) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(method);
                true
            }
        }
    }

    pub fn remove(&self, packet_type: PacketType) -> bool {
        self.table.remove(&packet_type).is_some()
    }

    pub fn get(&self, packet_type: PacketType) -> Option<PacketMethod> {
        self.table.get(&packet_type).map(|m| m.value().clone())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Clone)]
struct LocalEntry {
    method: PacketMethod,
    run_async: bool,
}

#[derive(Default)]
pub struct LocalHandlers {
    packets: DashMap<PacketType, LocalEntry>,
    generic: DashMap<String, GenericMethod>,
}

fn generic_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl LocalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the type already has a handler on this connection.
    pub fn register(&self, packet_type: PacketType, method: PacketMethod, run_async: bool) -> bool {
        match self.packets.entry(packet_type) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LocalEntry { method, run_async });
                true
            }
        }
    }

    pub fn remove(&self, packet_type: PacketType) -> bool {
        self.packets.remove(&packet_type).is_some()
    }

    pub fn contains(&self, packet_type: PacketType) -> bool {
        self.packets.contains_key(&packet_type)
    }

    fn get(&self, packet_type: PacketType) -> Option<LocalEntry> {
        self.packets.get(&packet_type).map(|e| e.value().clone())
    }

    /// Method names are matched trimmed and case-insensitively.
    pub fn register_generic(&self, name: &str, method: GenericMethod) -> bool {
        match self.generic.entry(generic_key(name)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(method);
                true
            }
        }
    }

    pub fn remove_generic(&self, name: &str) -> bool {
        self.generic.remove(&generic_key(name)).is_some()
    }

    /// Run the handler for a GenericMessage. Returns false if no handler is
    /// registered for its method.
    pub fn dispatch_generic(&self, conn: &Arc<ClientConnection>, message: &GenericMessage) -> bool {
        let Some(method) = self
            .generic
            .get(&generic_key(&message.method))
            .map(|m| m.value().clone())
        else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| method(conn, message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                method = %message.method,
                agent = hex::encode(conn.meta.agent_id),
                error = %e,
                "generic message handler failed"
            ),
            Err(_) => error!(
                method = %message.method,
                agent = hex::encode(conn.meta.agent_id),
                "generic message handler panicked"
            ),
        }
        true
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&self) {
        self.packets.clear();
        self.generic.clear();
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A synchronous handler ran; carries its advisory result.
    Inline(bool),
    /// An asynchronous handler was handed to the blocking pool.
    Spawned,
    /// No handler in either scope.
    Unhandled,
}

impl DispatchOutcome {
    pub fn is_handled(self) -> bool {
        !matches!(self, DispatchOutcome::Unhandled)
    }
}

fn invoke(method: &PacketMethod, conn: &Arc<ClientConnection>, packet: &InboundPacket) -> bool {
    match method(conn, packet) {
        Ok(result) => result,
        Err(e) => {
            error!(
                packet_type = ?packet.packet_type,
                agent = hex::encode(conn.meta.agent_id),
                error = %e,
                "packet handler failed"
            );
            true
        }
    }
}

fn invoke_guarded(method: &PacketMethod, conn: &Arc<ClientConnection>, packet: &InboundPacket) -> bool {
    match catch_unwind(AssertUnwindSafe(|| invoke(method, conn, packet))) {
        Ok(result) => result,
        Err(_) => {
            error!(
                packet_type = ?packet.packet_type,
                agent = hex::encode(conn.meta.agent_id),
                "packet handler panicked"
            );
            true
        }
    }
}

/// Route a packet to its handler: local table first, then global.
///
/// Asynchronous local handlers run on tokio's blocking pool and dispatch
/// returns before they finish. Outside a runtime they run inline.
pub fn dispatch(
    conn: &Arc<ClientConnection>,
    globals: &GlobalHandlers,
    packet: InboundPacket,
) -> DispatchOutcome {
    if let Some(entry) = conn.handlers.get(packet.packet_type) {
        if entry.run_async {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let conn = conn.clone();
                let packet_type = packet.packet_type;
                let job = runtime.spawn_blocking(move || invoke(&entry.method, &conn, &packet));
                runtime.spawn(async move {
                    if let Err(e) = job.await {
                        error!(packet_type = ?packet_type, error = %e, "async packet handler failed");
                    }
                });
                return DispatchOutcome::Spawned;
            }
        }
        return DispatchOutcome::Inline(invoke_guarded(&entry.method, conn, &packet));
    }

    if let Some(method) = globals.get(packet.packet_type) {
        return DispatchOutcome::Inline(invoke_guarded(&method, conn, &packet));
    }

    warn!(
        packet_type = ?packet.packet_type,
        agent = hex::encode(conn.meta.agent_id),
        "unhandled packet"
    );
    DispatchOutcome::Unhandled
}
