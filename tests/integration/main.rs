//! Meridian integration test harness.
//!
//! Drives the services crate through its public surface: real connections,
//! real throttles, mocked asset store and scene. Everything runs in-process.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};

use meridian_core::asset::Asset;
use meridian_core::config::{ThrottleConfig, TransferConfig};
use meridian_core::wire::Uuid;
use meridian_services::{
    AssetLookup, ClientConnection, ConnectionMeta, InventoryItem, OutgoingPacket, SceneAccess,
};

mod dispatch;
mod terrain;
mod throttle;
mod transfers;
mod xfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const AGENT: Uuid = [0x11; 16];
pub const SESSION: Uuid = [0x22; 16];

pub fn connection_with(throttle: &ThrottleConfig, transfer: TransferConfig) -> Arc<ClientConnection> {
    let meta = ConnectionMeta {
        agent_id: AGENT,
        session_id: SESSION,
        secure_session_id: [0x33; 16],
        circuit_code: 500,
        remote_addr: SocketAddr::from(([127, 0, 0, 1], 50_000)),
        established_at: Instant::now(),
    };
    Arc::new(ClientConnection::new(meta, throttle, transfer))
}

pub fn connection() -> Arc<ClientConnection> {
    connection_with(&ThrottleConfig::default(), TransferConfig::default())
}

/// Everything queued on the connection, in category order.
pub fn sent(conn: &ClientConnection) -> Vec<OutgoingPacket> {
    conn.drain_all()
}

// ── Mock asset store ──────────────────────────────────────────────────────────

/// Asset store whose lookups can be held open until the test releases them.
#[derive(Default)]
pub struct MockAssets {
    assets: Mutex<HashMap<Uuid, Asset>>,
    gated: Mutex<bool>,
    waiting: Mutex<Vec<oneshot::Sender<()>>>,
    pub lookup_started: Arc<Notify>,
}

impl MockAssets {
    pub fn with(assets: impl IntoIterator<Item = Asset>) -> Arc<Self> {
        let mock = Self::default();
        {
            let mut map = mock.assets.lock().unwrap();
            for asset in assets {
                map.insert(asset.id, asset);
            }
        }
        Arc::new(mock)
    }

    /// Hold every subsequent lookup until `release` is called.
    pub fn gate(&self) {
        *self.gated.lock().unwrap() = true;
    }

    pub fn release(&self) {
        *self.gated.lock().unwrap() = false;
        for tx in self.waiting.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl AssetLookup for MockAssets {
    fn lookup(&self, id: Uuid) -> BoxFuture<'static, Option<Asset>> {
        let asset = self.assets.lock().unwrap().get(&id).cloned();
        let gate = if *self.gated.lock().unwrap() {
            let (tx, rx) = oneshot::channel();
            self.waiting.lock().unwrap().push(tx);
            Some(rx)
        } else {
            None
        };
        self.lookup_started.notify_one();
        async move {
            if let Some(rx) = gate {
                let _ = rx.await;
            }
            asset
        }
        .boxed()
    }
}

// ── Mock scene ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockScene {
    pub bypass: bool,
    pub can_edit_scripts: bool,
    pub can_edit_notecards: bool,
    pub owns_objects: bool,
    pub agent_items: HashMap<Uuid, InventoryItem>,
    pub object_items: HashMap<Uuid, InventoryItem>,
}

impl SceneAccess for MockScene {
    fn bypass_permissions(&self) -> bool {
        self.bypass
    }

    fn can_edit_script(&self, _item_id: Uuid, _task_id: Uuid, _agent_id: Uuid) -> bool {
        self.can_edit_scripts
    }

    fn can_edit_notecard(&self, _item_id: Uuid, _task_id: Uuid, _agent_id: Uuid) -> bool {
        self.can_edit_notecards
    }

    fn can_edit_object_inventory(&self, _object_id: Uuid, _agent_id: Uuid) -> bool {
        self.owns_objects
    }

    fn agent_inventory_item(&self, _agent_id: Uuid, item_id: Uuid) -> Option<InventoryItem> {
        self.agent_items.get(&item_id).cloned()
    }

    fn object_inventory_item(&self, _object_id: Uuid, item_id: Uuid) -> Option<InventoryItem> {
        self.object_items.get(&item_id).cloned()
    }
}
