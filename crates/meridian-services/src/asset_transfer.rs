//! Asset transfer: TransferRequest in, TransferInfo plus TransferPackets out.
//!
//! A request is authorized (contained items only), resolved against the
//! asset collaborator off the receive path, then chunked onto the
//! connection's throttle. Cancellation is checked once, when the lookup
//! completes. An abort that arrives after that point does not stop the
//! chunks already queued; the client is told with a TransferAbort instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meridian_core::asset::{Asset, AssetType};
use meridian_core::packets::{TransferAbort, TransferInfo, TransferPacket, TransferRequest};
use meridian_core::wire::{ThrottleCategory, Uuid, UUID_ZERO};

use crate::service::{AssetLookup, SceneAccess};
use crate::session::ClientConnection;

pub const CHANNEL_ASSET: i32 = 2;

pub const SOURCE_ASSET: i32 = 2;
pub const SOURCE_SIM_INVENTORY_ITEM: i32 = 3;

/// Transfer target: a virtual file on the client.
pub const TARGET_VFILE: i32 = 2;

/// Status codes carried by TransferInfo and TransferPacket.
pub mod status {
    pub const OK: i32 = 0;
    pub const DONE: i32 = 1;
    pub const SKIP: i32 = 2;
    pub const ABORT: i32 = 3;
    pub const ERROR: i32 = -1;
    pub const UNKNOWN_SOURCE: i32 = -2;
    pub const INSUFFICIENT_PERMISSIONS: i32 = -3;
    pub const NOT_FOUND: i32 = -4;
}

/// Transfer ids remembered per connection before old finished ones are
/// forgotten.
const MAX_TRACKED: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Resolving,
    Chunking,
    Sending,
    Completed,
    Denied,
    Unknown,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Denied
                | TransferState::Unknown
                | TransferState::Aborted
        )
    }

    /// Payload has started, or finished, going out.
    pub fn has_sent_data(self) -> bool {
        matches!(
            self,
            TransferState::Chunking | TransferState::Sending | TransferState::Completed
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer params too short: need {need} bytes, have {have}")]
    BadParams { need: usize, have: usize },

    #[error("unknown transfer source type {0}")]
    UnknownSource(i32),
}

// ── Request parameters ───────────────────────────────────────────────────────

/// Where the requested asset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Asset {
        asset_id: Uuid,
        asset_type: AssetType,
    },
    /// An item in the agent's inventory (`task_id` zero) or inside an object.
    InventoryItem {
        agent_id: Uuid,
        session_id: Uuid,
        owner_id: Uuid,
        task_id: Uuid,
        item_id: Uuid,
        asset_id: Uuid,
        asset_type: AssetType,
    },
}

fn take_uuid(buf: &mut &[u8]) -> Uuid {
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    id
}

impl TransferSource {
    pub fn parse(source_type: i32, params: &[u8]) -> Result<Self, TransferError> {
        let need = match source_type {
            SOURCE_ASSET => 20,
            SOURCE_SIM_INVENTORY_ITEM => 100,
            other => return Err(TransferError::UnknownSource(other)),
        };
        if params.len() < need {
            return Err(TransferError::BadParams {
                need,
                have: params.len(),
            });
        }

        let mut buf = params;
        if source_type == SOURCE_ASSET {
            return Ok(TransferSource::Asset {
                asset_id: take_uuid(&mut buf),
                asset_type: AssetType::from_wire(buf.get_i32_le()),
            });
        }
        Ok(TransferSource::InventoryItem {
            agent_id: take_uuid(&mut buf),
            session_id: take_uuid(&mut buf),
            owner_id: take_uuid(&mut buf),
            task_id: take_uuid(&mut buf),
            item_id: take_uuid(&mut buf),
            asset_id: take_uuid(&mut buf),
            asset_type: AssetType::from_wire(buf.get_i32_le()),
        })
    }

    pub fn source_type(&self) -> i32 {
        match self {
            TransferSource::Asset { .. } => SOURCE_ASSET,
            TransferSource::InventoryItem { .. } => SOURCE_SIM_INVENTORY_ITEM,
        }
    }

    pub fn asset_id(&self) -> Uuid {
        match self {
            TransferSource::Asset { asset_id, .. } | TransferSource::InventoryItem { asset_id, .. } => {
                *asset_id
            }
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, TransferSource::Asset { .. })
    }

    pub fn to_params(&self) -> Bytes {
        let mut out = Vec::with_capacity(100);
        match self {
            TransferSource::Asset {
                asset_id,
                asset_type,
            } => {
                out.extend_from_slice(asset_id);
                out.extend_from_slice(&asset_type.to_wire().to_le_bytes());
            }
            TransferSource::InventoryItem {
                agent_id,
                session_id,
                owner_id,
                task_id,
                item_id,
                asset_id,
                asset_type,
            } => {
                for id in [agent_id, session_id, owner_id, task_id, item_id, asset_id] {
                    out.extend_from_slice(id);
                }
                out.extend_from_slice(&asset_type.to_wire().to_le_bytes());
            }
        }
        Bytes::from(out)
    }
}

// ── Per-connection bookkeeping ───────────────────────────────────────────────

#[derive(Default)]
struct BookInner {
    cancelled: HashSet<Uuid>,
    states: HashMap<Uuid, TransferState>,
}

/// Transfer states and pending cancellations for one connection.
#[derive(Default)]
pub struct TransferBook {
    inner: Mutex<BookInner>,
}

impl TransferBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BookInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, id: Uuid) {
        let mut inner = self.lock();
        if inner.states.len() >= MAX_TRACKED {
            inner.states.retain(|_, s| !s.is_terminal());
        }
        inner.states.insert(id, TransferState::Requested);
    }

    pub fn set_state(&self, id: Uuid, state: TransferState) {
        self.lock().states.insert(id, state);
    }

    pub fn state(&self, id: &Uuid) -> Option<TransferState> {
        self.lock().states.get(id).copied()
    }

    /// Record an abort from the client. Returns the state the transfer was
    /// in. If data has already gone out the entry is dropped; otherwise the
    /// id is remembered so resolution discards it.
    pub fn record_abort(&self, id: Uuid) -> Option<TransferState> {
        let mut inner = self.lock();
        let state = inner.states.get(&id).copied();
        match state {
            Some(s) if s.has_sent_data() => {
                inner.states.remove(&id);
            }
            Some(s) if s.is_terminal() => {}
            _ => {
                if inner.cancelled.len() >= MAX_TRACKED {
                    let BookInner { cancelled, states } = &mut *inner;
                    cancelled.retain(|c| states.get(c).is_some_and(|s| !s.is_terminal()));
                }
                // A full set only takes ids that are still resolving.
                if inner.cancelled.len() < MAX_TRACKED || state.is_some() {
                    inner.cancelled.insert(id);
                }
            }
        }
        state
    }

    /// Consume a pending cancellation.
    pub fn take_cancelled(&self, id: &Uuid) -> bool {
        self.lock().cancelled.remove(id)
    }

    pub fn is_cancelled(&self, id: &Uuid) -> bool {
        self.lock().cancelled.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().states.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.cancelled.clear();
        inner.states.clear();
    }
}

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Number of TransferPackets for `len` bytes. Zero bytes means zero chunks.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 || chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

pub fn chunk_data(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..chunk_count(data.len(), chunk_size))
        .map(|i| {
            let start = i * chunk_size;
            data.slice(start..(start + chunk_size).min(data.len()))
        })
        .collect()
}

// ── Service ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AssetTransferService {
    assets: Arc<dyn AssetLookup>,
    scene: Arc<dyn SceneAccess>,
}

impl AssetTransferService {
    pub fn new(assets: Arc<dyn AssetLookup>, scene: Arc<dyn SceneAccess>) -> Self {
        Self { assets, scene }
    }

    /// Start serving a TransferRequest. Returns the task resolving it, or
    /// `None` if the request was rejected before lookup.
    pub fn handle_request(
        &self,
        conn: &Arc<ClientConnection>,
        request: TransferRequest,
    ) -> Option<JoinHandle<TransferState>> {
        let id = request.transfer_id;
        if request.channel_type != CHANNEL_ASSET {
            debug!(
                transfer = hex::encode(id),
                channel = request.channel_type,
                "ignoring transfer on unsupported channel"
            );
            return None;
        }

        let source = match TransferSource::parse(request.source_type, &request.params) {
            Ok(source) => source,
            Err(e) => {
                warn!(transfer = hex::encode(id), error = %e, "bad transfer request");
                return None;
            }
        };

        conn.transfers.begin(id);
        if let Err(reason) = self.authorize(conn, &source) {
            warn!(
                transfer = hex::encode(id),
                agent = hex::encode(conn.meta.agent_id),
                asset = hex::encode(source.asset_id()),
                reason,
                "transfer denied"
            );
            conn.transfers.set_state(id, TransferState::Denied);
            return None;
        }

        conn.transfers.set_state(id, TransferState::Resolving);
        let lookup = self.assets.lookup(source.asset_id());
        let service = self.clone();
        let conn = conn.clone();
        Some(tokio::spawn(async move {
            let asset = lookup.await;
            service.complete_resolution(&conn, &request, source.is_direct(), asset)
        }))
    }

    /// Permission checks for contained items. Direct asset requests are
    /// checked after resolution, against the resolved type.
    fn authorize(&self, conn: &ClientConnection, source: &TransferSource) -> Result<(), &'static str> {
        let TransferSource::InventoryItem {
            task_id,
            item_id,
            asset_id,
            ..
        } = source
        else {
            return Ok(());
        };
        let agent = conn.meta.agent_id;
        let bypass = self.scene.bypass_permissions();

        if *task_id == UUID_ZERO {
            let item = self
                .scene
                .agent_inventory_item(agent, *item_id)
                .ok_or("inventory item not found")?;
            let guarded = matches!(item.asset_type, AssetType::LslText | AssetType::Notecard);
            if guarded && !bypass && !item.has_full_permissions() {
                return Err("item lacks full permissions");
            }
            if item.asset_id != *asset_id {
                return Err("item does not hold requested asset");
            }
            return Ok(());
        }

        if bypass {
            return Ok(());
        }
        if !self.scene.can_edit_object_inventory(*task_id, agent) {
            return Err("cannot edit object inventory");
        }
        let item = self
            .scene
            .object_inventory_item(*task_id, *item_id)
            .ok_or("object inventory item not found")?;
        let allowed = match item.asset_type {
            AssetType::LslText => self.scene.can_edit_script(*item_id, *task_id, agent),
            AssetType::Notecard => self.scene.can_edit_notecard(*item_id, *task_id, agent),
            _ => item.owner_id == agent && item.has_full_permissions(),
        };
        if !allowed {
            return Err("insufficient item permissions");
        }
        if item.asset_id != *asset_id {
            return Err("item does not hold requested asset");
        }
        Ok(())
    }

    /// Finish a transfer once the lookup has returned.
    pub fn complete_resolution(
        &self,
        conn: &ClientConnection,
        request: &TransferRequest,
        direct: bool,
        asset: Option<Asset>,
    ) -> TransferState {
        let id = request.transfer_id;
        if conn.transfers.take_cancelled(&id) {
            debug!(transfer = hex::encode(id), "transfer aborted before resolution");
            conn.transfers.set_state(id, TransferState::Aborted);
            return TransferState::Aborted;
        }

        let Some(asset) = asset else {
            info!(transfer = hex::encode(id), "asset not found");
            send_info(conn, request, status::UNKNOWN_SOURCE, 0);
            conn.transfers.set_state(id, TransferState::Unknown);
            return TransferState::Unknown;
        };

        if direct && !asset.asset_type.is_directly_transferable() {
            warn!(
                transfer = hex::encode(id),
                asset = hex::encode(asset.id),
                asset_type = ?asset.asset_type,
                "direct request for script asset denied"
            );
            send_info(conn, request, status::INSUFFICIENT_PERMISSIONS, 0);
            conn.transfers.set_state(id, TransferState::Denied);
            return TransferState::Denied;
        }

        conn.transfers.set_state(id, TransferState::Chunking);
        let chunks = chunk_data(&asset.data, conn.transfer_config().chunk_size);
        // Info and chunks share one queue so the info is always released first.
        let category = if asset.asset_type.is_wearable() {
            ThrottleCategory::Task
        } else {
            ThrottleCategory::Asset
        };

        send_info_on(conn, request, status::OK, asset.data.len(), category);
        conn.transfers.set_state(id, TransferState::Sending);
        let last = chunks.len().saturating_sub(1);
        for (i, data) in chunks.into_iter().enumerate() {
            let packet = TransferPacket {
                transfer_id: id,
                channel_type: request.channel_type,
                packet: i as i32,
                status: if i == last { status::DONE } else { status::OK },
                data,
            };
            conn.send(&packet, category);
        }

        debug!(
            transfer = hex::encode(id),
            bytes = asset.data.len(),
            "transfer queued"
        );
        conn.transfers.set_state(id, TransferState::Completed);
        TransferState::Completed
    }

    /// Handle a client abort. Returns true if a TransferAbort was sent back.
    pub fn handle_abort(&self, conn: &ClientConnection, abort: &TransferAbort) -> bool {
        match conn.transfers.record_abort(abort.transfer_id) {
            Some(state) if state.has_sent_data() => {
                conn.send(
                    &TransferAbort {
                        transfer_id: abort.transfer_id,
                        channel_type: abort.channel_type,
                    },
                    ThrottleCategory::Asset,
                );
                true
            }
            _ => false,
        }
    }
}

fn send_info(conn: &ClientConnection, request: &TransferRequest, status: i32, size: usize) {
    send_info_on(conn, request, status, size, ThrottleCategory::Asset);
}

fn send_info_on(
    conn: &ClientConnection,
    request: &TransferRequest,
    status: i32,
    size: usize,
    category: ThrottleCategory,
) {
    let info = TransferInfo {
        transfer_id: request.transfer_id,
        channel_type: request.channel_type,
        target_type: TARGET_VFILE,
        status,
        size: i32::try_from(size).unwrap_or(i32::MAX),
        params: request.params.clone(),
    };
    conn.send(&info, category);
}
