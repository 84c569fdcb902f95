//! Collaborators the transfer services call out to.
//!
//! Asset storage and scene permissions live outside the transport core. The
//! daemon wires concrete implementations in at startup; tests use mocks.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use meridian_core::asset::{Asset, AssetType};
use meridian_core::wire::Uuid;

/// Inventory permission bits checked before a contained item is served.
pub const PERM_TRANSFER: u32 = 1 << 13;
pub const PERM_MODIFY: u32 = 1 << 14;
pub const PERM_COPY: u32 = 1 << 15;
pub const PERM_FULL: u32 = PERM_MODIFY | PERM_COPY | PERM_TRANSFER;

/// Resolves an asset id to its bytes. At most one result per call; `None`
/// means the asset does not exist.
pub trait AssetLookup: Send + Sync {
    fn lookup(&self, id: Uuid) -> BoxFuture<'static, Option<Asset>>;
}

/// An inventory item as the scene reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub item_id: Uuid,
    pub owner_id: Uuid,
    pub asset_id: Uuid,
    pub asset_type: AssetType,
    pub current_permissions: u32,
}

impl InventoryItem {
    pub fn has_full_permissions(&self) -> bool {
        self.current_permissions & PERM_FULL == PERM_FULL
    }
}

/// Synchronous permission predicates and inventory lookups supplied by the
/// scene. A `false` is final for that request.
pub trait SceneAccess: Send + Sync {
    fn bypass_permissions(&self) -> bool;

    fn can_edit_script(&self, item_id: Uuid, task_id: Uuid, agent_id: Uuid) -> bool;

    fn can_edit_notecard(&self, item_id: Uuid, task_id: Uuid, agent_id: Uuid) -> bool;

    /// The agent owns the object and may modify its contents.
    fn can_edit_object_inventory(&self, object_id: Uuid, agent_id: Uuid) -> bool;

    fn agent_inventory_item(&self, agent_id: Uuid, item_id: Uuid) -> Option<InventoryItem>;

    fn object_inventory_item(&self, object_id: Uuid, item_id: Uuid) -> Option<InventoryItem>;
}

/// Asset store held in memory.
#[derive(Default)]
pub struct InMemoryAssets {
    assets: DashMap<Uuid, Asset>,
}

impl InMemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: Asset) -> Option<Asset> {
        self.assets.insert(asset.id, asset)
    }

    pub fn remove(&self, id: &Uuid) -> Option<Asset> {
        self.assets.remove(id).map(|(_, asset)| asset)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl AssetLookup for InMemoryAssets {
    fn lookup(&self, id: Uuid) -> BoxFuture<'static, Option<Asset>> {
        let found = self.assets.get(&id).map(|a| a.value().clone());
        futures::future::ready(found).boxed()
    }
}

/// A scene with no objects and no inventory. Contained-item requests are
/// always denied; direct asset requests are unaffected.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyScene;

impl SceneAccess for EmptyScene {
    fn bypass_permissions(&self) -> bool {
        false
    }

    fn can_edit_script(&self, _item_id: Uuid, _task_id: Uuid, _agent_id: Uuid) -> bool {
        false
    }

    fn can_edit_notecard(&self, _item_id: Uuid, _task_id: Uuid, _agent_id: Uuid) -> bool {
        false
    }

    fn can_edit_object_inventory(&self, _object_id: Uuid, _agent_id: Uuid) -> bool {
        false
    }

    fn agent_inventory_item(&self, _agent_id: Uuid, _item_id: Uuid) -> Option<InventoryItem> {
        None
    }

    fn object_inventory_item(&self, _object_id: Uuid, _item_id: Uuid) -> Option<InventoryItem> {
        None
    }
}
