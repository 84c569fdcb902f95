//! meridian-services — per-connection state and the services that act on it:
//! outbound throttling, packet handler registries, asset and xfer transfers.

pub mod asset_transfer;
pub mod buffer_pool;
pub mod handlers;
pub mod packet_types;
pub mod qos;
pub mod service;
pub mod session;
pub mod xfer;

pub use asset_transfer::{AssetTransferService, TransferBook, TransferError, TransferSource, TransferState};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use handlers::{dispatch, DispatchOutcome, GenericMethod, GlobalHandlers, LocalHandlers, PacketMethod};
pub use packet_types::{InboundPacket, OutgoingPacket};
pub use qos::{OutboundThrottle, TokenBucket};
pub use service::{AssetLookup, EmptyScene, InMemoryAssets, InventoryItem, SceneAccess};
pub use session::{ClientConnection, ConnectionHooks, ConnectionMeta, ConnectionTable};
pub use xfer::{XferBook, XferService};
