//! meridian-core — wire format, configuration, terrain codec and asset types.
//! All other meridian crates depend on this one. Nothing in here does I/O
//! beyond reading the config file.

pub mod asset;
pub mod config;
pub mod packets;
pub mod terrain;
pub mod wire;

pub use wire::{PacketHeader, PacketType, ThrottleCategory, Uuid, WireError};
