//! Configuration system for Meridian.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERIDIAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meridian/config.toml
//!   3. ~/.config/meridian/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{ThrottleCategory, HEADER_LEN, MAX_PACKET_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub network: NetworkConfig,
    pub throttle: ThrottleConfig,
    pub transfer: TransferConfig,
    /// Circuits admitted without a login round trip.
    pub circuits: Vec<CircuitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the UDP socket binds to.
    pub bind_address: String,
    /// UDP port. 0 = OS-assigned.
    pub port: u16,
    /// Requested SO_RCVBUF in bytes. The OS may clamp it.
    pub receive_buffer_size: usize,
    /// Hand each datagram to its own task instead of handling it on the
    /// receive loop.
    pub async_packet_handling: bool,
    /// Connections silent for this long are torn down.
    pub connection_timeout_secs: u64,
    /// Send worker wake-up period while packets are waiting on tokens.
    pub send_interval_ms: u64,
}

/// Per-category drip rates and burst limits, in bytes per second and bytes.
/// A rate of 0 leaves the category limited only by the parent bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub resend_default: u32,
    pub land_default: u32,
    pub wind_default: u32,
    pub cloud_default: u32,
    pub task_default: u32,
    pub texture_default: u32,
    pub asset_default: u32,
    pub state_default: u32,
    pub avatar_info_default: u32,

    pub resend_limit: u32,
    pub land_limit: u32,
    pub wind_limit: u32,
    pub cloud_limit: u32,
    pub task_limit: u32,
    pub texture_limit: u32,
    pub asset_limit: u32,
    pub state_limit: u32,
    pub avatar_info_limit: u32,

    /// Aggregate cap across all categories in bytes per second. 0 = no cap.
    pub client_throttle_max_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per TransferPacket.
    pub chunk_size: usize,
    /// Payload bytes per SendXferPacket.
    pub xfer_chunk_size: usize,
}

/// An expected circuit. Ids are UUIDs in hex, with or without dashes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub circuit_code: u32,
    pub agent_id: String,
    pub session_id: String,
    pub secure_session_id: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for MeridianConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            throttle: ThrottleConfig::default(),
            transfer: TransferConfig::default(),
            circuits: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 9000,
            receive_buffer_size: 8 * 1024 * 1024,
            async_packet_handling: true,
            connection_timeout_secs: 60,
            send_interval_ms: 10,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            resend_default: 12500,
            land_default: 1000,
            wind_default: 1000,
            cloud_default: 1000,
            task_default: 1000,
            texture_default: 1000,
            asset_default: 1000,
            state_default: 1000,
            avatar_info_default: 1000,

            resend_limit: 18750,
            land_limit: 29750,
            wind_limit: 18750,
            cloud_limit: 18750,
            task_limit: 18750,
            texture_limit: 55750,
            asset_limit: 27500,
            state_limit: 37000,
            avatar_info_limit: 37000,

            client_throttle_max_bps: 0,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            xfer_chunk_size: 1000,
        }
    }
}

impl ThrottleConfig {
    /// Default drip rate for a category.
    pub fn rate(&self, category: ThrottleCategory) -> u32 {
        match category {
            ThrottleCategory::Resend => self.resend_default,
            ThrottleCategory::Land => self.land_default,
            ThrottleCategory::Wind => self.wind_default,
            ThrottleCategory::Cloud => self.cloud_default,
            ThrottleCategory::Task => self.task_default,
            ThrottleCategory::Texture => self.texture_default,
            ThrottleCategory::Asset => self.asset_default,
            ThrottleCategory::State => self.state_default,
            ThrottleCategory::AvatarInfo => self.avatar_info_default,
        }
    }

    /// Burst limit for a category.
    pub fn limit(&self, category: ThrottleCategory) -> u32 {
        match category {
            ThrottleCategory::Resend => self.resend_limit,
            ThrottleCategory::Land => self.land_limit,
            ThrottleCategory::Wind => self.wind_limit,
            ThrottleCategory::Cloud => self.cloud_limit,
            ThrottleCategory::Task => self.task_limit,
            ThrottleCategory::Texture => self.texture_limit,
            ThrottleCategory::Asset => self.asset_limit,
            ThrottleCategory::State => self.state_limit,
            ThrottleCategory::AvatarInfo => self.avatar_info_limit,
        }
    }

    /// Sum of all category default rates.
    pub fn total(&self) -> u32 {
        ThrottleCategory::ALL
            .iter()
            .map(|c| self.rate(*c))
            .fold(0u32, u32::saturating_add)
    }
}

/// TransferPacket body bytes besides the data: id, channel, packet number,
/// status and the var16 length.
const TRANSFER_PACKET_OVERHEAD: usize = 16 + 4 + 4 + 4 + 2;
/// SendXferPacket body bytes besides the data, plus the length prefix the
/// first packet carries.
const XFER_PACKET_OVERHEAD: usize = 8 + 4 + 2 + 4;

/// Largest `chunk_size` whose TransferPacket still fits one datagram.
pub const MAX_CHUNK_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN - TRANSFER_PACKET_OVERHEAD;
/// Largest `xfer_chunk_size` whose SendXferPacket still fits one datagram.
pub const MAX_XFER_CHUNK_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN - XFER_PACKET_OVERHEAD;

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_chunk("transfer.chunk_size", self.chunk_size, MAX_CHUNK_SIZE)?;
        check_chunk("transfer.xfer_chunk_size", self.xfer_chunk_size, MAX_XFER_CHUNK_SIZE)
    }
}

fn check_chunk(field: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meridian")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("{field} = {value} is outside 1..={max}")]
    OutOfRange {
        field: &'static str,
        value: usize,
        max: usize,
    },
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl MeridianConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeridianConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeridianConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MERIDIAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__ASYNC_PACKET_HANDLING") {
            self.network.async_packet_handling = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MERIDIAN_THROTTLE__CLIENT_THROTTLE_MAX_BPS") {
            if let Ok(bps) = v.parse() {
                self.throttle.client_throttle_max_bps = bps;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_throttle_rates() {
        let t = ThrottleConfig::default();
        assert_eq!(t.rate(ThrottleCategory::Resend), 12500);
        assert_eq!(t.rate(ThrottleCategory::Texture), 1000);
        assert_eq!(t.limit(ThrottleCategory::Texture), 55750);
        assert_eq!(t.limit(ThrottleCategory::AvatarInfo), 37000);
        assert_eq!(t.total(), 12500 + 8 * 1000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let text = r#"
            [network]
            port = 13000

            [throttle]
            texture_default = 40000
        "#;
        let config: MeridianConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.port, 13000);
        assert!(config.network.async_packet_handling);
        assert_eq!(config.throttle.rate(ThrottleCategory::Texture), 40000);
        assert_eq!(config.throttle.rate(ThrottleCategory::Land), 1000);
        assert_eq!(config.transfer.chunk_size, 1000);
    }

    #[test]
    fn circuits_parse_as_table_array() {
        let text = r#"
            [[circuits]]
            circuit_code = 700
            agent_id = "11111111-1111-1111-1111-111111111111"
            session_id = "22222222222222222222222222222222"
        "#;
        let config: MeridianConfig = toml::from_str(text).unwrap();
        assert_eq!(config.circuits.len(), 1);
        assert_eq!(config.circuits[0].circuit_code, 700);
        assert!(config.circuits[0].secure_session_id.is_empty());
        assert_eq!(config.network.port, 9000);
    }

    #[test]
    fn chunk_sizes_must_fit_a_datagram() {
        assert!(MeridianConfig::default().validate().is_ok());

        let zero: MeridianConfig = toml::from_str("[transfer]\nchunk_size = 0\n").unwrap();
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::OutOfRange { field: "transfer.chunk_size", value: 0, .. })
        ));

        let mut config = MeridianConfig::default();
        config.transfer.chunk_size = MAX_CHUNK_SIZE;
        config.transfer.xfer_chunk_size = MAX_XFER_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        config.transfer.chunk_size = 70_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { max: MAX_CHUNK_SIZE, .. })
        ));

        config.transfer.chunk_size = 1000;
        config.transfer.xfer_chunk_size = MAX_XFER_CHUNK_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "transfer.xfer_chunk_size", .. })
        ));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("meridian-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        std::env::set_var("MERIDIAN_CONFIG", config_path.to_str().unwrap());

        let path = MeridianConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeridianConfig::load().expect("load should succeed");
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.throttle.resend_limit, 18750);

        std::env::remove_var("MERIDIAN_CONFIG");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
