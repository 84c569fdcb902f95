//! Asset types served over the transfer channel, plus the landmark text
//! format.

use bytes::Bytes;

use crate::wire::{format_uuid, parse_uuid, Uuid};

/// Asset type codes as they appear in transfer params and inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetType {
    Texture,
    Sound,
    CallingCard,
    Landmark,
    Clothing,
    Object,
    Notecard,
    LslText,
    LslBytecode,
    TextureTga,
    Bodypart,
    Animation,
    Gesture,
    Mesh,
    Unknown(i8),
}

impl From<i8> for AssetType {
    fn from(code: i8) -> Self {
        match code {
            0 => AssetType::Texture,
            1 => AssetType::Sound,
            2 => AssetType::CallingCard,
            3 => AssetType::Landmark,
            5 => AssetType::Clothing,
            6 => AssetType::Object,
            7 => AssetType::Notecard,
            10 => AssetType::LslText,
            11 => AssetType::LslBytecode,
            12 => AssetType::TextureTga,
            13 => AssetType::Bodypart,
            20 => AssetType::Animation,
            21 => AssetType::Gesture,
            49 => AssetType::Mesh,
            other => AssetType::Unknown(other),
        }
    }
}

impl From<AssetType> for i8 {
    fn from(t: AssetType) -> i8 {
        match t {
            AssetType::Texture => 0,
            AssetType::Sound => 1,
            AssetType::CallingCard => 2,
            AssetType::Landmark => 3,
            AssetType::Clothing => 5,
            AssetType::Object => 6,
            AssetType::Notecard => 7,
            AssetType::LslText => 10,
            AssetType::LslBytecode => 11,
            AssetType::TextureTga => 12,
            AssetType::Bodypart => 13,
            AssetType::Animation => 20,
            AssetType::Gesture => 21,
            AssetType::Mesh => 49,
            AssetType::Unknown(code) => code,
        }
    }
}

impl AssetType {
    /// Transfer params carry the type as an i32.
    pub fn from_wire(code: i32) -> Self {
        i8::try_from(code).map(AssetType::from).unwrap_or(AssetType::Unknown(-1))
    }

    pub fn to_wire(self) -> i32 {
        i8::from(self) as i32
    }

    /// Script source and bytecode may only be fetched through an inventory
    /// item the requester is allowed to edit.
    pub fn is_directly_transferable(self) -> bool {
        !matches!(self, AssetType::LslText | AssetType::LslBytecode)
    }

    /// Body parts and clothing are needed before the avatar can render.
    pub fn is_wearable(self) -> bool {
        matches!(self, AssetType::Bodypart | AssetType::Clothing)
    }
}

/// A resolved asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: Uuid,
    pub asset_type: AssetType,
    pub data: Bytes,
}

impl Asset {
    pub fn new(id: Uuid, asset_type: AssetType, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            asset_type,
            data: data.into(),
        }
    }
}

// ── Landmarks ────────────────────────────────────────────────────────────────

/// A saved location: region plus position inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    pub version: u32,
    pub region_id: Uuid,
    pub position: [f32; 3],
    pub region_handle: u64,
}

impl Landmark {
    /// Parse landmark text. `None` means the asset could not be fetched.
    /// `region_handle` is optional and defaults to 0.
    ///
    /// ```text
    /// Landmark version 2
    /// region_id 5f3c...
    /// local_pos 128 64 22.5
    /// region_handle 1099511628032000
    /// ```
    pub fn decode(data: Option<&[u8]>) -> Result<Self, AssetError> {
        let data = data.ok_or_else(|| AssetError::malformed("asset not available"))?;
        let text = std::str::from_utf8(data).map_err(|_| AssetError::malformed("not utf-8"))?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let version = lines
            .next()
            .and_then(|l| l.strip_prefix("Landmark version"))
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| AssetError::malformed("missing version line"))?;

        let mut region_id = None;
        let mut position = None;
        let mut region_handle = None;
        for line in lines {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "region_id" => region_id = parse_uuid(value),
                "local_pos" => position = parse_vector(value),
                "region_handle" => region_handle = value.trim().parse::<u64>().ok(),
                _ => {}
            }
        }

        Ok(Self {
            version,
            region_id: region_id.ok_or_else(|| AssetError::malformed("bad region_id"))?,
            position: position.ok_or_else(|| AssetError::malformed("bad local_pos"))?,
            region_handle: region_handle.unwrap_or(0),
        })
    }

    pub fn encode(&self) -> Bytes {
        let [x, y, z] = self.position;
        Bytes::from(format!(
            "Landmark version {}\nregion_id {}\nlocal_pos {} {} {}\nregion_handle {}\n",
            self.version,
            format_uuid(&self.region_id),
            x,
            y,
            z,
            self.region_handle
        ))
    }
}

fn parse_vector(text: &str) -> Option<[f32; 3]> {
    let mut parts = text.split_whitespace().map(|p| p.parse::<f32>());
    let v = [parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?];
    Some(v)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("malformed asset: {0}")]
    MalformedAsset(String),
}

impl AssetError {
    fn malformed(reason: &str) -> Self {
        AssetError::MalformedAsset(reason.to_string())
    }
}
