//! Terrain patch codec: 16×16 height tiles are DCT-transformed, quantized and
//! entropy-coded into a bit stream carried by LayerData packets.
//!
//! Output must be bit-identical to what existing viewers decode. The float
//! formulas, table construction and loop orders in this module are part of
//! the wire format; do not "simplify" them.

mod bitpack;
mod layer;
mod patch;
mod tables;

pub use bitpack::{BitPack, BitReader};
pub use layer::{build_layer_packets, decode_layer_data, encode_layer_data, DecodedPatch};
pub use patch::{
    compress_patch, decode_patch, decode_patch_header, decompress_patch, encode_patch,
    encode_patch_header, patch_id, prescan, CompressedPatch, PatchHeader,
};

/// Side length of one patch in cells.
pub const PATCH_SIZE: usize = 16;

/// Cells per patch.
pub const PATCH_AREA: usize = PATCH_SIZE * PATCH_SIZE;

/// Side length of a standard region. Larger regions use 32-bit patch ids.
pub const DEFAULT_REGION_SIZE: u32 = 256;

/// Group header stride field. Fixed by the format.
pub const STRIDE: u32 = 264;

/// Pre-quantization bit count used by the encoder.
pub const PREQUANT: u32 = 10;

/// Patch header byte that terminates a LayerData payload.
pub const END_OF_PATCHES: u8 = 97;

/// Layer type tag carried in the group header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LayerType {
    Land = 0x4C,
    LandExtended = 0x4D,
    Water = 0x57,
    WaterExtended = 0x58,
    Wind = 0x37,
    WindExtended = 0x39,
    Cloud = 0x38,
    CloudExtended = 0x3A,
}

impl LayerType {
    /// Extended layers belong to large regions and carry 32-bit patch ids.
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            LayerType::LandExtended
                | LayerType::WaterExtended
                | LayerType::WindExtended
                | LayerType::CloudExtended
        )
    }
}

impl TryFrom<u8> for LayerType {
    type Error = TerrainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x4C => Ok(LayerType::Land),
            0x4D => Ok(LayerType::LandExtended),
            0x57 => Ok(LayerType::Water),
            0x58 => Ok(LayerType::WaterExtended),
            0x37 => Ok(LayerType::Wind),
            0x39 => Ok(LayerType::WindExtended),
            0x38 => Ok(LayerType::Cloud),
            0x3A => Ok(LayerType::CloudExtended),
            other => Err(TerrainError::UnknownLayerType(other)),
        }
    }
}

/// Header at the start of every LayerData payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHeader {
    pub stride: u32,
    pub patch_size: u32,
    pub layer_type: LayerType,
}

// ── Terrain Data ─────────────────────────────────────────────────────────────

/// Height field of a region, row-major, `heights[y * size_x + x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerrainData {
    size_x: u32,
    size_y: u32,
    heights: Vec<f32>,
}

impl TerrainData {
    /// Flat terrain. Both sides must be non-zero multiples of PATCH_SIZE.
    pub fn flat(size_x: u32, size_y: u32, height: f32) -> Result<Self, TerrainError> {
        check_size(size_x, size_y)?;
        Ok(Self {
            size_x,
            size_y,
            heights: vec![height; (size_x * size_y) as usize],
        })
    }

    pub fn from_heights(size_x: u32, size_y: u32, heights: Vec<f32>) -> Result<Self, TerrainError> {
        check_size(size_x, size_y)?;
        if heights.len() != (size_x * size_y) as usize {
            return Err(TerrainError::HeightCount {
                expected: (size_x * size_y) as usize,
                actual: heights.len(),
            });
        }
        Ok(Self {
            size_x,
            size_y,
            heights,
        })
    }

    pub fn size_x(&self) -> u32 {
        self.size_x
    }

    pub fn size_y(&self) -> u32 {
        self.size_y
    }

    pub fn is_large(&self) -> bool {
        self.size_x > DEFAULT_REGION_SIZE || self.size_y > DEFAULT_REGION_SIZE
    }

    pub fn patches_x(&self) -> u32 {
        self.size_x / PATCH_SIZE as u32
    }

    pub fn patches_y(&self) -> u32 {
        self.size_y / PATCH_SIZE as u32
    }

    /// Every patch coordinate, row by row.
    pub fn all_patches(&self) -> Vec<(u32, u32)> {
        (0..self.patches_y())
            .flat_map(|y| (0..self.patches_x()).map(move |x| (x, y)))
            .collect()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.heights[(y * self.size_x + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, height: f32) {
        self.heights[(y * self.size_x + x) as usize] = height;
    }

    /// Heights of one patch, `out[j * 16 + i]` for cell (i, j).
    pub fn patch_heights(&self, px: u32, py: u32) -> Result<[f32; PATCH_AREA], TerrainError> {
        if px >= self.patches_x() || py >= self.patches_y() {
            return Err(TerrainError::PatchOutOfRange { x: px, y: py });
        }
        let mut out = [0f32; PATCH_AREA];
        let base_x = px * PATCH_SIZE as u32;
        let base_y = py * PATCH_SIZE as u32;
        for j in 0..PATCH_SIZE {
            for i in 0..PATCH_SIZE {
                out[j * PATCH_SIZE + i] = self.get(base_x + i as u32, base_y + j as u32);
            }
        }
        Ok(out)
    }
}

fn check_size(size_x: u32, size_y: u32) -> Result<(), TerrainError> {
    let p = PATCH_SIZE as u32;
    if size_x == 0 || size_y == 0 || size_x % p != 0 || size_y % p != 0 {
        return Err(TerrainError::InvalidRegionSize(size_x, size_y));
    }
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerrainError {
    #[error("region size {0}x{1} is not a multiple of the patch size")]
    InvalidRegionSize(u32, u32),

    #[error("expected {expected} heights, got {actual}")]
    HeightCount { expected: usize, actual: usize },

    #[error("patch ({x}, {y}) is outside the region")]
    PatchOutOfRange { x: u32, y: u32 },

    #[error("postquant {0} is outside 0..=256")]
    InvalidPostquant(usize),

    #[error("patch height range {0} does not fit 16 bits")]
    RangeOverflow(i32),

    #[error("patch size {0} is not supported")]
    UnsupportedPatchSize(u32),

    #[error("unknown layer type 0x{0:02x}")]
    UnknownLayerType(u8),

    #[error("bit stream ended early")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_size_must_be_patch_aligned() {
        assert!(TerrainData::flat(256, 256, 0.0).is_ok());
        assert_eq!(
            TerrainData::flat(250, 256, 0.0).unwrap_err(),
            TerrainError::InvalidRegionSize(250, 256)
        );
    }

    #[test]
    fn patch_heights_are_row_major() {
        let mut t = TerrainData::flat(32, 32, 0.0).unwrap();
        t.set(17, 3, 5.0);
        let p = t.patch_heights(1, 0).unwrap();
        assert_eq!(p[3 * 16 + 1], 5.0);
        assert!(t.patch_heights(2, 0).is_err());
        assert_eq!(t.all_patches(), vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn extended_layers() {
        assert!(LayerType::LandExtended.is_extended());
        assert!(!LayerType::Land.is_extended());
        assert_eq!(LayerType::try_from(0x4C).unwrap(), LayerType::Land);
        assert!(LayerType::try_from(0x00).is_err());
    }
}
