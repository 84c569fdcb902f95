//! LayerData payloads: a group header, any number of patches, and the
//! end-of-patches marker.

use bytes::Bytes;

use super::bitpack::{BitPack, BitReader};
use super::patch::{
    compress_patch, decode_patch, decode_patch_header, decompress_patch, encode_patch,
    encode_patch_header, patch_id, PatchHeader,
};
use super::{
    GroupHeader, LayerType, TerrainData, TerrainError, END_OF_PATCHES, PATCH_AREA, PATCH_SIZE,
    STRIDE,
};

/// A patch recovered from a LayerData payload.
#[derive(Debug, Clone)]
pub struct DecodedPatch {
    pub x: u32,
    pub y: u32,
    pub header: PatchHeader,
    pub heights: [f32; PATCH_AREA],
}

fn land_layer(terrain: &TerrainData) -> LayerType {
    if terrain.is_large() {
        LayerType::LandExtended
    } else {
        LayerType::Land
    }
}

fn write_group_header(out: &mut BitPack, layer: LayerType) {
    out.pack_bits(STRIDE, 16);
    out.pack_bits(PATCH_SIZE as u32, 8);
    out.pack_bits(layer as u32, 8);
}

fn write_patch(
    out: &mut BitPack,
    terrain: &TerrainData,
    x: u32,
    y: u32,
) -> Result<(), TerrainError> {
    let large = terrain.is_large();
    let heights = terrain.patch_heights(x, y)?;
    let compressed = compress_patch(&heights, patch_id(x, y, large))?;
    encode_patch_header(out, &compressed.header, large);
    encode_patch(out, &compressed.coefficients, 0, compressed.word_bits)
}

/// Encode the given patches into a single land-layer payload.
pub fn encode_layer_data(
    terrain: &TerrainData,
    patches: &[(u32, u32)],
) -> Result<(LayerType, Bytes), TerrainError> {
    let layer = land_layer(terrain);
    let mut out = BitPack::with_capacity(1024);
    write_group_header(&mut out, layer);
    for &(x, y) in patches {
        write_patch(&mut out, terrain, x, y)?;
    }
    out.pack_bits(END_OF_PATCHES as u32, 8);
    Ok((layer, Bytes::from(out.into_bytes())))
}

/// Encode patches into as many payloads as needed to keep each at or under
/// `budget` bytes. A patch that would overflow the current payload is rolled
/// back and starts the next one. A single patch larger than the budget still
/// gets a payload of its own.
pub fn build_layer_packets(
    terrain: &TerrainData,
    patches: &[(u32, u32)],
    budget: usize,
) -> Result<(LayerType, Vec<Bytes>), TerrainError> {
    let layer = land_layer(terrain);
    let mut payloads = Vec::new();

    let mut out = BitPack::with_capacity(budget);
    write_group_header(&mut out, layer);
    let mut in_payload = 0usize;

    for &(x, y) in patches {
        let mark = out.bit_len();
        write_patch(&mut out, terrain, x, y)?;

        // wire length once the end marker is appended
        let wire_len = (out.bit_len() + 8) / 8 + 1;
        if in_payload > 0 && wire_len > budget {
            out.truncate_bits(mark);
            out.pack_bits(END_OF_PATCHES as u32, 8);
            payloads.push(Bytes::from(std::mem::take(&mut out).into_bytes()));

            write_group_header(&mut out, layer);
            write_patch(&mut out, terrain, x, y)?;
            in_payload = 0;
        }
        in_payload += 1;
    }

    if in_payload > 0 {
        out.pack_bits(END_OF_PATCHES as u32, 8);
        payloads.push(Bytes::from(out.into_bytes()));
    }
    Ok((layer, payloads))
}

/// Decode every patch in a LayerData payload. Extended layer types carry
/// 32-bit patch ids.
pub fn decode_layer_data(payload: &[u8]) -> Result<(GroupHeader, Vec<DecodedPatch>), TerrainError> {
    let mut input = BitReader::new(payload);
    let stride = input.unpack_bits(16)?;
    let patch_size = input.unpack_bits(8)?;
    let layer_type = LayerType::try_from(input.unpack_bits(8)? as u8)?;
    let group = GroupHeader {
        stride,
        patch_size,
        layer_type,
    };
    if patch_size as usize != PATCH_SIZE {
        return Err(TerrainError::UnsupportedPatchSize(patch_size));
    }

    let large = layer_type.is_extended();
    let mut patches = Vec::new();
    while let Some(header) = decode_patch_header(&mut input, large)? {
        let coefficients = decode_patch(&mut input, &header)?;
        let heights = decompress_patch(&coefficients, &header, &group)?;
        let (x, y) = header.patch_xy(large);
        patches.push(DecodedPatch {
            x,
            y,
            header,
            heights,
        });
    }
    Ok((group, patches))
}
