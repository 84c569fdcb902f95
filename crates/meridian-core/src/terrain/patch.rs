//! Single-patch transform, quantization and entropy coding.

use super::bitpack::{BitPack, BitReader};
use super::tables::{tables, OO_SQRT2};
use super::{GroupHeader, TerrainError, END_OF_PATCHES, PATCH_AREA, PATCH_SIZE, PREQUANT};

const ZERO_CODE: u32 = 0x0;
const ZERO_EOB: u32 = 0x2;
const POSITIVE_VALUE: u32 = 0x6;
const NEGATIVE_VALUE: u32 = 0x7;

const MIN_WORD_BITS: u32 = 3;
const MAX_WORD_BITS: u32 = 17;

/// Per-patch header preceding the coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchHeader {
    /// Smallest height in the patch.
    pub dc_offset: f32,
    /// `max - min + 1`, truncated.
    pub range: i32,
    /// High nibble: prequant - 2. Low nibble: word bits - 2.
    pub quant_wbits: u8,
    pub patch_ids: u32,
}

impl PatchHeader {
    pub fn word_bits(&self) -> u32 {
        (self.quant_wbits & 0x0f) as u32 + 2
    }

    pub fn prequant(&self) -> u32 {
        (self.quant_wbits >> 4) as u32 + 2
    }

    /// Patch coordinates encoded in `patch_ids`.
    pub fn patch_xy(&self, large_region: bool) -> (u32, u32) {
        if large_region {
            (self.patch_ids >> 16, self.patch_ids & 0xFFFF)
        } else {
            (self.patch_ids >> 5, self.patch_ids & 0x1F)
        }
    }
}

pub fn patch_id(x: u32, y: u32, large_region: bool) -> u32 {
    if large_region {
        (x << 16) | (y & 0xFFFF)
    } else {
        (x << 5) | (y & 0x1F)
    }
}

/// Quantized coefficients of one patch in zig-zag order.
#[derive(Debug, Clone)]
pub struct CompressedPatch {
    pub header: PatchHeader,
    pub coefficients: [i32; PATCH_AREA],
    pub word_bits: u32,
}

/// Range statistics of a patch. `quant_wbits` is left zero.
pub fn prescan(heights: &[f32; PATCH_AREA]) -> PatchHeader {
    let mut zmax = -99_999_999.0f32;
    let mut zmin = 99_999_999.0f32;
    for &h in heights.iter() {
        if h > zmax {
            zmax = h;
        }
        if h < zmin {
            zmin = h;
        }
    }
    PatchHeader {
        dc_offset: zmin,
        range: ((zmax - zmin) + 1.0) as i32,
        quant_wbits: 0,
        patch_ids: 0,
    }
}

/// Transform and quantize one patch. Word bits grow until every coefficient
/// fits without truncation, capped at 17. Fails when the height range does
/// not fit the header's 16-bit field.
pub fn compress_patch(
    heights: &[f32; PATCH_AREA],
    patch_ids: u32,
) -> Result<CompressedPatch, TerrainError> {
    let mut header = prescan(heights);
    header.patch_ids = patch_ids;
    if !(1..=i32::from(u16::MAX)).contains(&header.range) {
        tracing::error!(range = header.range, "patch height range does not fit 16 bits, patch not encoded");
        return Err(TerrainError::RangeOverflow(header.range));
    }

    let oozrange = 1.0f32 / header.range as f32;
    let range = (1u32 << PREQUANT) as f32;
    let premult = oozrange * range;
    let sub = (1u32 << (PREQUANT - 1)) as f32 + header.dc_offset * premult;

    let mut block = [0f32; PATCH_AREA];
    for (out, &h) in block.iter_mut().zip(heights.iter()) {
        *out = h * premult - sub;
    }

    let mut ftemp = [0f32; PATCH_AREA];
    for line in 0..PATCH_SIZE {
        dct_line(&block, &mut ftemp, line);
    }

    let mut coefficients = [0i32; PATCH_AREA];
    let mut wbits = PREQUANT >> 1;
    for column in 0..PATCH_SIZE {
        wbits = dct_column(&ftemp, &mut coefficients, column, wbits);
    }
    let wbits = wbits.clamp(MIN_WORD_BITS, MAX_WORD_BITS);

    header.quant_wbits = (((PREQUANT - 2) << 4) | (wbits - 2)) as u8;
    Ok(CompressedPatch {
        header,
        coefficients,
        word_bits: wbits,
    })
}

fn dct_line(input: &[f32; PATCH_AREA], output: &mut [f32; PATCH_AREA], line: usize) {
    let cos = &tables().cosines;
    let row = line * PATCH_SIZE;

    let mut total = 0.0f32;
    for n in 0..PATCH_SIZE {
        total += input[row + n];
    }
    output[row] = OO_SQRT2 * total;

    for u in 1..PATCH_SIZE {
        let mut total = 0.0f32;
        for n in 0..PATCH_SIZE {
            total += input[row + n] * cos[u * PATCH_SIZE + n];
        }
        output[row + u] = total;
    }
}

fn dct_column(
    input: &[f32; PATCH_AREA],
    output: &mut [i32; PATCH_AREA],
    column: usize,
    mut wbits: u32,
) -> u32 {
    let t = tables();

    let mut total = 0.0f32;
    for n in 0..PATCH_SIZE {
        total += input[PATCH_SIZE * n + column];
    }
    let value = (OO_SQRT2 * total * t.quantize[column]) as i32;
    output[t.copy_matrix[column]] = value;
    wbits = grow_word_bits(wbits, value);

    for u in 1..PATCH_SIZE {
        let mut total = 0.0f32;
        for n in 0..PATCH_SIZE {
            total += input[PATCH_SIZE * n + column] * t.cosines[u * PATCH_SIZE + n];
        }
        let value = (total * t.quantize[u * PATCH_SIZE + column]) as i32;
        output[t.copy_matrix[u * PATCH_SIZE + column]] = value;
        wbits = grow_word_bits(wbits, value);
    }
    wbits
}

fn grow_word_bits(mut wbits: u32, value: i32) -> u32 {
    let magnitude = value.unsigned_abs();
    while wbits < MAX_WORD_BITS && magnitude > (1u32 << wbits) - 1 {
        wbits += 1;
    }
    wbits
}

// ── Bit stream ───────────────────────────────────────────────────────────────

pub fn encode_patch_header(out: &mut BitPack, header: &PatchHeader, large_region: bool) {
    out.pack_bits(header.quant_wbits as u32, 8);
    out.pack_float(header.dc_offset);
    out.pack_bits(header.range as u32, 16);
    out.pack_bits(header.patch_ids, if large_region { 32 } else { 10 });
}

/// Entropy-code quantized coefficients. The last `postquant` positions are
/// treated as zero; a run of zeros reaching the end becomes one EOB code.
pub fn encode_patch(
    out: &mut BitPack,
    coefficients: &[i32; PATCH_AREA],
    postquant: usize,
    wbits: u32,
) -> Result<(), TerrainError> {
    if postquant > PATCH_AREA {
        tracing::error!(postquant, "postquant outside the patch, patch not encoded");
        return Err(TerrainError::InvalidPostquant(postquant));
    }
    let mut patch = *coefficients;
    if postquant != 0 {
        patch[PATCH_AREA - postquant] = 0;
    }

    let wbits = wbits.clamp(MIN_WORD_BITS, MAX_WORD_BITS);
    let max_value = (1u32 << wbits) - 1;
    let last_nonzero = patch[..PATCH_AREA - postquant]
        .iter()
        .rposition(|c| *c != 0);

    for (i, &coefficient) in patch.iter().enumerate() {
        if coefficient == 0 {
            let eob = last_nonzero.map_or(true, |last| i > last);
            if eob {
                out.pack_bits(ZERO_EOB, 2);
                return Ok(());
            }
            out.pack_bits(ZERO_CODE, 1);
        } else {
            if coefficient < 0 {
                out.pack_bits(NEGATIVE_VALUE, 3);
            } else {
                out.pack_bits(POSITIVE_VALUE, 3);
            }
            out.pack_bits(coefficient.unsigned_abs().min(max_value), wbits);
        }
    }
    Ok(())
}

/// Read the next patch header. `None` marks the end of the payload.
pub fn decode_patch_header(
    input: &mut BitReader<'_>,
    large_region: bool,
) -> Result<Option<PatchHeader>, TerrainError> {
    let quant_wbits = input.unpack_bits(8)? as u8;
    if quant_wbits == END_OF_PATCHES {
        return Ok(None);
    }
    let dc_offset = input.unpack_float()?;
    let range = input.unpack_bits(16)? as i32;
    let patch_ids = input.unpack_bits(if large_region { 32 } else { 10 })?;
    Ok(Some(PatchHeader {
        dc_offset,
        range,
        quant_wbits,
        patch_ids,
    }))
}

/// Read one patch worth of coefficients in zig-zag order.
pub fn decode_patch(
    input: &mut BitReader<'_>,
    header: &PatchHeader,
) -> Result<[i32; PATCH_AREA], TerrainError> {
    let word_bits = header.word_bits();
    let mut patch = [0i32; PATCH_AREA];
    for slot in patch.iter_mut() {
        if !input.read_bit()? {
            continue;
        }
        if !input.read_bit()? {
            // end of block, the rest are already zero
            break;
        }
        let negative = input.read_bit()?;
        let magnitude = input.unpack_bits(word_bits)? as i32;
        *slot = if negative { -magnitude } else { magnitude };
    }
    Ok(patch)
}

/// Dequantize and inverse-transform a patch back to heights,
/// `out[j * 16 + i]` for cell (i, j).
pub fn decompress_patch(
    coefficients: &[i32; PATCH_AREA],
    header: &PatchHeader,
    group: &GroupHeader,
) -> Result<[f32; PATCH_AREA], TerrainError> {
    if group.patch_size as usize != PATCH_SIZE {
        tracing::error!(patch_size = group.patch_size, "unsupported patch size");
        return Err(TerrainError::UnsupportedPatchSize(group.patch_size));
    }
    let t = tables();

    let prequant = header.prequant();
    let quantize = 1u32 << prequant;
    let ooq = 1.0f32 / quantize as f32;
    let mult = ooq * header.range as f32;
    let addval = mult * (1u32 << (prequant - 1)) as f32 + header.dc_offset;

    let mut block = [0f32; PATCH_AREA];
    for n in 0..PATCH_AREA {
        block[n] = coefficients[t.copy_matrix[n]] as f32 * t.dequantize[n];
    }

    let mut ftemp = [0f32; PATCH_AREA];
    for column in 0..PATCH_SIZE {
        idct_column(&block, &mut ftemp, column);
    }
    for line in 0..PATCH_SIZE {
        idct_line(&ftemp, &mut block, line);
    }

    let mut out = [0f32; PATCH_AREA];
    for (o, b) in out.iter_mut().zip(block.iter()) {
        *o = b * mult + addval;
    }
    Ok(out)
}

fn idct_column(input: &[f32; PATCH_AREA], output: &mut [f32; PATCH_AREA], column: usize) {
    let cos = &tables().cosines;
    for n in 0..PATCH_SIZE {
        let mut total = OO_SQRT2 * input[column];
        for u in 1..PATCH_SIZE {
            total += input[u * PATCH_SIZE + column] * cos[u * PATCH_SIZE + n];
        }
        output[PATCH_SIZE * n + column] = total;
    }
}

fn idct_line(input: &[f32; PATCH_AREA], output: &mut [f32; PATCH_AREA], line: usize) {
    let cos = &tables().cosines;
    let oosob = 2.0f32 / PATCH_SIZE as f32;
    let row = line * PATCH_SIZE;
    for n in 0..PATCH_SIZE {
        let mut total = OO_SQRT2 * input[row];
        for u in 1..PATCH_SIZE {
            total += input[row + u] * cos[u * PATCH_SIZE + n];
        }
        output[row + n] = total * oosob;
    }
}
