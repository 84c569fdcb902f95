//! MSB-first bit stream used by LayerData.
//!
//! A value of `n` bits is packed from its little-endian bytes: each byte
//! contributes its low `min(8, remaining)` bits, most significant first.

use super::TerrainError;

#[derive(Debug, Clone, Default)]
pub struct BitPack {
    data: Vec<u8>,
    byte_pos: usize,
    bit_pos: usize,
}

impl BitPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            ..Self::default()
        }
    }

    /// Pack the low `count` bits of `value`, `count <= 32`.
    pub fn pack_bits(&mut self, value: u32, count: u32) {
        self.pack_bit_array(&value.to_le_bytes(), count.min(32) as usize);
    }

    pub fn pack_float(&mut self, value: f32) {
        self.pack_bit_array(&value.to_le_bytes(), 32);
    }

    fn pack_bit_array(&mut self, bytes: &[u8], mut total: usize) {
        let mut index = 0;
        while total > 0 {
            let count = total.min(8);
            total -= count;
            let byte = bytes[index];
            for bit in (0..count).rev() {
                self.push_bit(byte & (1 << bit) != 0);
            }
            index += 1;
        }
    }

    fn push_bit(&mut self, set: bool) {
        if self.data.len() <= self.byte_pos {
            self.data.push(0);
        }
        if set {
            self.data[self.byte_pos] |= 0x80 >> self.bit_pos;
        }
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    /// Bits written so far.
    pub fn bit_len(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos
    }

    /// Roll the stream back to `bit_len` bits, clearing everything after.
    pub fn truncate_bits(&mut self, bit_len: usize) {
        if bit_len >= self.bit_len() {
            return;
        }
        self.byte_pos = bit_len / 8;
        self.bit_pos = bit_len % 8;
        self.data.truncate(self.byte_pos + 1);
        if let Some(last) = self.data.get_mut(self.byte_pos) {
            *last &= !(0xFFu8 >> self.bit_pos);
        }
        if self.bit_pos == 0 {
            self.data.truncate(self.byte_pos);
        }
    }

    /// Payload length as it goes on the wire: one byte past the current
    /// byte position, even when that byte holds no bits.
    pub fn wire_len(&self) -> usize {
        self.byte_pos + 1
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        let len = self.wire_len();
        self.data.resize(len, 0);
        self.data
    }
}

/// Reader for streams produced by [`BitPack`].
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    pub fn unpack_bits(&mut self, count: u32) -> Result<u32, TerrainError> {
        Ok(u32::from_le_bytes(self.unpack_bit_array(count.min(32) as usize)?))
    }

    pub fn unpack_float(&mut self) -> Result<f32, TerrainError> {
        Ok(f32::from_le_bytes(self.unpack_bit_array(32)?))
    }

    pub fn read_bit(&mut self) -> Result<bool, TerrainError> {
        let byte = *self.data.get(self.byte_pos).ok_or(TerrainError::Truncated)?;
        let set = byte & (0x80 >> self.bit_pos) != 0;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(set)
    }

    fn unpack_bit_array(&mut self, mut total: usize) -> Result<[u8; 4], TerrainError> {
        let mut out = [0u8; 4];
        let mut index = 0;
        while total > 0 {
            let count = total.min(8);
            total -= count;
            for _ in 0..count {
                out[index] <<= 1;
                if self.read_bit()? {
                    out[index] |= 1;
                }
            }
            index += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_fill_msb_first() {
        let mut bp = BitPack::new();
        bp.pack_bits(0b101, 3);
        bp.pack_bits(0x1F, 5);
        bp.pack_bits(1, 1);
        assert_eq!(bp.bit_len(), 9);
        assert_eq!(bp.into_bytes(), vec![0b1011_1111, 0b1000_0000]);
    }

    #[test]
    fn multi_byte_values_pack_low_byte_first() {
        let mut bp = BitPack::new();
        bp.pack_bits(264, 16);
        assert_eq!(bp.wire_len(), 3);
        assert_eq!(bp.into_bytes(), vec![0x08, 0x01, 0x00]);
    }

    #[test]
    fn reader_inverts_packer() {
        let mut bp = BitPack::new();
        bp.pack_bits(0x2AB, 10);
        bp.pack_float(-3.25);
        bp.pack_bits(0xDEAD_BEEF, 32);
        let bytes = bp.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.unpack_bits(10).unwrap(), 0x2AB);
        assert_eq!(r.unpack_float().unwrap(), -3.25);
        assert_eq!(r.unpack_bits(32).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn truncate_clears_trailing_bits() {
        let mut bp = BitPack::new();
        bp.pack_bits(0xFF, 8);
        bp.pack_bits(0xFF, 8);
        bp.truncate_bits(11);
        assert_eq!(bp.bit_len(), 11);
        bp.pack_bits(0, 5);
        assert_eq!(bp.into_bytes(), vec![0xFF, 0xE0, 0x00]);
    }

    #[test]
    fn reading_past_end_fails() {
        let mut r = BitReader::new(&[0xFF]);
        assert!(r.unpack_bits(8).is_ok());
        assert_eq!(r.read_bit().unwrap_err(), TerrainError::Truncated);
    }
}
