//! Precomputed codec tables. Built once, read-only afterwards.

use std::sync::OnceLock;

use super::{PATCH_AREA, PATCH_SIZE};

pub(crate) const OO_SQRT2: f32 = std::f32::consts::FRAC_1_SQRT_2;

pub(crate) struct CodecTables {
    /// `cosines[u * 16 + n] = cos((2n + 1) * u * π / 32)`
    pub cosines: [f32; PATCH_AREA],
    pub quantize: [f32; PATCH_AREA],
    pub dequantize: [f32; PATCH_AREA],
    /// Zig-zag scan position of each cell, `copy_matrix[j * 16 + i]`.
    pub copy_matrix: [usize; PATCH_AREA],
}

pub(crate) fn tables() -> &'static CodecTables {
    static TABLES: OnceLock<CodecTables> = OnceLock::new();
    TABLES.get_or_init(CodecTables::build)
}

impl CodecTables {
    fn build() -> Self {
        let mut t = CodecTables {
            cosines: [0.0; PATCH_AREA],
            quantize: [0.0; PATCH_AREA],
            dequantize: [0.0; PATCH_AREA],
            copy_matrix: [0; PATCH_AREA],
        };
        t.build_quantize_tables();
        t.build_cosine_table();
        t.build_copy_matrix();
        t
    }

    fn build_quantize_tables(&mut self) {
        let oosob = 2.0f32 / PATCH_SIZE as f32;
        for j in 0..PATCH_SIZE {
            for i in 0..PATCH_SIZE {
                self.dequantize[j * PATCH_SIZE + i] = 1.0 + 2.0 * (i + j) as f32;
                self.quantize[j * PATCH_SIZE + i] = oosob / (1.0 + 2.0 * (i as f32 + j as f32));
            }
        }
    }

    fn build_cosine_table(&mut self) {
        let hposz = std::f32::consts::PI * 0.5 / PATCH_SIZE as f32;
        for u in 0..PATCH_SIZE {
            for n in 0..PATCH_SIZE {
                let arg = (2.0 * n as f32 + 1.0) * u as f32 * hposz;
                self.cosines[u * PATCH_SIZE + n] = (arg as f64).cos() as f32;
            }
        }
    }

    fn build_copy_matrix(&mut self) {
        let mut diag = false;
        let mut right = true;
        let mut i = 0usize;
        let mut j = 0usize;
        let mut count = 0usize;

        while i < PATCH_SIZE && j < PATCH_SIZE {
            self.copy_matrix[j * PATCH_SIZE + i] = count;
            count += 1;

            if !diag {
                if right {
                    if i < PATCH_SIZE - 1 {
                        i += 1;
                    } else {
                        j += 1;
                    }
                    right = false;
                    diag = true;
                } else {
                    if j < PATCH_SIZE - 1 {
                        j += 1;
                    } else {
                        i += 1;
                    }
                    right = true;
                    diag = true;
                }
            } else if right {
                i += 1;
                // j is never 0 here: a right-diagonal starts below row 0
                j -= 1;
                if i == PATCH_SIZE - 1 || j == 0 {
                    diag = false;
                }
            } else {
                // i is never 0 here for the same reason
                i -= 1;
                j += 1;
                if j == PATCH_SIZE - 1 || i == 0 {
                    diag = false;
                }
            }
        }
    }
}
