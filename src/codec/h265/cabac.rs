// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CABAC binary arithmetic encoder (clause 9.3.4), restricted to what direct
//! slice-data generation needs: context-coded bins, bypass bins and the
//! end-of-slice termination.

use std::io::Write;

use crate::bitstream::BitWriter;
use crate::bitstream::BitWriterResult;

/// Table 9-40, rangeTabLps[pStateIdx][qRangeIdx].
const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240],
    [128, 167, 197, 227],
    [128, 158, 187, 216],
    [123, 150, 178, 205],
    [116, 142, 169, 195],
    [111, 135, 160, 185],
    [105, 128, 152, 175],
    [100, 122, 144, 166],
    [95, 116, 137, 158],
    [90, 110, 130, 150],
    [85, 104, 123, 142],
    [81, 99, 117, 135],
    [77, 94, 111, 128],
    [73, 89, 105, 122],
    [69, 85, 100, 116],
    [66, 80, 95, 110],
    [62, 76, 90, 104],
    [59, 72, 86, 99],
    [56, 69, 81, 94],
    [53, 65, 77, 89],
    [51, 62, 73, 85],
    [48, 59, 69, 80],
    [46, 56, 66, 76],
    [43, 53, 63, 72],
    [41, 50, 59, 69],
    [39, 48, 56, 65],
    [37, 45, 54, 62],
    [35, 43, 51, 59],
    [33, 41, 48, 56],
    [32, 39, 46, 53],
    [30, 37, 43, 50],
    [29, 35, 41, 48],
    [27, 33, 39, 45],
    [26, 31, 37, 43],
    [24, 30, 35, 41],
    [23, 28, 33, 39],
    [22, 27, 32, 37],
    [21, 26, 30, 35],
    [20, 24, 29, 33],
    [19, 23, 27, 31],
    [18, 22, 26, 30],
    [17, 21, 25, 28],
    [16, 20, 23, 27],
    [15, 19, 22, 25],
    [14, 18, 21, 24],
    [14, 17, 20, 23],
    [13, 16, 19, 22],
    [12, 15, 18, 21],
    [12, 14, 17, 20],
    [11, 14, 16, 19],
    [11, 13, 15, 18],
    [10, 12, 15, 17],
    [10, 12, 14, 16],
    [9, 11, 13, 15],
    [9, 11, 12, 14],
    [8, 10, 12, 14],
    [8, 9, 11, 13],
    [7, 9, 11, 12],
    [7, 9, 10, 12],
    [7, 8, 10, 11],
    [6, 8, 9, 11],
    [6, 7, 9, 10],
    [6, 7, 8, 9],
    [2, 2, 2, 2],
];

/// Table 9-41, transIdxMps.
const TRANS_IDX_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
    27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50,
    51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// Table 9-41, transIdxLps.
const TRANS_IDX_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12, 13, 13, 15, 15, 16, 16, 18, 18, 19, 19, 21,
    21, 22, 22, 23, 24, 24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33, 33, 33, 34,
    34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

/// Table 9-5 initValue entries for the syntax elements a skip slice codes,
/// indexed by initType (0 = I, 1 = P, 2 = B).
pub const INIT_VAL_TRANSQUANT_BYPASS: [u8; 3] = [154, 154, 154];
pub const INIT_VAL_SPLIT_CU: [[u8; 3]; 3] = [[139, 141, 157], [107, 139, 126], [107, 139, 126]];
pub const INIT_VAL_CU_SKIP: [[u8; 3]; 3] = [[154, 154, 154], [197, 185, 201], [197, 185, 201]];
pub const INIT_VAL_MERGE_IDX: [u8; 3] = [154, 122, 137];

/// The terminating context is not derived from an initValue; its coded state
/// is the fixed 63 (the rangeTabLps row of 2s).
pub const TERMINATE_CTX: u8 = 63;

/// 9.3.2.2, context variable initialization. The returned byte packs
/// pStateIdx in the low 6 bits and valMps in bit 6.
pub fn init_context(init_val: u8, slice_qp_y: i32) -> u8 {
    let qp = slice_qp_y.clamp(0, 51);

    let slope = i32::from(init_val >> 4) * 5 - 45;
    let offset = (i32::from(init_val & 15) << 3) - 16;
    let init_state = (((slope * qp) >> 4) + offset).clamp(1, 126);

    if init_state >= 64 {
        ((init_state - 64) as u8) | 0x40
    } else {
        (63 - init_state) as u8
    }
}

/// Arithmetic encoder state over a [`BitWriter`]. The writer must be byte
/// aligned when coding starts; termination leaves it byte aligned again.
pub struct CabacEncoder<'a, W: Write> {
    bs: &'a mut BitWriter<W>,
    low: u32,
    range: u32,
    bits_outstanding: u32,
    first_bit_flag: bool,
}

impl<'a, W: Write> CabacEncoder<'a, W> {
    pub fn new(bs: &'a mut BitWriter<W>) -> Self {
        Self {
            bs,
            low: 0,
            range: 510,
            bits_outstanding: 0,
            first_bit_flag: true,
        }
    }

    fn put_bit_c(&mut self, bit: bool) -> BitWriterResult<()> {
        if self.first_bit_flag {
            self.first_bit_flag = false;
        } else {
            self.bs.write_bit(bit)?;
        }

        while self.bits_outstanding > 0 {
            self.bs.write_bit(!bit)?;
            self.bits_outstanding -= 1;
        }

        Ok(())
    }

    fn renorm(&mut self) -> BitWriterResult<()> {
        while self.range < 256 {
            if self.low < 256 {
                self.put_bit_c(false)?;
            } else if self.low >= 512 {
                self.low -= 512;
                self.put_bit_c(true)?;
            } else {
                self.low -= 256;
                self.bits_outstanding += 1;
            }
            self.range <<= 1;
            self.low <<= 1;
        }

        Ok(())
    }

    /// Codes one bin against the context byte, updating both.
    pub fn encode_bin(&mut self, ctx: &mut u8, bin: bool) -> BitWriterResult<()> {
        let mut state = *ctx & 0x3f;
        let mut val_mps = (*ctx >> 6) != 0;
        let q_range_idx = ((self.range >> 6) & 3) as usize;
        let range_lps = u32::from(RANGE_TAB_LPS[usize::from(state)][q_range_idx]);

        self.range -= range_lps;

        if bin != val_mps {
            self.low += self.range;
            self.range = range_lps;

            if state == 0 {
                val_mps = !val_mps;
            }

            state = TRANS_IDX_LPS[usize::from(state)];
        } else {
            state = TRANS_IDX_MPS[usize::from(state)];
        }

        *ctx = ((val_mps as u8) << 6) | state;

        self.renorm()
    }

    /// Codes one bypass bin.
    pub fn encode_bin_ep(&mut self, bin: bool) -> BitWriterResult<()> {
        if bin {
            self.low += self.low + self.range;
        } else {
            self.low += self.low;
        }

        self.renorm()
    }

    /// 9.3.4.3.5 termination for end_of_slice_segment_flag == 1, followed by
    /// the flush and rbsp trailing bits. The writer ends up byte aligned.
    pub fn slice_finish(mut self) -> BitWriterResult<()> {
        self.range -= 2;
        self.low += self.range;
        self.range = 2;

        self.renorm()?;
        let bit = (self.low >> 9) & 1 != 0;
        self.put_bit_c(bit)?;
        let stop = (self.low >> 8) & 1 != 0;
        self.bs.write_bit(stop)?;
        self.bs.write_trailing_bits()?;

        Ok(())
    }
}
