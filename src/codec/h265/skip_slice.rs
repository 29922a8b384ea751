// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Direct generation of slice data in which every CTU is coded as a skipped
//! CU merging from candidate 0. This is the cheapest conforming slice for a
//! given header and is used for frame-skip and padding frames.

use std::io::Write;

use thiserror::Error;

use crate::bitstream::BitWriter;
use crate::bitstream::BitWriterError;
use crate::codec::h265::cabac::init_context;
use crate::codec::h265::cabac::CabacEncoder;
use crate::codec::h265::cabac::INIT_VAL_CU_SKIP;
use crate::codec::h265::cabac::INIT_VAL_MERGE_IDX;
use crate::codec::h265::cabac::INIT_VAL_SPLIT_CU;
use crate::codec::h265::cabac::INIT_VAL_TRANSQUANT_BYPASS;
use crate::codec::h265::cabac::TERMINATE_CTX;
use crate::codec::h265::nalu_writer::NaluWriter;
use crate::codec::h265::nalu_writer::NaluWriterError;
use crate::codec::h265::syntax::Pps;
use crate::codec::h265::syntax::SliceHeader;
use crate::codec::h265::syntax::Sps;
use crate::codec::h265::synthesizer::Synthesizer;
use crate::codec::h265::synthesizer::SynthesizerError;
use crate::codec::h265::NaluType;

#[derive(Error, Debug)]
pub enum SkipSliceError {
    #[error("skip data cannot be generated for an intra slice")]
    IntraSlice,
    #[error(transparent)]
    Synthesizer(#[from] SynthesizerError),
    #[error(transparent)]
    BitWriter(#[from] BitWriterError),
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SkipSliceResult<T> = std::result::Result<T, SkipSliceError>;

/// Context bytes for the syntax elements an all-skip slice codes.
struct SkipContexts {
    transquant_bypass: u8,
    split_cu: [u8; 3],
    cu_skip: [u8; 3],
    merge_idx: u8,
    terminate: u8,
}

impl SkipContexts {
    fn new(init_type: usize, slice_qp_y: i32) -> Self {
        Self {
            transquant_bypass: init_context(INIT_VAL_TRANSQUANT_BYPASS[init_type], slice_qp_y),
            split_cu: INIT_VAL_SPLIT_CU[init_type].map(|v| init_context(v, slice_qp_y)),
            cu_skip: INIT_VAL_CU_SKIP[init_type].map(|v| init_context(v, slice_qp_y)),
            merge_idx: init_context(INIT_VAL_MERGE_IDX[init_type], slice_qp_y),
            terminate: TERMINATE_CTX,
        }
    }
}

/// Geometry and per-slice constants threaded through the quadtree recursion.
struct TreeParams {
    pic_width: u32,
    pic_height: u32,
    log2_min_cb: u32,
    log2_ctu: u32,
    /// Luma position of the first CTU of the slice segment.
    x0: u32,
    y0: u32,
    transquant_bypass_enabled: bool,
    num_merge_cand: u32,
}

fn coding_tree<W: Write>(
    cabac: &mut CabacEncoder<W>,
    ctx: &mut SkipContexts,
    p: &TreeParams,
    x: u32,
    y: u32,
    log2_size: u32,
) -> Result<(), BitWriterError> {
    // Neighbor availability within the slice segment. Every coded CU is a
    // skip, so the cu_skip_flag context is just the availability count.
    let left_avail = if y == p.y0 { x > p.x0 } else { x > 0 };
    let above_avail = if y == p.y0 {
        false
    } else if x >= p.x0 {
        y > p.y0
    } else {
        y > p.y0 + (1 << p.log2_ctu)
    };

    let size = 1u32 << log2_size;
    let boundary = (x + size > p.pic_width || y + size > p.pic_height)
        && log2_size > p.log2_min_cb;

    let split = if !boundary {
        cabac.encode_bin(&mut ctx.split_cu[0], false)?;
        false
    } else {
        // Split is implied, not signaled, for CUs overhanging the picture.
        log2_size > p.log2_min_cb
    };

    if split {
        let x1 = x + (1 << (log2_size - 1));
        let y1 = y + (1 << (log2_size - 1));

        coding_tree(cabac, ctx, p, x, y, log2_size - 1)?;
        if x1 < p.pic_width {
            coding_tree(cabac, ctx, p, x1, y, log2_size - 1)?;
        }
        if y1 < p.pic_height {
            coding_tree(cabac, ctx, p, x, y1, log2_size - 1)?;
        }
        if x1 < p.pic_width && y1 < p.pic_height {
            coding_tree(cabac, ctx, p, x1, y1, log2_size - 1)?;
        }

        return Ok(());
    }

    if p.transquant_bypass_enabled {
        cabac.encode_bin(&mut ctx.transquant_bypass, false)?;
    }

    let skip_ctx = usize::from(left_avail) + usize::from(above_avail);
    cabac.encode_bin(&mut ctx.cu_skip[skip_ctx], true)?;

    // merge_idx 0 as a truncated unary code: first bin context-coded, the
    // rest bypass.
    if p.num_merge_cand > 1 {
        for i in 0..p.num_merge_cand - 1 {
            let symbol = i != 0;

            if i == 0 {
                cabac.encode_bin(&mut ctx.merge_idx, symbol)?;
            } else {
                cabac.encode_bin_ep(symbol)?;
            }

            if !symbol {
                break;
            }
        }
    }

    Ok(())
}

/// Writes one complete skip-slice NAL: start code, NAL header, slice segment
/// header and the CABAC-coded slice data covering `num_ctus` CTUs starting at
/// `slice.segment_address`, with emulation prevention applied.
pub fn synthesize<W: Write>(
    nalu_type: NaluType,
    temporal_id: u8,
    slice: &SliceHeader,
    sps: &Sps,
    pps: &Pps,
    num_ctus: u32,
    writer: W,
) -> SkipSliceResult<()> {
    if slice.is_i() {
        return Err(SkipSliceError::IntraSlice);
    }

    let mut rbsp = Vec::new();
    Synthesizer::<SliceHeader, _>::rbsp(nalu_type, slice, sps, pps, &mut rbsp)?;

    let slice_qp_y =
        (i32::from(pps.init_qp_minus26) + 26 + i32::from(slice.slice_qp_delta)).max(0);
    let init_type = if slice.is_p() { 1 } else { 2 };

    let mut ctx = SkipContexts::new(init_type, slice_qp_y);
    let p = TreeParams {
        pic_width: sps.pic_width_in_luma_samples,
        pic_height: sps.pic_height_in_luma_samples,
        log2_min_cb: sps.log2_min_luma_coding_block_size_minus3 + 3,
        log2_ctu: sps.ctb_log2_size_y(),
        x0: (slice.segment_address % sps.pic_width_in_ctbs_y()) << sps.ctb_log2_size_y(),
        y0: (slice.segment_address / sps.pic_width_in_ctbs_y()) << sps.ctb_log2_size_y(),
        transquant_bypass_enabled: pps.transquant_bypass_enabled_flag,
        num_merge_cand: 5 - u32::from(slice.five_minus_max_num_merge_cand),
    };

    {
        let mut bs = BitWriter::new(&mut rbsp);
        let mut cabac = CabacEncoder::new(&mut bs);

        let width_in_ctbs = sps.pic_width_in_ctbs_y();
        let end = slice.segment_address + num_ctus;

        for ctu in slice.segment_address..end {
            let x = (ctu % width_in_ctbs) << p.log2_ctu;
            let y = (ctu / width_in_ctbs) << p.log2_ctu;

            coding_tree(&mut cabac, &mut ctx, &p, x, y, p.log2_ctu)?;

            if ctu + 1 != end {
                // end_of_slice_segment_flag
                cabac.encode_bin(&mut ctx.terminate, false)?;
            }
        }

        cabac.slice_finish()?;
        bs.flush()?;
    }

    let mut nalu = NaluWriter::new(writer, true);
    nalu.write_header(nalu_type, temporal_id)?;
    nalu.write_bytes(&rbsp)?;

    Ok(())
}
