// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex A level and tier limits, and the solver picking the smallest
//! level/tier pair that admits a given stream configuration.

use crate::codec::h265::Level;
use crate::codec::h265::Tier;

/// Table A.6: MaxLumaPs, MaxCPB (Main), MaxCPB (High), MaxSliceSegmentsPerPicture,
/// MaxTileRows, MaxTileCols per level.
const TABLE_A1: [[u32; 6]; 13] = [
    /* 1   */ [36864, 350, 350, 16, 1, 1],
    /* 2   */ [122880, 1500, 1500, 16, 1, 1],
    /* 2.1 */ [245760, 3000, 3000, 20, 1, 1],
    /* 3   */ [552960, 6000, 6000, 30, 2, 2],
    /* 3.1 */ [983040, 10000, 10000, 40, 3, 3],
    /* 4   */ [2228224, 12000, 30000, 75, 5, 5],
    /* 4.1 */ [2228224, 20000, 50000, 75, 5, 5],
    /* 5   */ [8912896, 25000, 100000, 200, 11, 10],
    /* 5.1 */ [8912896, 40000, 160000, 200, 11, 10],
    /* 5.2 */ [8912896, 60000, 240000, 200, 11, 10],
    /* 6   */ [35651584, 60000, 240000, 600, 22, 20],
    /* 6.1 */ [35651584, 120000, 480000, 600, 22, 20],
    /* 6.2 */ [35651584, 240000, 800000, 600, 22, 20],
];

/// Table A.7: MaxLumaSr, MaxBR (Main), MaxBR (High), MinCr per level.
const TABLE_A2: [[u32; 4]; 13] = [
    /* 1   */ [552960, 128, 128, 2],
    /* 2   */ [3686400, 1500, 1500, 2],
    /* 2.1 */ [7372800, 3000, 3000, 2],
    /* 3   */ [16588800, 6000, 6000, 2],
    /* 3.1 */ [33177600, 10000, 10000, 2],
    /* 4   */ [66846720, 12000, 30000, 4],
    /* 4.1 */ [133693440, 20000, 50000, 4],
    /* 5   */ [267386880, 25000, 100000, 6],
    /* 5.1 */ [534773760, 40000, 160000, 8],
    /* 5.2 */ [1069547520, 60000, 240000, 8],
    /* 6   */ [1069547520, 60000, 240000, 8],
    /* 6.1 */ [2139095040, 120000, 480000, 8],
    /* 6.2 */ [4278190080, 240000, 800000, 6],
];

const LEVELS: [Level; 13] = [
    Level::L1,
    Level::L2,
    Level::L2_1,
    Level::L3,
    Level::L3_1,
    Level::L4,
    Level::L4_1,
    Level::L5,
    Level::L5_1,
    Level::L5_2,
    Level::L6,
    Level::L6_1,
    Level::L6_2,
];

/// CPB and bitrate limits are stated in "CpbBrNalFactor" units for the NAL HRD.
const CPB_BR_NAL_FACTOR: u32 = 1100;

fn level_idx(level: Level) -> usize {
    LEVELS.iter().position(|&l| l == level).unwrap_or(0)
}

/// High tier exists from level 4 up (Table A.6 leaves it undefined below).
fn max_tier_idx(lidx: usize) -> usize {
    usize::from(LEVELS[lidx.min(LEVELS.len() - 1)] >= Level::L4)
}

/// A.4.2: maxDpbPicBuf scaled by how much of MaxLumaPs the picture occupies.
pub fn max_dpb_size(pic_size_in_samples_y: u32, max_luma_ps: u32, max_dpb_pic_buf: u32) -> u32 {
    if pic_size_in_samples_y <= (max_luma_ps >> 2) {
        (4 * max_dpb_pic_buf).min(16)
    } else if pic_size_in_samples_y <= (max_luma_ps >> 1) {
        (2 * max_dpb_pic_buf).min(16)
    } else if pic_size_in_samples_y <= ((3 * max_luma_ps) >> 2) {
        ((4 * max_dpb_pic_buf) / 3).min(16)
    } else {
        max_dpb_pic_buf
    }
}

/// Number of reference frames the DPB must hold for a full B-pyramid over
/// `gop_ref_dist` frames.
pub fn min_ref_for_pyramid(gop_ref_dist: u16) -> u16 {
    let mut ref_b = (gop_ref_dist.max(1) - 1) / 2;

    let mut x = ref_b;
    while x > 2 {
        x = (x - 1) / 2;
        ref_b -= x;
    }

    2 + ref_b
}

/// The stream properties that level and tier selection depends on.
#[derive(Clone, Copy, Debug, Default)]
pub struct LevelConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate_extn: u32,
    pub frame_rate_extd: u32,
    pub num_ref_frame: u16,
    pub num_tile_columns: u16,
    pub num_tile_rows: u16,
    pub num_slice: u16,
    pub gop_ref_dist: u16,
    pub b_pyramid: bool,
    pub buffer_size_in_kb: u32,
    pub max_kbps: u32,
    pub target_kbps: u32,
}

/// Walks level (and, where available, tier) upward from the requested pair
/// until every constraint fits. Returns the corrected pair; a changed result
/// means the input was incompatible. A stream with no frame rate or GOP shape
/// yet is left alone.
pub fn correct_level(cs: &LevelConstraints, level: Level, tier: Tier) -> (Level, Tier) {
    if cs.frame_rate_extd == 0 || cs.frame_rate_extn == 0 || cs.gop_ref_dist == 0 {
        return (level, tier);
    }

    let pic_size = cs.width * cs.height;
    let luma_sr =
        (u64::from(pic_size) * u64::from(cs.frame_rate_extn)).div_ceil(u64::from(cs.frame_rate_extd));

    let mut lidx = level_idx(level);
    let mut tidx = tier as usize;

    if tidx > max_tier_idx(lidx) {
        tidx = 0;
    }

    while lidx < LEVELS.len() {
        let max_luma_ps = TABLE_A1[lidx][0];
        let max_cpb = TABLE_A1[lidx][1 + tidx];
        let max_sspp = TABLE_A1[lidx][3];
        let max_tile_rows = TABLE_A1[lidx][4];
        let max_tile_cols = TABLE_A1[lidx][5];
        let max_luma_sr = TABLE_A2[lidx][0];
        let max_br = TABLE_A2[lidx][1 + tidx];
        let max_dpb = max_dpb_size(pic_size, max_luma_ps, 6);

        let max_dim = ((f64::from(max_luma_ps) * 8.0).sqrt()) as u32;

        if pic_size > max_luma_ps
            || cs.width > max_dim
            || cs.height > max_dim
            || u32::from(cs.num_ref_frame) + 1 > max_dpb
            || u32::from(cs.num_tile_columns) > max_tile_cols
            || u32::from(cs.num_tile_rows) > max_tile_rows
            || u32::from(cs.num_slice) > max_sspp
            || (cs.b_pyramid && max_dpb < u32::from(min_ref_for_pyramid(cs.gop_ref_dist)))
        {
            lidx += 1;
            continue;
        }

        if u64::from(cs.buffer_size_in_kb) * 8000 > u64::from(CPB_BR_NAL_FACTOR) * u64::from(max_cpb)
            || luma_sr > u64::from(max_luma_sr)
            || u64::from(cs.max_kbps) * 1000 > u64::from(CPB_BR_NAL_FACTOR) * u64::from(max_br)
            || u64::from(cs.target_kbps) * 1000 > u64::from(CPB_BR_NAL_FACTOR) * u64::from(max_br)
        {
            if tidx >= max_tier_idx(lidx) {
                lidx += 1;
                tidx = 0;
            } else {
                tidx += 1;
            }

            continue;
        }

        break;
    }

    let tier = if tidx > 0 { Tier::High } else { Tier::Main };
    (LEVELS[lidx.min(LEVELS.len() - 1)], tier)
}

/// Highest NAL bitrate in kbps the level/tier admits.
pub fn max_kbps(level: Level, tier: Tier) -> u32 {
    let lidx = level_idx(level);
    let tidx = (tier as usize).min(max_tier_idx(lidx));
    TABLE_A2[lidx][1 + tidx] * CPB_BR_NAL_FACTOR / 1000
}

/// Largest NAL CPB in kilobytes the level/tier admits.
pub fn max_cpb_in_kb(level: Level, tier: Tier) -> u32 {
    let lidx = level_idx(level);
    let tidx = (tier as usize).min(max_tier_idx(lidx));
    TABLE_A1[lidx][1 + tidx] * CPB_BR_NAL_FACTOR / 8000
}

/// Highest frame rate the level admits for the given picture size.
pub fn max_fr(level: Level, pic_size_in_samples_y: u32) -> f64 {
    f64::from(TABLE_A2[level_idx(level)][0]) / f64::from(pic_size_in_samples_y.max(1))
}

/// DPB capacity in frames the level admits for the given picture size.
pub fn max_dpb_size_by_level(level: Level, pic_size_in_samples_y: u32) -> u32 {
    max_dpb_size(pic_size_in_samples_y, TABLE_A1[level_idx(level)][0], 6)
}
