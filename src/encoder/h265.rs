// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 encoder session layer.
//!
//! [`EncoderConfig::resolve`] turns a sparsely filled configuration into a
//! fully derived one, [`sync_param_to_headers`] builds the parameter sets
//! from it, and [`Encoder`] runs the per-frame pipeline: GOP typing,
//! reordering, DPB and reference-list management, header insertion and slice
//! header generation. The caller submits the resulting [`Task`] to whatever
//! executes the actual slice encoding and feeds the coded size back through
//! [`Encoder::finish_task`] and [`Encoder::recode_check`].

use std::collections::VecDeque;

use crate::codec::h265::ceil_log2;
use crate::codec::h265::dpb::construct_rpl;
use crate::codec::h265::dpb::get_coding_type;
use crate::codec::h265::dpb::get_frame_type;
use crate::codec::h265::dpb::init_dpb;
use crate::codec::h265::dpb::is_b;
use crate::codec::h265::dpb::is_i;
use crate::codec::h265::dpb::is_idr;
use crate::codec::h265::dpb::is_ltr_candidate;
use crate::codec::h265::dpb::is_p;
use crate::codec::h265::dpb::is_ref;
use crate::codec::h265::dpb::p_layer;
use crate::codec::h265::dpb::reorder;
use crate::codec::h265::dpb::sh_nut;
use crate::codec::h265::dpb::update_dpb;
use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbFrame;
use crate::codec::h265::dpb::FrameBaseInfo;
use crate::codec::h265::dpb::GopParams;
use crate::codec::h265::dpb::HasFrameInfo;
use crate::codec::h265::dpb::Rpl;
use crate::codec::h265::dpb::TemporalLayers;
use crate::codec::h265::dpb::FRAME_B;
use crate::codec::h265::dpb::FRAME_I;
use crate::codec::h265::dpb::FRAME_IDR;
use crate::codec::h265::dpb::FRAME_P;
use crate::codec::h265::dpb::FRAME_REF;
use crate::codec::h265::dpb::IDX_INVALID;
use crate::codec::h265::dpb::MAX_DPB_SIZE;
use crate::codec::h265::hrd::Hrd;
use crate::codec::h265::level::correct_level;
use crate::codec::h265::level::max_cpb_in_kb;
use crate::codec::h265::level::max_dpb_size_by_level;
use crate::codec::h265::level::max_kbps;
use crate::codec::h265::level::min_ref_for_pyramid;
use crate::codec::h265::level::LevelConstraints;
use crate::codec::h265::parser::split_nalus;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::skip_slice;
use crate::codec::h265::strps;
use crate::codec::h265::strps::SpsRpsParams;
use crate::codec::h265::syntax::BufferingPeriod;
use crate::codec::h265::syntax::Cpb;
use crate::codec::h265::syntax::PicTiming;
use crate::codec::h265::syntax::Pps;
use crate::codec::h265::syntax::SliceHeader;
use crate::codec::h265::syntax::Sps;
use crate::codec::h265::syntax::Vps;
use crate::codec::h265::syntax::Vui;
use crate::codec::h265::syntax::MAX_NUM_LONG_TERM_PICS;
use crate::codec::h265::syntax::SLICE_TYPE_B;
use crate::codec::h265::syntax::SLICE_TYPE_I;
use crate::codec::h265::syntax::SLICE_TYPE_P;
use crate::codec::h265::synthesizer::Aud;
use crate::codec::h265::synthesizer::Sei;
use crate::codec::h265::synthesizer::Synthesizer;
use crate::codec::h265::Level;
use crate::codec::h265::NaluType;
use crate::codec::h265::Profile;
use crate::codec::h265::Tier;
use crate::encoder::BrcStatus;
use crate::encoder::CodedBitstreamBuffer;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameMetadata;
use crate::encoder::RateControl;
use crate::encoder::Tunings;
use crate::Resolution;

/// Bits of [`Task::insert_headers`]: the non-slice NALs to emit before the
/// slice of an access unit.
pub const INSERT_AUD: u16 = 1 << 0;
pub const INSERT_VPS: u16 = 1 << 1;
pub const INSERT_SPS: u16 = 1 << 2;
pub const INSERT_PPS: u16 = 1 << 3;
pub const INSERT_BPSEI: u16 = 1 << 4;
pub const INSERT_PTSEI: u16 = 1 << 5;

/// Outcome of [`EncoderConfig::resolve`]. Hard violations are reported
/// through [`EncodeError::Unsupported`] instead; `Incompatible` means some
/// requested values were clipped to a working combination, each with a
/// warning in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamCheck {
    Valid,
    Incompatible,
}

/// H.265 encoder session configuration. Zero (or `None`) fields are derived
/// by [`EncoderConfig::resolve`]; explicitly set values pass through and are
/// only touched when they cannot work together.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    /// Visible frame size; the coded size is aligned up to 16.
    pub resolution: Resolution,
    pub bit_depth: u8,
    pub profile: Option<Profile>,
    pub level: Option<Level>,
    pub tier: Tier,
    /// Frame rate numerator and denominator.
    pub framerate: (u32, u32),

    pub rate_control: RateControl,
    /// Peak bitrate in bps; equal to the target for CBR, larger for VBR.
    pub max_bitrate: u64,
    /// Coded picture buffer size in kilobytes.
    pub buffer_size_kb: u32,
    /// Initial CPB fill before decoding starts, in kilobytes.
    pub initial_delay_kb: u32,
    /// Signal HRD parameters in the VUI for bitrate-controlled streams.
    pub hrd_conformance: bool,
    pub pic_timing_sei: bool,
    pub aud: bool,
    pub repeat_pps: bool,

    /// I frame period; 0 picks an open-ended GOP.
    pub gop_size: u32,
    /// Distance between anchor (I or P) frames.
    pub gop_ref_dist: u32,
    /// Distance between IDRs in GOPs; 0 keeps only the first frame an IDR
    /// and emits later I frames as open-GOP RAPs.
    pub idr_interval: u32,
    pub gop_closed: bool,
    /// Emit non-IDR I frames as CRA when nothing older is referenced.
    pub rap_intra: bool,
    pub b_pyramid: Option<bool>,
    pub p_pyramid: bool,
    pub p_pyr_interval: u32,
    pub ltr_interval: u32,
    /// Encode P frames as generalized (low-delay) B.
    pub gpb: bool,
    pub low_power: bool,

    pub num_ref_frames: u8,
    /// Active references per P-pyramid layer.
    pub num_ref_active_p: [u8; 8],
    /// Active L0/L1 references per B-pyramid layer.
    pub num_ref_active_bl0: [u8; 8],
    pub num_ref_active_bl1: [u8; 8],
    /// Per-layer frame-rate scales; all zero disables temporal scalability.
    pub temporal_layer_scales: [u16; 8],

    pub qp_i: u8,
    pub qp_p: u8,
    pub qp_b: u8,
    /// Per-pyramid-layer QP offsets.
    pub qp_offset: [i8; 8],

    pub num_slices: u16,
    pub num_tile_columns: u16,
    pub num_tile_rows: u16,
    /// Coding tree block size, 32 or 64.
    pub lcu_size: u32,
    /// Upper bound of the recode loop driven by [`BrcStatus`].
    pub num_recode: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            bit_depth: 0,
            profile: None,
            level: None,
            tier: Tier::Main,
            framerate: (0, 0),
            rate_control: RateControl::ConstantBitrate(200_000),
            max_bitrate: 0,
            buffer_size_kb: 0,
            initial_delay_kb: 0,
            hrd_conformance: true,
            pic_timing_sei: false,
            aud: false,
            repeat_pps: false,
            gop_size: 0,
            gop_ref_dist: 0,
            idr_interval: 0,
            gop_closed: false,
            rap_intra: true,
            b_pyramid: None,
            p_pyramid: false,
            p_pyr_interval: 0,
            ltr_interval: 0,
            gpb: true,
            low_power: false,
            num_ref_frames: 0,
            num_ref_active_p: [0; 8],
            num_ref_active_bl0: [0; 8],
            num_ref_active_bl1: [0; 8],
            temporal_layer_scales: [0; 8],
            qp_i: 0,
            qp_p: 0,
            qp_b: 0,
            qp_offset: [0; 8],
            num_slices: 0,
            num_tile_columns: 0,
            num_tile_rows: 0,
            lcu_size: 0,
            num_recode: 0,
        }
    }
}

/// max_num_reorder_pics for a GOP shape: one for plain B GOPs, the pyramid
/// depth for hierarchical ones.
fn num_reorder_frames(gop_ref_dist: u32, b_pyramid: bool) -> u8 {
    let mut bframes = gop_ref_dist.saturating_sub(1);

    if bframes == 0 {
        return 0;
    }

    if !b_pyramid {
        return 1;
    }

    let mut n = 0u8;
    while bframes > 0 {
        bframes >>= 1;
        n += 1;
    }

    n
}

impl EncoderConfig {
    fn coded_size(&self) -> (u32, u32) {
        (
            (self.resolution.width + 15) & !15,
            (self.resolution.height + 15) & !15,
        )
    }

    fn is_cbr(&self) -> bool {
        matches!(self.rate_control, RateControl::ConstantBitrate(t) if self.max_bitrate == t)
    }

    pub(crate) fn gop_params(&self) -> GopParams {
        GopParams {
            gop_pic_size: self.gop_size,
            gop_ref_dist: self.gop_ref_dist,
            idr_interval: self.idr_interval,
            gop_closed: self.gop_closed,
            num_ref_frame: self.num_ref_frames,
            b_pyramid: self.b_pyramid.unwrap_or(false),
            p_pyramid: self.p_pyramid,
            p_pyr_interval: self.p_pyr_interval,
            ltr_interval: self.ltr_interval,
        }
    }

    pub(crate) fn temporal_layers(&self) -> TemporalLayers {
        TemporalLayers::new(&self.temporal_layer_scales)
    }

    /// Derives every unset parameter and validates the result. Values that
    /// cannot work together are clipped with a warning; violations with no
    /// sensible correction fail with [`EncodeError::Unsupported`].
    pub fn resolve(&mut self) -> EncodeResult<ParamCheck> {
        let mut clipped = false;
        let mut unsupported: Vec<String> = Vec::new();

        if self.resolution.width == 0 || self.resolution.height == 0 {
            unsupported.push("zero frame size".into());
        }

        if self.bit_depth == 0 {
            self.bit_depth = 8;
        }
        if !matches!(self.bit_depth, 8 | 10) {
            unsupported.push(format!("bit depth {}", self.bit_depth));
        }

        if self.lcu_size == 0 {
            self.lcu_size = 64;
        }
        if !matches!(self.lcu_size, 32 | 64) {
            unsupported.push(format!("LCU size {}", self.lcu_size));
        }

        let profile = *self.profile.get_or_insert(if self.bit_depth > 8 {
            Profile::Main10
        } else {
            Profile::Main
        });
        if profile == Profile::Main && self.bit_depth != 8 {
            unsupported.push("Main profile requires 8-bit input".into());
        }

        if let RateControl::ConstantBitrate(0) = self.rate_control {
            unsupported.push("zero target bitrate".into());
        }

        if !unsupported.is_empty() {
            return Err(EncodeError::Unsupported(unsupported.join(", ")));
        }

        if self.framerate.0 == 0 || self.framerate.1 == 0 {
            self.framerate = (30, 1);
        }

        if self.gop_size == 0 {
            self.gop_size = 0xffff;
        }
        if self.gop_ref_dist == 0 {
            self.gop_ref_dist = std::cmp::min(
                self.gop_size.saturating_sub(1).max(1),
                if self.low_power { 1 } else { 8 },
            );
        }
        if self.gop_ref_dist > self.gop_size.saturating_sub(1).max(1) {
            log::warn!(
                "GopRefDist {} does not fit a GOP of {}, clipping",
                self.gop_ref_dist,
                self.gop_size
            );
            self.gop_ref_dist = self.gop_size.saturating_sub(1).max(1);
            clipped = true;
        }

        let tl = self.temporal_layers();
        if tl.is_scalable() {
            if self.gop_ref_dist > 1 {
                log::warn!("temporal layers require GopRefDist 1, clipping");
                self.gop_ref_dist = 1;
                clipped = true;
            }
            if self.p_pyramid {
                log::warn!("temporal layers and P-pyramid are mutually exclusive");
                self.p_pyramid = false;
                clipped = true;
            }
        }

        let b_pyramid = self.b_pyramid.get_or_insert(self.gop_ref_dist >= 4);
        if *b_pyramid && self.gop_ref_dist < 2 {
            log::warn!("B-pyramid needs at least two frames between anchors");
            *b_pyramid = false;
            clipped = true;
        }
        let b_pyramid = *b_pyramid;

        if self.p_pyramid && self.gop_ref_dist != 1 {
            log::warn!("P-pyramid requires GopRefDist 1, disabling");
            self.p_pyramid = false;
            clipped = true;
        }

        if self.num_ref_frames == 0 {
            self.num_ref_frames = if b_pyramid {
                min_ref_for_pyramid(self.gop_ref_dist as u16) as u8
            } else if self.gop_ref_dist > 1 {
                2
            } else {
                1
            };
        }
        if self.ltr_interval > 0 && self.num_ref_frames < 2 {
            self.num_ref_frames = 2;
        }

        if self.p_pyr_interval == 0 {
            self.p_pyr_interval = std::cmp::min(3, u32::from(self.num_ref_frames));
        }

        for layer in 0..8 {
            if self.num_ref_active_p[layer] == 0 {
                self.num_ref_active_p[layer] = std::cmp::min(self.num_ref_frames, 2);
            }
            if self.num_ref_active_bl0[layer] == 0 {
                self.num_ref_active_bl0[layer] = std::cmp::min(self.num_ref_frames, 2);
            }
            if self.num_ref_active_bl1[layer] == 0 {
                self.num_ref_active_bl1[layer] = 1;
            }
        }

        if let RateControl::ConstantQuality(q) = self.rate_control {
            let q = q.clamp(1, 51) as u8;
            if self.qp_i == 0 {
                self.qp_i = q;
            }
            if self.qp_p == 0 {
                self.qp_p = std::cmp::min(self.qp_i + 1, 51);
            }
            if self.qp_b == 0 {
                self.qp_b = std::cmp::min(self.qp_p + 1, 51);
            }
        }
        if self.qp_offset == [0; 8] && (b_pyramid || self.p_pyramid) {
            self.qp_offset = [1, 2, 3, 4, 5, 6, 7, 8];
        }

        if self.num_slices == 0 {
            self.num_slices = 1;
        }
        if self.num_tile_columns == 0 {
            self.num_tile_columns = 1;
        }
        if self.num_tile_rows == 0 {
            self.num_tile_rows = 1;
        }

        if let RateControl::ConstantBitrate(target) = self.rate_control {
            if self.max_bitrate < target {
                if self.max_bitrate != 0 {
                    log::warn!("MaxKbps below the target bitrate, raising");
                    clipped = true;
                }
                self.max_bitrate = target;
            }

            let target_kbps = (target / 1000) as u32;
            if self.buffer_size_kb == 0 {
                // two seconds worth of stream
                self.buffer_size_kb = target_kbps / 4;
            }
            if self.initial_delay_kb == 0 {
                self.initial_delay_kb = self.buffer_size_kb / 2;
            }
        }

        let (coded_w, coded_h) = self.coded_size();
        let target_kbps = self
            .rate_control
            .bitrate_target()
            .map_or(0, |t| (t / 1000) as u32);
        let cs = LevelConstraints {
            width: coded_w,
            height: coded_h,
            frame_rate_extn: self.framerate.0,
            frame_rate_extd: self.framerate.1,
            num_ref_frame: u16::from(self.num_ref_frames),
            num_tile_columns: self.num_tile_columns,
            num_tile_rows: self.num_tile_rows,
            num_slice: self.num_slices,
            gop_ref_dist: self.gop_ref_dist as u16,
            b_pyramid,
            buffer_size_in_kb: self.buffer_size_kb,
            max_kbps: (self.max_bitrate / 1000) as u32,
            target_kbps,
        };

        let requested = self.level.unwrap_or(Level::L1);
        let (level, tier) = correct_level(&cs, requested, self.tier);
        if self.level.is_some() && (level, tier) != (requested, self.tier) {
            log::warn!(
                "level {:?}@{:?} cannot hold the stream, raising to {:?}@{:?}",
                requested,
                self.tier,
                level,
                tier
            );
            clipped = true;
        }
        self.level = Some(level);
        self.tier = tier;

        let max_dpb = max_dpb_size_by_level(level, coded_w * coded_h);
        if u32::from(self.num_ref_frames) + 1 > max_dpb {
            log::warn!(
                "NumRefFrame {} exceeds the level DPB, clipping",
                self.num_ref_frames
            );
            self.num_ref_frames = (max_dpb - 1) as u8;
            clipped = true;
        }

        if matches!(self.rate_control, RateControl::ConstantBitrate(_)) {
            let kbps_cap = max_kbps(level, tier);
            if (self.max_bitrate / 1000) as u32 > kbps_cap {
                log::warn!("MaxKbps exceeds the level cap, clipping");
                self.max_bitrate = u64::from(kbps_cap) * 1000;
                clipped = true;
            }
            let cpb_cap = max_cpb_in_kb(level, tier);
            if self.buffer_size_kb > cpb_cap {
                log::warn!("BufferSizeInKB exceeds the level cap, clipping");
                self.buffer_size_kb = cpb_cap;
                clipped = true;
            }
        }

        Ok(if clipped {
            ParamCheck::Incompatible
        } else {
            ParamCheck::Valid
        })
    }

    /// Recovers a configuration from coded SPS/PPS NALs, the inverse of
    /// [`sync_param_to_headers`]. GOP structure is not coded in parameter
    /// sets and stays at its defaults.
    pub fn from_coded_headers(data: &[u8]) -> EncodeResult<Self> {
        let nalus = split_nalus(data).map_err(EncodeError::Parse)?;
        let mut parser = Parser::default();
        let mut sps_id = None;
        let mut pps_id = None;

        for nalu in &nalus {
            match nalu.header.type_ {
                NaluType::SpsNut => {
                    sps_id = Some(
                        parser
                            .parse_sps(nalu)
                            .map_err(EncodeError::Parse)?
                            .seq_parameter_set_id,
                    );
                }
                NaluType::PpsNut => {
                    pps_id = Some(
                        parser
                            .parse_pps(nalu)
                            .map_err(EncodeError::Parse)?
                            .pic_parameter_set_id,
                    );
                }
                _ => (),
            }
        }

        let sps = sps_id
            .and_then(|id| parser.get_sps(id))
            .ok_or_else(|| EncodeError::Parse("no SPS in the stream".into()))?;

        let mut config = EncoderConfig {
            resolution: Resolution {
                width: sps.pic_width_in_luma_samples
                    - 2 * (sps.conf_win_left_offset + sps.conf_win_right_offset),
                height: sps.pic_height_in_luma_samples
                    - 2 * (sps.conf_win_top_offset + sps.conf_win_bottom_offset),
            },
            bit_depth: sps.bit_depth_luma_minus8 + 8,
            profile: Profile::n(sps.general.profile_idc),
            level: Level::n(sps.general.level_idc),
            tier: if sps.general.tier_flag {
                Tier::High
            } else {
                Tier::Main
            },
            lcu_size: 1
                << (sps.log2_min_luma_coding_block_size_minus3
                    + 3
                    + sps.log2_diff_max_min_luma_coding_block_size),
            ..Default::default()
        };

        if sps.vui_parameters_present_flag && sps.vui.timing_info_present_flag {
            config.framerate = (sps.vui.time_scale, sps.vui.num_units_in_tick);
        }

        let hrd = &sps.vui.hrd;
        if sps.vui.hrd_parameters_present_flag && hrd.nal_hrd_parameters_present_flag {
            let cpb0 = &hrd.sl[0].cpb[0];
            let bitrate = u64::from(cpb0.bit_rate_value_minus1 + 1) << (6 + hrd.bit_rate_scale);
            config.rate_control = RateControl::ConstantBitrate(bitrate);
            config.max_bitrate = bitrate;
            config.buffer_size_kb =
                ((cpb0.cpb_size_value_minus1 + 1) << (4 + hrd.cpb_size_scale)) / 8000;
            if !cpb0.cbr_flag {
                // the peak rate is not recoverable, leave headroom
                config.max_bitrate = bitrate * 2;
            }
        } else if let Some(id) = pps_id {
            if let Some(pps) = parser.get_pps(id) {
                let qp = (i32::from(pps.init_qp_minus26) + 26).clamp(1, 51) as u32;
                config.rate_control = RateControl::ConstantQuality(qp);
            }
        }

        if let Some(pps) = pps_id.and_then(|id| parser.get_pps(id)) {
            config.num_ref_active_p = [pps.num_ref_idx_l0_default_active_minus1 + 1; 8];
            config.num_ref_active_bl0 = [pps.num_ref_idx_l0_default_active_minus1 + 1; 8];
            config.num_ref_active_bl1 = [pps.num_ref_idx_l1_default_active_minus1 + 1; 8];
            config.num_tile_columns = pps.num_tile_columns_minus1 + 1;
            config.num_tile_rows = pps.num_tile_rows_minus1 + 1;
        }

        Ok(config)
    }
}

/// Smallest scale such that the value sheds `base + scale + 1` trailing zero
/// bits, per the E.3.3 bit_rate/cpb_size coding.
fn hrd_scale(value: u32, base: u8, start: u8) -> u8 {
    let mut scale = start;
    while scale < 16 && value & ((1u32 << (base + scale + 1)) - 1) == 0 {
        scale += 1;
    }
    scale
}

fn fill_hrd(vui: &mut Vui, bitrate_bps: u32, cpb_bits: u32, cbr: bool) {
    let bit_rate_scale = hrd_scale(bitrate_bps, 6, 0);
    let cpb_size_scale = hrd_scale(cpb_bits, 4, 2);

    vui.hrd_parameters_present_flag = true;

    let hrd = &mut vui.hrd;
    hrd.nal_hrd_parameters_present_flag = true;
    hrd.bit_rate_scale = bit_rate_scale;
    hrd.cpb_size_scale = cpb_size_scale;
    hrd.initial_cpb_removal_delay_length_minus1 = 23;
    hrd.au_cpb_removal_delay_length_minus1 = 23;
    hrd.dpb_output_delay_length_minus1 = 23;
    hrd.sl[0].fixed_pic_rate_general_flag = true;
    hrd.sl[0].cpb_cnt_minus1 = 0;
    hrd.sl[0].cpb[0] = Cpb {
        bit_rate_value_minus1: (bitrate_bps >> (6 + bit_rate_scale)).max(1) - 1,
        cpb_size_value_minus1: (cpb_bits >> (4 + cpb_size_scale)).max(1) - 1,
        cbr_flag: cbr,
    };
}

/// Builds the VPS, SPS and PPS for a resolved configuration.
pub fn sync_param_to_headers(config: &EncoderConfig) -> EncodeResult<(Vps, Sps, Pps)> {
    let gop = config.gop_params();
    let tl = config.temporal_layers();
    let (coded_w, coded_h) = config.coded_size();
    let level = config.level.unwrap_or(Level::L1);
    let num_layers = tl.num_layers();

    let mut vps = Vps::default();
    let mut sps = Sps::default();
    let mut pps = Pps::default();

    vps.reserved_three_2bits = 3;
    vps.max_sub_layers_minus1 = num_layers - 1;
    vps.temporal_id_nesting_flag = true;
    vps.reserved_0xffff_16bits = 0xffff;

    vps.general.profile_idc = config.profile.unwrap_or_default() as u8;
    vps.general.profile_compatibility_flags = 1 << (31 - vps.general.profile_idc);
    vps.general.tier_flag = config.tier == Tier::High;
    vps.general.progressive_source_flag = true;
    vps.general.frame_only_constraint_flag = true;
    vps.general.level_idc = level as u8;

    let top = usize::from(num_layers - 1);
    vps.sub_layer[top].ordering.max_dec_pic_buffering_minus1 = config.num_ref_frames;
    vps.sub_layer[top].ordering.max_num_reorder_pics = std::cmp::min(
        num_reorder_frames(config.gop_ref_dist, gop.b_pyramid),
        config.num_ref_frames,
    );

    vps.timing_info_present_flag = true;
    vps.num_units_in_tick = config.framerate.1;
    vps.time_scale = config.framerate.0;

    sps.max_sub_layers_minus1 = vps.max_sub_layers_minus1;
    sps.temporal_id_nesting_flag = true;
    sps.general = vps.general;
    sps.sub_layer = vps.sub_layer;
    sps.chroma_format_idc = 1;
    sps.pic_width_in_luma_samples = coded_w;
    sps.pic_height_in_luma_samples = coded_h;

    // 4:2:0 crop units are two samples wide
    sps.conf_win_right_offset = (coded_w - config.resolution.width) / 2;
    sps.conf_win_bottom_offset = (coded_h - config.resolution.height) / 2;
    sps.conformance_window_flag =
        sps.conf_win_right_offset != 0 || sps.conf_win_bottom_offset != 0;

    sps.bit_depth_luma_minus8 = config.bit_depth - 8;
    sps.bit_depth_chroma_minus8 = config.bit_depth - 8;
    sps.log2_max_pic_order_cnt_lsb_minus4 =
        (ceil_log2(config.gop_ref_dist + u32::from(config.num_ref_frames)) as i32 - 1)
            .clamp(0, 12) as u8;

    sps.log2_min_luma_coding_block_size_minus3 = 0;
    sps.log2_diff_max_min_luma_coding_block_size = ceil_log2(config.lcu_size) - 3;
    sps.log2_min_transform_block_size_minus2 = 0;
    sps.log2_diff_max_min_transform_block_size = 3;
    sps.max_transform_hierarchy_depth_inter = 2;
    sps.max_transform_hierarchy_depth_intra = 2;
    sps.amp_enabled_flag = true;
    sps.sample_adaptive_offset_enabled_flag = true;

    let rps_par = SpsRpsParams {
        gop: &gop,
        tl: &tl,
        num_ref_active_p: config.num_ref_active_p,
        num_ref_active_bl0: config.num_ref_active_bl0,
        num_ref_active_bl1: config.num_ref_active_bl1,
        low_power: config.low_power,
        num_slices: u32::from(config.num_slices),
    };
    strps::build_sps_sets(&rps_par, &mut sps)?;

    sps.temporal_mvp_enabled_flag = true;
    sps.strong_intra_smoothing_enabled_flag = false;

    sps.vui_parameters_present_flag = true;
    sps.vui.timing_info_present_flag = true;
    sps.vui.num_units_in_tick = config.framerate.1;
    sps.vui.time_scale = config.framerate.0;
    sps.vui.frame_field_info_present_flag = config.pic_timing_sei;

    if config.hrd_conformance && matches!(config.rate_control, RateControl::ConstantBitrate(_)) {
        fill_hrd(
            &mut sps.vui,
            config.max_bitrate as u32,
            config.buffer_size_kb * 8000,
            config.is_cbr(),
        );
    }

    pps.num_ref_idx_l0_default_active_minus1 =
        std::cmp::max(config.num_ref_active_p[0], config.num_ref_active_bl0[0]) - 1;
    pps.num_ref_idx_l1_default_active_minus1 = config.num_ref_active_bl1[0] - 1;

    if matches!(config.rate_control, RateControl::ConstantQuality(_)) {
        let qp = if config.gop_size == 1 {
            config.qp_i
        } else if config.gop_ref_dist == 1 {
            config.qp_p
        } else {
            config.qp_b
        };
        pps.init_qp_minus26 = (i32::from(qp) - 26 - 6 * i32::from(config.bit_depth - 8)) as i8;
    }

    if config.num_tile_columns > 1 || config.num_tile_rows > 1 {
        pps.tiles_enabled_flag = true;
        pps.uniform_spacing_flag = true;
        pps.num_tile_columns_minus1 = config.num_tile_columns - 1;
        pps.num_tile_rows_minus1 = config.num_tile_rows - 1;
        pps.loop_filter_across_tiles_enabled_flag = true;
    }

    pps.loop_filter_across_slices_enabled_flag = true;
    pps.deblocking_filter_control_present_flag = true;
    pps.deblocking_filter_override_enabled_flag = true;
    pps.lists_modification_present_flag = true;

    Ok((vps, sps, pps))
}

/// Per-frame controls submitted alongside the raw frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameControl {
    /// QP override for constant-quality mode; 0 keeps the ladder QP.
    pub qp: u8,
    /// Requests an all-skip frame where the GOP position permits one.
    pub skip: bool,
    /// Frame order of a reconstructed frame to mark long-term.
    pub mark_ltr: Option<u32>,
}

/// Everything the backend needs to encode one frame, produced in encoding
/// order by [`Encoder::next_task`].
#[derive(Clone, Debug)]
pub struct Task {
    pub metadata: FrameMetadata,
    pub ctrl: FrameControl,
    pub frame: FrameBaseInfo,

    /// Slice QP for constant-quality mode, bit-depth offset applied.
    pub qp_y: i8,
    /// P frame encoded as a low-delay B.
    pub ldb: bool,
    pub skip: bool,
    /// The reconstructed frame becomes a long-term reference.
    pub ltr: bool,
    pub insert_headers: u16,

    pub dpb_before: Dpb,
    pub dpb_active: Dpb,
    pub dpb_after: Dpb,
    pub rpl: Rpl,
    pub coding_type: u8,

    pub sh_nut: NaluType,
    pub sh: SliceHeader,

    /// Encoding order, 0-based.
    pub eo: u32,
    pub dpb_output_delay: u32,
    pub last_ipoc: i32,
    pub last_rap: i32,
    /// Reconstructed surface slot for this frame.
    pub idx_rec: u8,
    /// Decode timestamp in the timebase of [`FrameMetadata::timestamp`].
    pub dts: i64,
    pub recode: u8,
}

impl HasFrameInfo for Task {
    fn info(&self) -> &FrameBaseInfo {
        &self.frame
    }

    fn info_mut(&mut self) -> &mut FrameBaseInfo {
        &mut self.frame
    }
}

/// Rolling state of the previous encoded frame.
#[derive(Clone, Copy, Debug)]
struct PrevState {
    eo: Option<u32>,
    poc: i32,
    last_ipoc: i32,
    last_rap: i32,
    dpb_active: Dpb,
    dpb_after: Dpb,
}

impl Default for PrevState {
    fn default() -> Self {
        Self {
            eo: None,
            poc: 0,
            last_ipoc: 0,
            last_rap: 0,
            dpb_active: Dpb::default(),
            dpb_after: Dpb::default(),
        }
    }
}

/// Smallest reconstructed-surface slot not referenced by the DPB.
fn free_rec_idx(dpb: &Dpb) -> u8 {
    (0..MAX_DPB_SIZE as u8)
        .find(|&i| dpb.iter().all(|f| f.idx_rec != i))
        .unwrap_or(IDX_INVALID)
}

/// H.265 encoder session.
pub struct Encoder {
    config: EncoderConfig,
    gop: GopParams,
    tl: TemporalLayers,
    vps: Vps,
    sps: Sps,
    pps: Pps,
    hrd: Hrd,

    raw: VecDeque<Task>,
    frame_order: u32,
    idr_fo: u32,
    last_bp_eo: u32,
    prev: PrevState,
}

impl Encoder {
    pub fn new(mut config: EncoderConfig) -> EncodeResult<Self> {
        if config.resolve()? == ParamCheck::Incompatible {
            log::warn!("encoder configuration was adjusted to a working combination");
        }

        let gop = config.gop_params();
        let tl = config.temporal_layers();
        let (vps, sps, pps) = sync_param_to_headers(&config)?;
        let hrd = Hrd::new(&sps, config.initial_delay_kb);

        Ok(Self {
            config,
            gop,
            tl,
            vps,
            sps,
            pps,
            hrd,
            raw: VecDeque::new(),
            frame_order: 0,
            idr_fo: 0,
            last_bp_eo: 0,
            prev: PrevState::default(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn vps(&self) -> &Vps {
        &self.vps
    }

    pub fn sps(&self) -> &Sps {
        &self.sps
    }

    pub fn pps(&self) -> &Pps {
        &self.pps
    }

    /// Applies mid-stream tuning. The rate-control mode is fixed for the
    /// session; a bitrate change rescales the HRD in place.
    pub fn tune(&mut self, tunings: Tunings) -> EncodeResult<()> {
        if !RateControl::is_same_variant(&tunings.rate_control, &self.config.rate_control) {
            return Err(EncodeError::Unsupported(
                "the rate control mode cannot change mid-stream".into(),
            ));
        }

        if let Some(target) = tunings.rate_control.bitrate_target() {
            let cbr = self.config.is_cbr();
            self.config.max_bitrate = if cbr {
                target
            } else {
                std::cmp::max(self.config.max_bitrate, target)
            };
            self.config.rate_control = tunings.rate_control;

            fill_hrd(
                &mut self.sps.vui,
                self.config.max_bitrate as u32,
                self.config.buffer_size_kb * 8000,
                cbr,
            );
            self.hrd.reset(&self.sps);
        } else {
            self.config.rate_control = tunings.rate_control;
        }

        if tunings.framerate > 0 {
            self.config.framerate = (tunings.framerate, 1);
            self.vps.num_units_in_tick = 1;
            self.vps.time_scale = tunings.framerate;
            self.sps.vui.num_units_in_tick = 1;
            self.sps.vui.time_scale = tunings.framerate;
        }

        Ok(())
    }

    /// Accepts one frame in display order.
    pub fn queue_frame(&mut self, metadata: FrameMetadata, ctrl: FrameControl) {
        let fo = self.frame_order;
        self.frame_order += 1;

        let mut frame_type = get_frame_type(&self.gop, fo - self.idr_fo);

        if metadata.force_keyframe && !is_idr(frame_type) {
            frame_type = FRAME_I | FRAME_REF | FRAME_IDR;

            // a pending B would need a reference from beyond the new IDR
            if let Some(last) = self.raw.back_mut() {
                if is_b(last.frame.frame_type) {
                    last.frame.frame_type = FRAME_P | FRAME_REF;
                }
            }
        }

        if is_idr(frame_type) {
            self.idr_fo = fo;
        }

        self.raw.push_back(Task {
            metadata,
            ctrl,
            frame: FrameBaseInfo {
                fo,
                poc: (fo - self.idr_fo) as i32,
                frame_type,
                ..Default::default()
            },
            qp_y: 0,
            ldb: false,
            skip: false,
            ltr: false,
            insert_headers: 0,
            dpb_before: Dpb::default(),
            dpb_active: Dpb::default(),
            dpb_after: Dpb::default(),
            rpl: Rpl::default(),
            coding_type: 0,
            sh_nut: NaluType::TrailN,
            sh: SliceHeader::default(),
            eo: 0,
            dpb_output_delay: 0,
            last_ipoc: 0,
            last_rap: 0,
            idx_rec: IDX_INVALID,
            dts: 0,
            recode: 0,
        });
    }

    pub fn num_pending(&self) -> usize {
        self.raw.len()
    }

    /// Picks the next frame in encoding order and derives its full encoding
    /// state. Returns `None` while B frames wait for their references; with
    /// `flush` the queue drains unconditionally.
    pub fn next_task(&mut self, flush: bool) -> EncodeResult<Option<Task>> {
        let idx =
            match reorder(&self.gop, &self.prev.dpb_after, self.raw.make_contiguous(), flush) {
                Some(idx) => idx,
                None => return Ok(None),
            };

        let Some(mut task) = self.raw.remove(idx) else {
            return Err(EncodeError::InvalidInternalState);
        };

        self.configure_task(&mut task)?;
        Ok(Some(task))
    }

    fn configure_task(&mut self, task: &mut Task) -> EncodeResult<()> {
        let prev = self.prev;
        let bd_off = 6 * i32::from(self.config.bit_depth - 8);
        let max_qp = 51 + bd_off;

        task.last_ipoc = prev.last_ipoc;
        task.last_rap = prev.last_rap;

        // the top temporal layer is never referenced
        if self.tl.is_scalable() {
            task.frame.tid = if is_i(task.frame.frame_type) {
                0
            } else {
                self.tl.tid_of((task.frame.poc - prev.last_ipoc) as u32)
            };
            if task.frame.tid == self.tl.highest_tid() {
                task.frame.frame_type &= !FRAME_REF;
            }
        }

        // frame skipping works for non-references, and for the P of an IPPP
        // cadence which then gives up its reference role
        task.skip = task.ctrl.skip
            && (!is_ref(task.frame.frame_type)
                || (self.gop.gop_ref_dist == 1 && is_p(task.frame.frame_type)));
        if task.skip {
            task.frame.frame_type &= !FRAME_REF;
        }

        if matches!(self.config.rate_control, RateControl::ConstantQuality(_)) {
            let mut qp = if is_b(task.frame.frame_type) {
                if self.gop.b_pyramid {
                    if task.frame.level == 0 {
                        i32::from(self.config.qp_p)
                    } else {
                        let layer = (task.frame.level as i32 - 1).clamp(0, 7) as usize;
                        (i32::from(self.config.qp_offset[layer]) + i32::from(self.config.qp_b))
                            .clamp(1, max_qp)
                    }
                } else {
                    i32::from(self.config.qp_b)
                }
            } else if is_p(task.frame.frame_type) {
                let mut qp = i32::from(self.config.qp_p);
                if self.gop.is_low_delay() {
                    let layer = p_layer(&self.gop, (task.frame.poc - prev.last_ipoc) as u32);
                    qp += i32::from(self.config.qp_offset[usize::from(layer)]);
                }
                qp
            } else {
                i32::from(self.config.qp_i)
            };

            if task.ctrl.qp > 0 {
                qp = i32::from(task.ctrl.qp).clamp(1, max_qp);
            }

            // the slice QP space extends below zero by the bit-depth offset
            task.qp_y = (qp - bd_off).max(0) as i8;
        }

        let was_b = is_b(task.frame.frame_type);
        if self.config.gpb && is_p(task.frame.frame_type) {
            task.frame.frame_type &= !FRAME_P;
            task.frame.frame_type |= FRAME_B;
            task.ldb = true;
        }

        task.eo = prev.eo.map_or(0, |eo| eo + 1);
        let top = usize::from(self.sps.max_sub_layers_minus1);
        let reorder_pics = u32::from(self.sps.sub_layer[top].ordering.max_num_reorder_pics);
        task.dpb_output_delay = (task.frame.fo + reorder_pics).saturating_sub(task.eo);

        task.dpb_before = prev.dpb_after;
        task.dpb_active = if is_idr(task.frame.frame_type) {
            Dpb::default()
        } else {
            let first_trail = task.frame.poc > prev.last_rap && prev.poc <= prev.last_rap;
            init_dpb(
                &prev.dpb_after,
                first_trail,
                prev.last_rap,
                task.frame.tid,
                &[],
            )
        };
        task.idx_rec = free_rec_idx(&task.dpb_before);

        if !is_i(task.frame.frame_type) {
            let num_ref = if was_b {
                let layer = if self.gop.b_pyramid {
                    (task.frame.level as i32 - 1).clamp(0, 7) as usize
                } else {
                    0
                };
                [
                    self.config.num_ref_active_bl0[layer],
                    self.config.num_ref_active_bl1[layer],
                ]
            } else {
                let layer =
                    usize::from(p_layer(&self.gop, (task.frame.poc - prev.last_ipoc) as u32));
                let l1 = if self.config.low_power {
                    self.config.num_ref_active_p[layer]
                } else {
                    std::cmp::min(
                        self.config.num_ref_active_p[layer],
                        self.config.num_ref_active_bl1[0],
                    )
                };
                [self.config.num_ref_active_p[layer], l1]
            };

            task.rpl = construct_rpl(
                &self.gop,
                &task.dpb_active,
                was_b,
                task.frame.poc,
                task.frame.tid,
                num_ref,
            )?;
        }

        task.coding_type =
            get_coding_type(&task.dpb_active, &task.rpl, task.frame.frame_type, task.ldb);

        task.insert_headers = 0;
        if self.config.aud {
            task.insert_headers |= INSERT_AUD;
        }
        if is_idr(task.frame.frame_type) {
            task.insert_headers |= INSERT_VPS | INSERT_SPS | INSERT_PPS;
            if self.hrd.enabled() {
                task.insert_headers |= INSERT_BPSEI;
            }
        } else if self.config.repeat_pps {
            task.insert_headers |= INSERT_PPS;
        }
        if self.config.pic_timing_sei || self.hrd.enabled() {
            task.insert_headers |= INSERT_PTSEI;
        }

        let rec = DpbFrame {
            poc: task.frame.poc,
            fo: task.frame.fo,
            tid: task.frame.tid,
            frame_type: task.frame.frame_type,
            level: task.frame.level,
            ltr: false,
            ldb: task.ldb,
            coding_type: task.coding_type,
            idx_rec: task.idx_rec,
        };

        task.dpb_after = task.dpb_active;
        if is_ref(task.frame.frame_type) {
            if is_i(task.frame.frame_type) {
                task.last_ipoc = task.frame.poc;
            }

            let marked: Vec<u32> = task.ctrl.mark_ltr.into_iter().collect();
            update_dpb(&self.gop, &rec, &mut task.dpb_after, &marked)?;

            if self.gop.ltr_interval > 0 {
                task.ltr =
                    is_ltr_candidate(&task.dpb_after, self.gop.ltr_interval, task.frame.poc);
            }
        }

        task.sh_nut = sh_nut(&rec, &task.dpb_after, task.last_rap, self.config.rap_intra);
        if task.sh_nut.is_idr() || task.sh_nut.is_cra() {
            task.last_rap = task.frame.poc;
        }

        task.sh = self.gen_slice_header(task)?;

        let (extn, extd) = self.config.framerate;
        let frame_ticks = 90000.0 * f64::from(extd) / f64::from(extn.max(1));
        task.dts = task.metadata.timestamp as i64
            - (frame_ticks * f64::from(task.dpb_output_delay)) as i64;

        self.prev = PrevState {
            eo: Some(task.eo),
            poc: task.frame.poc,
            last_ipoc: task.last_ipoc,
            last_rap: task.last_rap,
            dpb_active: task.dpb_active,
            dpb_after: task.dpb_after,
        };

        Ok(())
    }

    /// Whether coding `poc_lt` as a long-term reference needs an explicit
    /// MSB cycle: the previous frame or its DPB holds another POC with the
    /// same lsb.
    fn forced_msb_present(&self, poc_lt: i32, max_poc_lsb: i32) -> bool {
        let lsb = |poc: i32| poc & (max_poc_lsb - 1);

        lsb(self.prev.poc) == lsb(poc_lt)
            || self
                .prev
                .dpb_active
                .iter()
                .any(|f| f.poc != poc_lt && lsb(f.poc) == lsb(poc_lt))
    }

    fn gen_slice_header(&self, task: &Task) -> EncodeResult<SliceHeader> {
        const INVALID_POC: i32 = i32::MIN;

        let sps = &self.sps;
        let pps = &self.pps;
        let dpb = &task.dpb_active;
        let num_ref_active = task.rpl.num_active;

        let mut s = SliceHeader {
            first_slice_segment_in_pic_flag: true,
            pic_parameter_set_id: pps.pic_parameter_set_id,
            type_: if is_b(task.frame.frame_type) {
                SLICE_TYPE_B
            } else if is_p(task.frame.frame_type) {
                SLICE_TYPE_P
            } else {
                SLICE_TYPE_I
            },
            ..Default::default()
        };

        if !task.sh_nut.is_idr() {
            s.strps = strps::construct(dpb, &task.rpl, task.frame.poc);
            s.pic_order_cnt_lsb = (task.frame.poc as u32) & (sps.max_pic_order_cnt_lsb() - 1);

            let num_sets = usize::from(sps.num_short_term_ref_pic_sets);
            match (0..num_sets).find(|&i| sps.strps[i].same_refs(&s.strps)) {
                Some(i) => {
                    s.short_term_ref_pic_set_sps_flag = true;
                    s.short_term_ref_pic_set_idx = i as u8;
                }
                None => strps::optimize(&sps.strps[..num_sets], num_sets, &mut s.strps, num_sets),
            }

            // active short-term references before/after the current frame
            let mut n_str = [0usize; 2];
            let mut str_poc = [[0i32; MAX_DPB_SIZE]; 2];
            let mut ltr_poc: Vec<i32> = Vec::new();

            for p in s.strps.pic[..s.strps.num_pics()].iter() {
                if p.used_by_curr_pic_sx_flag {
                    let after = usize::from(p.delta_poc > 0);
                    str_poc[after][n_str[after]] = task.frame.poc + i32::from(p.delta_poc);
                    n_str[after] += 1;
                }
            }

            let mut dpb_lt: Vec<i32> = dpb.iter().filter(|f| f.ltr).map(|f| f.poc).collect();
            if !dpb_lt.is_empty() {
                let max_poc_lsb = sps.max_pic_order_cnt_lsb() as i32;
                // delta_poc_msb_cycle_lt may only grow along the coded list
                dpb_lt.sort_unstable();

                let mut cycle_prev = 0i32;
                for poc_lt in dpb_lt.iter_mut() {
                    let cycle = task.frame.poc / max_poc_lsb - *poc_lt / max_poc_lsb;
                    let d_lsb = *poc_lt
                        - (task.frame.poc - cycle * max_poc_lsb - s.pic_order_cnt_lsb as i32);

                    for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                        if d_lsb == i32::from(sps.lt_ref_pic_poc_lsb_sps[i])
                            && strps::is_curr_lt(dpb, &task.rpl, *poc_lt)
                                == sps.used_by_curr_pic_lt_sps_flag[i]
                            && cycle >= cycle_prev
                        {
                            let lt = &mut s.lt[usize::from(s.num_long_term_sps)];
                            lt.lt_idx_sps = i as u8;
                            lt.used_by_curr_pic_lt_flag = sps.used_by_curr_pic_lt_sps_flag[i];
                            lt.poc_lsb_lt = u32::from(sps.lt_ref_pic_poc_lsb_sps[i]);
                            lt.delta_poc_msb_cycle_lt = (cycle - cycle_prev) as u32;
                            lt.delta_poc_msb_present_flag = lt.delta_poc_msb_cycle_lt != 0
                                || self.forced_msb_present(*poc_lt, max_poc_lsb);
                            cycle_prev = cycle;

                            let used = lt.used_by_curr_pic_lt_flag;
                            s.num_long_term_sps += 1;

                            if used {
                                if ltr_poc.len() >= MAX_NUM_LONG_TERM_PICS {
                                    return Err(EncodeError::InvalidInternalState);
                                }
                                ltr_poc.push(*poc_lt);
                            }

                            *poc_lt = INVALID_POC;
                            break;
                        }
                    }
                }

                cycle_prev = 0;
                for &poc_lt in dpb_lt.iter() {
                    if poc_lt == INVALID_POC {
                        continue;
                    }

                    let idx =
                        usize::from(s.num_long_term_sps) + usize::from(s.num_long_term_pics);
                    if idx >= MAX_NUM_LONG_TERM_PICS {
                        return Err(EncodeError::InvalidInternalState);
                    }

                    let cycle = task.frame.poc / max_poc_lsb - poc_lt / max_poc_lsb;
                    let d_lsb = poc_lt
                        - (task.frame.poc - cycle * max_poc_lsb - s.pic_order_cnt_lsb as i32);

                    let lt = &mut s.lt[idx];
                    lt.used_by_curr_pic_lt_flag = strps::is_curr_lt(dpb, &task.rpl, poc_lt);
                    lt.poc_lsb_lt = d_lsb as u32;
                    lt.delta_poc_msb_cycle_lt = (cycle - cycle_prev) as u32;
                    lt.delta_poc_msb_present_flag = lt.delta_poc_msb_cycle_lt != 0
                        || self.forced_msb_present(poc_lt, max_poc_lsb);
                    cycle_prev = cycle;

                    let used = lt.used_by_curr_pic_lt_flag;
                    s.num_long_term_pics += 1;

                    if used {
                        if ltr_poc.len() >= MAX_NUM_LONG_TERM_PICS {
                            return Err(EncodeError::InvalidInternalState);
                        }
                        ltr_poc.push(poc_lt);
                    }
                }
            }

            s.temporal_mvp_enabled_flag = sps.temporal_mvp_enabled_flag;

            let total = n_str[0] + n_str[1] + ltr_poc.len();
            if pps.lists_modification_present_flag && total > 0 {
                for j in 0..2 {
                    let num_temp = std::cmp::max(total, usize::from(num_ref_active[j]));
                    let mut temp: Vec<i32> = Vec::with_capacity(num_temp);

                    // the implicit list cycles the before/after/long-term
                    // pools until it is long enough
                    'fill: while temp.len() < num_temp {
                        for pool in [
                            &str_poc[j][..n_str[j]],
                            &str_poc[1 - j][..n_str[1 - j]],
                            &ltr_poc[..],
                        ] {
                            for &poc in pool {
                                if temp.len() == num_temp {
                                    break 'fill;
                                }
                                temp.push(poc);
                            }
                        }
                    }

                    for r in 0..usize::from(num_ref_active[j]) {
                        let poc_r = dpb[usize::from(task.rpl.list[j][r])].poc;
                        let i = temp.iter().position(|&p| p == poc_r).unwrap_or(num_temp);
                        s.list_entry_lx[j][r] = i as u8;
                        s.ref_pic_list_modification_flag_lx[j] |= i != r;
                    }
                }
            }
        }

        if sps.sample_adaptive_offset_enabled_flag {
            s.sao_luma_flag = true;
            s.sao_chroma_flag = true;
        }

        if !s.is_i() {
            s.num_ref_idx_active_override_flag = pps.num_ref_idx_l0_default_active_minus1 + 1
                != num_ref_active[0]
                || (s.is_b() && pps.num_ref_idx_l1_default_active_minus1 + 1 != num_ref_active[1]);
            s.num_ref_idx_l0_active_minus1 = num_ref_active[0] - 1;
            if s.is_b() {
                s.num_ref_idx_l1_active_minus1 = num_ref_active[1] - 1;
            }

            if s.temporal_mvp_enabled_flag {
                s.collocated_from_l0_flag = true;
            }

            s.five_minus_max_num_merge_cand = 0;
        }

        if matches!(self.config.rate_control, RateControl::ConstantQuality(_)) {
            s.slice_qp_delta = (i32::from(task.qp_y) - (i32::from(pps.init_qp_minus26) + 26)) as i8;
        }

        s.deblocking_filter_disabled_flag = pps.deblocking_filter_disabled_flag;
        s.beta_offset_div2 = pps.beta_offset_div2;
        s.tc_offset_div2 = pps.tc_offset_div2;
        s.loop_filter_across_slices_enabled_flag = pps.loop_filter_across_slices_enabled_flag;

        Ok(s)
    }

    /// Packs the non-slice NALs of the task's access unit, in the order the
    /// `insert_headers` bits mandate.
    pub fn packed_headers(&mut self, task: &Task) -> EncodeResult<Vec<u8>> {
        let insert = task.insert_headers;
        let mut out = Vec::new();

        if insert & INSERT_AUD != 0 {
            let pic_type = match task.sh.type_ {
                SLICE_TYPE_B => 2,
                SLICE_TYPE_P => 1,
                _ => 0,
            };
            Synthesizer::<Aud, _>::synthesize(&Aud { pic_type }, &mut out, true)?;
        }
        if insert & INSERT_VPS != 0 {
            Synthesizer::<Vps, _>::synthesize(&self.vps, &mut out, true)?;
        }
        if insert & INSERT_SPS != 0 {
            Synthesizer::<Sps, _>::synthesize(&self.sps, &mut out, true)?;
        }
        if insert & INSERT_PPS != 0 {
            Synthesizer::<Pps, _>::synthesize(&self.pps, &mut out, true)?;
        }

        let mut bp = None;
        if insert & INSERT_BPSEI != 0 {
            let mut payload = BufferingPeriod::default();
            payload.seq_parameter_set_id = self.sps.seq_parameter_set_id;
            payload.nal[0].initial_cpb_removal_delay = self.hrd.init_cpb_removal_delay(task.eo);
            payload.nal[0].initial_cpb_removal_offset = self.hrd.init_cpb_removal_delay_offset();
            self.last_bp_eo = task.eo;
            bp = Some(payload);
        }

        let mut pt = None;
        if insert & INSERT_PTSEI != 0 {
            pt = Some(PicTiming {
                pic_struct: 0,
                source_scan_type: 1,
                duplicate_flag: false,
                au_cpb_removal_delay_minus1: std::cmp::max(
                    task.eo.saturating_sub(self.last_bp_eo),
                    1,
                ) - 1,
                pic_dpb_output_delay: task.dpb_output_delay,
            });
        }

        if bp.is_some() || pt.is_some() {
            let sei = Sei {
                buffering_period: bp.as_ref(),
                pic_timing: pt.as_ref(),
            };
            Synthesizer::<Sei, _>::synthesize(&sei, &self.sps.vui, &mut out, true)?;
        }

        Ok(out)
    }

    /// Produces the complete access unit for a skipped frame: the packed
    /// headers plus a CABAC-coded slice of skip CUs.
    pub fn skip_frame(&mut self, task: &Task) -> EncodeResult<Vec<u8>> {
        let mut out = self.packed_headers(task)?;

        skip_slice::synthesize(
            task.sh_nut,
            task.frame.tid,
            &task.sh,
            &self.sps,
            &self.pps,
            self.sps.pic_size_in_ctbs_y(),
            &mut out,
        )?;

        Ok(out)
    }

    /// Books the coded access unit into the HRD and wraps it for the client.
    pub fn finish_task(&mut self, task: &Task, bitstream: Vec<u8>) -> CodedBitstreamBuffer {
        self.hrd.update(
            (bitstream.len() * 8) as u32,
            task.eo,
            task.insert_headers & INSERT_BPSEI != 0,
        );

        CodedBitstreamBuffer::new(task.metadata.clone(), bitstream)
    }

    /// Coarse buffer check after encoding: asks for a recode while the frame
    /// overflows the CPB (or badly underruns a CBR one) and the recode budget
    /// lasts.
    pub fn recode_check(&self, task: &mut Task, coded_bytes: usize) -> BrcStatus {
        let RateControl::ConstantBitrate(target) = self.config.rate_control else {
            return BrcStatus::Ok;
        };

        if task.recode >= self.config.num_recode {
            return BrcStatus::Ok;
        }

        let buffer_bytes = self.config.buffer_size_kb as usize * 1000;
        if buffer_bytes > 0 && coded_bytes > buffer_bytes {
            task.recode += 1;
            return BrcStatus::BigFrame;
        }

        let (extn, extd) = self.config.framerate;
        let avg_bytes = (target * u64::from(extd) / u64::from(extn.max(1)) / 8) as usize;
        if self.config.is_cbr() && coded_bytes * 16 < avg_bytes {
            task.recode += 1;
            return BrcStatus::SmallFrame;
        }

        BrcStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_hd_cbr() -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            rate_control: RateControl::ConstantBitrate(1_000_000),
            ..Default::default()
        }
    }

    fn cqp_config(gop_ref_dist: u32) -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            rate_control: RateControl::ConstantQuality(30),
            gop_size: 32,
            gop_ref_dist,
            b_pyramid: Some(false),
            gpb: false,
            ..Default::default()
        }
    }

    fn meta(timestamp: u64) -> FrameMetadata {
        FrameMetadata {
            timestamp,
            display_resolution: Resolution {
                width: 1280,
                height: 720,
            },
            force_keyframe: false,
        }
    }

    #[test]
    fn defaults_resolve_every_field() {
        let mut config = full_hd_cbr();

        assert_eq!(config.resolve().unwrap(), ParamCheck::Valid);

        assert_eq!(config.bit_depth, 8);
        assert_eq!(config.profile, Some(Profile::Main));
        assert_eq!(config.framerate, (30, 1));
        assert_eq!(config.gop_size, 0xffff);
        assert_eq!(config.gop_ref_dist, 8);
        assert_eq!(config.b_pyramid, Some(true));
        assert_eq!(config.num_ref_frames, min_ref_for_pyramid(8) as u8);
        assert_eq!(config.lcu_size, 64);
        assert_eq!(config.num_slices, 1);
        // CBR: peak equals target, two seconds of buffer, half pre-filled
        assert_eq!(config.max_bitrate, 1_000_000);
        assert_eq!(config.buffer_size_kb, 250);
        assert_eq!(config.initial_delay_kb, 125);
        assert_eq!(config.level, Some(Level::L4));
        assert_eq!(config.tier, Tier::Main);
        assert!(config.qp_offset.iter().any(|&o| o != 0));
    }

    #[test]
    fn explicit_values_pass_through() {
        let mut config = EncoderConfig {
            gop_ref_dist: 4,
            b_pyramid: Some(false),
            num_ref_frames: 2,
            level: Some(Level::L5),
            framerate: (60, 1),
            ..full_hd_cbr()
        };

        assert_eq!(config.resolve().unwrap(), ParamCheck::Valid);

        assert_eq!(config.gop_ref_dist, 4);
        assert_eq!(config.b_pyramid, Some(false));
        assert_eq!(config.num_ref_frames, 2);
        assert_eq!(config.level, Some(Level::L5));
        assert_eq!(config.framerate, (60, 1));
    }

    #[test]
    fn unsupported_configuration_is_an_error() {
        let mut config = EncoderConfig {
            bit_depth: 12,
            ..full_hd_cbr()
        };
        assert!(matches!(config.resolve(), Err(EncodeError::Unsupported(_))));

        let mut config = EncoderConfig {
            rate_control: RateControl::ConstantBitrate(0),
            ..full_hd_cbr()
        };
        assert!(matches!(config.resolve(), Err(EncodeError::Unsupported(_))));
    }

    #[test]
    fn temporal_layers_force_low_delay() {
        let mut config = EncoderConfig {
            gop_ref_dist: 8,
            p_pyramid: true,
            temporal_layer_scales: [1, 2, 0, 0, 0, 0, 0, 0],
            ..full_hd_cbr()
        };

        assert_eq!(config.resolve().unwrap(), ParamCheck::Incompatible);
        assert_eq!(config.gop_ref_dist, 1);
        assert!(!config.p_pyramid);
    }

    #[test]
    fn cqp_fills_the_qp_ladder() {
        let mut config = cqp_config(8);
        config.b_pyramid = Some(true);

        config.resolve().unwrap();

        assert_eq!(config.qp_i, 30);
        assert_eq!(config.qp_p, 31);
        assert_eq!(config.qp_b, 32);
        assert_eq!(config.qp_offset, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn headers_carry_conformance_window_and_timing() {
        let mut config = EncoderConfig {
            gop_ref_dist: 4,
            b_pyramid: Some(false),
            num_ref_frames: 3,
            ..full_hd_cbr()
        };
        config.resolve().unwrap();

        let (vps, sps, _) = sync_param_to_headers(&config).unwrap();

        assert_eq!(vps.reserved_three_2bits, 3);
        assert_eq!(vps.reserved_0xffff_16bits, 0xffff);
        assert!(vps.temporal_id_nesting_flag);
        assert_eq!(vps.num_units_in_tick, 1);
        assert_eq!(vps.time_scale, 30);
        assert_eq!(vps.general.level_idc, 120);
        assert_eq!(vps.general.profile_compatibility_flags, 1 << 30);

        assert_eq!(sps.pic_width_in_luma_samples, 1920);
        assert_eq!(sps.pic_height_in_luma_samples, 1088);
        assert!(sps.conformance_window_flag);
        assert_eq!(sps.conf_win_right_offset, 0);
        assert_eq!(sps.conf_win_bottom_offset, 4);

        // ceil_log2(4 + 3) - 1
        assert_eq!(sps.log2_max_pic_order_cnt_lsb_minus4, 2);
        assert_eq!(sps.log2_diff_max_min_luma_coding_block_size, 3);
        assert!(sps.num_short_term_ref_pic_sets > 0);
    }

    #[test]
    fn hrd_vui_scaling_golden_values() {
        let mut config = EncoderConfig {
            buffer_size_kb: 62,
            ..full_hd_cbr()
        };
        config.resolve().unwrap();

        let (_, sps, _) = sync_param_to_headers(&config).unwrap();
        let hrd = &sps.vui.hrd;

        assert!(sps.vui.hrd_parameters_present_flag);
        assert!(hrd.nal_hrd_parameters_present_flag);
        // 1 Mbps has 6 trailing zero bits: the scale stays 0
        assert_eq!(hrd.bit_rate_scale, 0);
        assert_eq!(hrd.sl[0].cpb[0].bit_rate_value_minus1, 15624);
        // 496000 bits divide by 128 but not 256
        assert_eq!(hrd.cpb_size_scale, 3);
        assert_eq!(hrd.sl[0].cpb[0].cpb_size_value_minus1, 3874);
        assert!(hrd.sl[0].cpb[0].cbr_flag);
        assert_eq!(hrd.initial_cpb_removal_delay_length_minus1, 23);
    }

    #[test]
    fn cqp_pps_init_qp() {
        let mut config = cqp_config(1);
        config.resolve().unwrap();

        let (_, _, pps) = sync_param_to_headers(&config).unwrap();
        // an IPPP stream inits from QPP
        assert_eq!(pps.init_qp_minus26, 31 - 26);
    }

    #[test]
    fn encode_order_and_headers_over_one_gop() {
        let _ = env_logger::try_init();

        let mut enc = Encoder::new(cqp_config(4)).unwrap();

        for i in 0..9 {
            enc.queue_frame(meta(i * 3000), FrameControl::default());
        }

        let mut tasks = Vec::new();
        while let Some(task) = enc.next_task(false).unwrap() {
            tasks.push(task);
        }

        let pocs: Vec<i32> = tasks.iter().map(|t| t.frame.poc).collect();
        assert_eq!(pocs, vec![0, 4, 1, 2, 3, 8, 5, 6, 7]);

        let idr = &tasks[0];
        assert_eq!(idr.sh_nut, NaluType::IdrWRadl);
        assert_eq!(idr.sh.type_, SLICE_TYPE_I);
        assert_eq!(idr.eo, 0);
        assert_ne!(idr.insert_headers & (INSERT_VPS | INSERT_SPS | INSERT_PPS), 0);
        // a CQP stream carries no SEI
        assert_eq!(idr.insert_headers & (INSERT_BPSEI | INSERT_PTSEI), 0);

        // one frame of reorder delay
        let delays: Vec<u32> = tasks.iter().map(|t| t.dpb_output_delay).collect();
        assert_eq!(delays, vec![1, 4, 0, 0, 0, 4, 0, 0, 0]);

        let p4 = &tasks[1];
        assert_eq!(p4.sh_nut, NaluType::TrailR);
        assert_eq!(p4.sh.type_, SLICE_TYPE_P);
        assert_eq!(p4.sh.pic_order_cnt_lsb, 4);
        // QPP against a QPB-based PPS init QP
        assert_eq!(p4.sh.slice_qp_delta, 31 - 32);

        let b1 = &tasks[2];
        assert_eq!(b1.sh.type_, SLICE_TYPE_B);
        assert_eq!(b1.sh.slice_qp_delta, 0);
        assert_eq!(b1.rpl.num_active[1], 1);
        assert_eq!(b1.dpb_active[usize::from(b1.rpl.list[0][0])].poc, 0);
        assert_eq!(b1.dpb_active[usize::from(b1.rpl.list[1][0])].poc, 4);

        for task in &tasks {
            assert!(task.dts <= task.metadata.timestamp as i64);
        }

        // non-IDR frames carry no parameter sets
        assert_eq!(tasks[1].insert_headers, 0);

        let headers = enc.packed_headers(&tasks[0]).unwrap();
        assert!(headers.starts_with(&[0, 0, 0, 1]));
        assert!(!headers.is_empty());
    }

    #[test]
    fn gpb_rewrites_p_to_low_delay_b() {
        let mut config = cqp_config(1);
        config.gpb = true;
        let mut enc = Encoder::new(config).unwrap();

        enc.queue_frame(meta(0), FrameControl::default());
        enc.queue_frame(meta(3000), FrameControl::default());

        let _idr = enc.next_task(false).unwrap().unwrap();
        let gpb = enc.next_task(false).unwrap().unwrap();

        assert!(gpb.ldb);
        assert!(is_b(gpb.frame.frame_type));
        assert_eq!(gpb.sh.type_, SLICE_TYPE_B);
        // L1 mirrors L0
        assert_eq!(gpb.rpl.list[1][0], gpb.rpl.list[0][0]);
    }

    #[test]
    fn forced_keyframe_resets_the_gop() {
        let mut enc = Encoder::new(cqp_config(4)).unwrap();

        for i in 0..3 {
            enc.queue_frame(meta(i * 3000), FrameControl::default());
        }
        let mut forced = meta(3 * 3000);
        forced.force_keyframe = true;
        enc.queue_frame(forced, FrameControl::default());

        let mut tasks = Vec::new();
        while let Some(task) = enc.next_task(false).unwrap() {
            tasks.push(task);
        }

        // the B queued right before the keyframe was turned into a P so the
        // GOP can close
        assert!(tasks
            .iter()
            .any(|t| t.frame.fo == 2 && is_p(t.frame.frame_type)));
        let idr = tasks.iter().find(|t| t.frame.fo == 3).unwrap();
        assert!(is_idr(idr.frame.frame_type));
        assert_eq!(idr.frame.poc, 0);
    }

    #[test]
    fn skip_request_gating() {
        let mut enc = Encoder::new(cqp_config(4)).unwrap();

        enc.queue_frame(meta(0), FrameControl::default());
        for i in 1..5 {
            enc.queue_frame(
                meta(i * 3000),
                FrameControl {
                    skip: true,
                    ..Default::default()
                },
            );
        }

        let _idr = enc.next_task(false).unwrap().unwrap();
        // the P anchor of a B GOP must not skip
        let p = enc.next_task(false).unwrap().unwrap();
        assert!(!p.skip);
        assert!(is_ref(p.frame.frame_type));

        // a plain B may
        let b = enc.next_task(false).unwrap().unwrap();
        assert!(b.skip);
        assert!(!is_ref(b.frame.frame_type));
    }

    #[test]
    fn skip_frame_produces_an_access_unit() {
        let mut enc = Encoder::new(cqp_config(4)).unwrap();

        enc.queue_frame(meta(0), FrameControl::default());
        enc.queue_frame(
            meta(3000),
            FrameControl {
                skip: true,
                ..Default::default()
            },
        );
        for i in 2..6 {
            enc.queue_frame(meta(i * 3000), FrameControl::default());
        }

        let _idr = enc.next_task(false).unwrap().unwrap();
        let _p = enc.next_task(false).unwrap().unwrap();
        let b = enc.next_task(false).unwrap().unwrap();
        assert!(b.skip);

        let au = enc.skip_frame(&b).unwrap();
        assert!(au.starts_with(&[0, 0, 1]) || au.starts_with(&[0, 0, 0, 1]));
        assert!(au.len() > 4);
    }

    #[test]
    fn flush_drains_trailing_bs() {
        let mut enc = Encoder::new(cqp_config(4)).unwrap();

        for i in 0..3 {
            enc.queue_frame(meta(i * 3000), FrameControl::default());
        }

        let _idr = enc.next_task(false).unwrap().unwrap();
        // both remaining frames are Bs with no future anchor
        assert!(enc.next_task(false).unwrap().is_none());

        let forced_p = enc.next_task(true).unwrap().unwrap();
        assert_eq!(forced_p.frame.poc, 2);
        let b = enc.next_task(true).unwrap().unwrap();
        assert_eq!(b.frame.poc, 1);
        assert!(enc.next_task(true).unwrap().is_none());
        assert_eq!(enc.num_pending(), 0);
    }

    #[test]
    fn hrd_stream_inserts_sei() {
        let mut config = full_hd_cbr();
        config.buffer_size_kb = 124;
        config.initial_delay_kb = 62;
        config.gop_ref_dist = 1;
        config.gpb = false;
        let mut enc = Encoder::new(config).unwrap();

        enc.queue_frame(meta(0), FrameControl::default());
        enc.queue_frame(meta(3000), FrameControl::default());

        let idr = enc.next_task(false).unwrap().unwrap();
        assert_ne!(idr.insert_headers & INSERT_BPSEI, 0);
        assert_ne!(idr.insert_headers & INSERT_PTSEI, 0);

        let headers = enc.packed_headers(&idr).unwrap();
        // VPS, SPS, PPS and a prefix SEI NAL
        let sei_header = [0x4e, 0x01];
        assert!(headers.windows(2).any(|w| w == sei_header));

        let coded = enc.finish_task(&idr, vec![0u8; 4000]);
        assert_eq!(coded.bitstream.len(), 4000);

        let p = enc.next_task(false).unwrap().unwrap();
        assert_eq!(p.insert_headers & INSERT_BPSEI, 0);
        assert_ne!(p.insert_headers & INSERT_PTSEI, 0);
    }

    #[test]
    fn ltr_session_emits_long_term_slice_fields() {
        let mut config = cqp_config(1);
        config.ltr_interval = 4;
        let mut enc = Encoder::new(config).unwrap();

        let mut saw_ltr_mark = false;
        let mut saw_lt_fields = false;

        for i in 0..12 {
            enc.queue_frame(meta(i * 3000), FrameControl::default());
            let task = enc.next_task(false).unwrap().unwrap();
            saw_ltr_mark |= task.ltr;
            saw_lt_fields |= task.sh.num_long_term_sps > 0 || task.sh.num_long_term_pics > 0;
        }

        assert!(saw_ltr_mark);
        assert!(saw_lt_fields);
        assert!(enc.sps().long_term_ref_pics_present_flag);
    }

    #[test]
    fn recode_loop_is_bounded() {
        let mut config = full_hd_cbr();
        config.num_recode = 2;
        let enc = Encoder::new(config).unwrap();

        let mut task = {
            let mut e = Encoder::new(full_hd_cbr()).unwrap();
            e.queue_frame(meta(0), FrameControl::default());
            e.next_task(true).unwrap().unwrap()
        };

        // 250 KB buffer: a 300 KB frame overflows until the budget runs out
        assert_eq!(enc.recode_check(&mut task, 300_000), BrcStatus::BigFrame);
        assert_eq!(enc.recode_check(&mut task, 300_000), BrcStatus::BigFrame);
        assert_eq!(enc.recode_check(&mut task, 300_000), BrcStatus::Ok);

        let mut task2 = task.clone();
        task2.recode = 0;
        // a severe CBR underrun asks for padding or a lower QP
        assert_eq!(enc.recode_check(&mut task2, 10), BrcStatus::SmallFrame);
        assert_eq!(enc.recode_check(&mut task2, 4000), BrcStatus::Ok);
    }

    #[test]
    fn tune_rescales_the_hrd() {
        let mut enc = Encoder::new(full_hd_cbr()).unwrap();

        enc.tune(Tunings {
            rate_control: RateControl::ConstantBitrate(2_000_000),
            framerate: 60,
            ..Default::default()
        })
        .unwrap();

        let cpb0 = &enc.sps().vui.hrd.sl[0].cpb[0];
        let rate =
            u64::from(cpb0.bit_rate_value_minus1 + 1) << (6 + enc.sps().vui.hrd.bit_rate_scale);
        assert_eq!(rate, 2_000_000);
        assert_eq!(enc.sps().vui.time_scale, 60);

        assert!(matches!(
            enc.tune(Tunings {
                rate_control: RateControl::ConstantQuality(30),
                ..Default::default()
            }),
            Err(EncodeError::Unsupported(_))
        ));
    }

    #[test]
    fn config_round_trips_through_coded_headers() {
        let mut config = full_hd_cbr();
        config.buffer_size_kb = 62;
        config.resolve().unwrap();

        let (_, sps, pps) = sync_param_to_headers(&config).unwrap();

        let mut data = Vec::new();
        Synthesizer::<Sps, _>::synthesize(&sps, &mut data, true).unwrap();
        Synthesizer::<Pps, _>::synthesize(&pps, &mut data, true).unwrap();

        let parsed = EncoderConfig::from_coded_headers(&data).unwrap();

        assert_eq!(parsed.resolution.width, 1920);
        assert_eq!(parsed.resolution.height, 1080);
        assert_eq!(parsed.bit_depth, 8);
        assert_eq!(parsed.profile, Some(Profile::Main));
        assert_eq!(parsed.level, Some(Level::L4));
        assert_eq!(parsed.framerate, (30, 1));
        assert_eq!(parsed.rate_control, RateControl::ConstantBitrate(1_000_000));
        assert_eq!(parsed.buffer_size_kb, 62);
    }

    #[test]
    fn reorder_frame_counts() {
        assert_eq!(num_reorder_frames(1, false), 0);
        assert_eq!(num_reorder_frames(2, false), 1);
        assert_eq!(num_reorder_frames(8, false), 1);
        // pyramid depth over seven Bs
        assert_eq!(num_reorder_frames(8, true), 3);
        assert_eq!(num_reorder_frames(4, true), 2);
    }
}
