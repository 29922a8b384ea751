// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of H.265 headers into NAL units.

use std::io::Write;

use thiserror::Error;

use crate::codec::h265::ceil_log2;
use crate::codec::h265::nalu_writer::NaluWriter;
use crate::codec::h265::nalu_writer::NaluWriterError;
use crate::codec::h265::syntax::BufferingPeriod;
use crate::codec::h265::syntax::HrdParams;
use crate::codec::h265::syntax::PicTiming;
use crate::codec::h265::syntax::Pps;
use crate::codec::h265::syntax::ProfileTierLevel;
use crate::codec::h265::syntax::ShortTermRefPicSet;
use crate::codec::h265::syntax::SliceHeader;
use crate::codec::h265::syntax::Sps;
use crate::codec::h265::syntax::Sublayer;
use crate::codec::h265::syntax::Vps;
use crate::codec::h265::syntax::Vui;
use crate::codec::h265::NaluType;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Vps {}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

impl private::NaluStruct for Aud {}

impl private::NaluStruct for Sei<'_> {}

/// Access unit delimiter payload: pic_type is 0 for I-only, 1 for I/P, 2 for
/// I/P/B access units.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aud {
    pub pic_type: u8,
}

/// Payloads for one prefix SEI NAL, emitted in the D.3.1 mandated order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sei<'a> {
    pub buffering_period: Option<&'a BufferingPeriod>,
    pub pic_timing: Option<&'a PicTiming>,
}

const PAYLOAD_TYPE_BUFFERING_PERIOD: u32 = 0;
const PAYLOAD_TYPE_PIC_TIMING: u32 = 1;

/// Extended Sample Aspect Ratio - H.265 Table E-1
const EXTENDED_SAR: u8 = 255;

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.f(1, 1u32)?;

        while !self.writer.aligned() {
            self.f(1, 0u32)?;
        }

        Ok(())
    }

    /// D.2.1 alignment at the end of one sei_payload(): present only when the
    /// payload does not already end on a byte boundary.
    fn payload_trailing_bits(&mut self) -> SynthesizerResult<()> {
        if !self.writer.aligned() {
            self.rbsp_trailing_bits()?;
        }

        Ok(())
    }

    /// The profile half of profile_tier_level(), shared between the general
    /// and the sub-layer entries.
    fn ptl_profile(&mut self, ptl: &ProfileTierLevel) -> SynthesizerResult<()> {
        self.u(2, ptl.profile_space)?;
        self.u(1, ptl.tier_flag)?;
        self.u(5, ptl.profile_idc)?;
        self.u(24, ptl.profile_compatibility_flags >> 8)?;
        self.u(8, ptl.profile_compatibility_flags & 0xff)?;
        self.u(1, ptl.progressive_source_flag)?;
        self.u(1, ptl.interlaced_source_flag)?;
        self.u(1, ptl.non_packed_constraint_flag)?;
        self.u(1, ptl.frame_only_constraint_flag)?;
        // reserved_zero_44bits
        self.u(24, 0u32)?;
        self.u(20, 0u32)?;

        Ok(())
    }

    fn profile_tier_level(
        &mut self,
        general: &ProfileTierLevel,
        sub_layer: &[Sublayer],
        max_sub_layers_minus1: u8,
    ) -> SynthesizerResult<()> {
        self.ptl_profile(general)?;
        self.u(8, general.level_idc)?;

        let max = usize::from(max_sub_layers_minus1);

        for sl in &sub_layer[..max] {
            self.u(1, sl.ptl.profile_present_flag)?;
            self.u(1, sl.ptl.level_present_flag)?;
        }

        if max > 0 {
            for _ in max..8 {
                // reserved_zero_2bits
                self.u(2, 0u32)?;
            }
        }

        for sl in &sub_layer[..max] {
            if sl.ptl.profile_present_flag {
                self.ptl_profile(&sl.ptl)?;
            }

            if sl.ptl.level_present_flag {
                self.u(8, sl.ptl.level_idc)?;
            }
        }

        Ok(())
    }

    /// The sub-layer ordering loop shared by VPS and SPS.
    fn sub_layer_ordering(
        &mut self,
        present: bool,
        sub_layer: &[Sublayer],
        max_sub_layers_minus1: u8,
    ) -> SynthesizerResult<()> {
        self.u(1, present)?;

        let start = if present {
            0
        } else {
            usize::from(max_sub_layers_minus1)
        };

        for sl in &sub_layer[start..=usize::from(max_sub_layers_minus1)] {
            self.ue(sl.ordering.max_dec_pic_buffering_minus1)?;
            self.ue(sl.ordering.max_num_reorder_pics)?;
            self.ue(sl.ordering.max_latency_increase_plus1)?;
        }

        Ok(())
    }

    fn hrd_parameters(
        &mut self,
        hrd: &HrdParams,
        common_inf_present: bool,
        max_sub_layers_minus1: u8,
    ) -> SynthesizerResult<()> {
        if hrd.vcl_hrd_parameters_present_flag || hrd.sub_pic_hrd_params_present_flag {
            return Err(SynthesizerError::Unsupported);
        }

        if common_inf_present {
            self.u(1, hrd.nal_hrd_parameters_present_flag)?;
            self.u(1, hrd.vcl_hrd_parameters_present_flag)?;

            if hrd.nal_hrd_parameters_present_flag {
                self.u(1, hrd.sub_pic_hrd_params_present_flag)?;
                self.u(4, hrd.bit_rate_scale)?;
                self.u(4, hrd.cpb_size_scale)?;
                self.u(5, hrd.initial_cpb_removal_delay_length_minus1)?;
                self.u(5, hrd.au_cpb_removal_delay_length_minus1)?;
                self.u(5, hrd.dpb_output_delay_length_minus1)?;
            }
        }

        for sl in &hrd.sl[..=usize::from(max_sub_layers_minus1)] {
            self.u(1, sl.fixed_pic_rate_general_flag)?;

            if !sl.fixed_pic_rate_general_flag {
                self.u(1, sl.fixed_pic_rate_within_cvs_flag)?;
            }

            if sl.fixed_pic_rate_general_flag || sl.fixed_pic_rate_within_cvs_flag {
                self.ue(sl.elemental_duration_in_tc_minus1)?;
            } else {
                self.u(1, sl.low_delay_hrd_flag)?;
            }

            if !sl.low_delay_hrd_flag {
                self.ue(sl.cpb_cnt_minus1)?;
            }

            if hrd.nal_hrd_parameters_present_flag {
                for cpb in &sl.cpb[..=usize::from(sl.cpb_cnt_minus1)] {
                    self.ue(cpb.bit_rate_value_minus1)?;
                    self.ue(cpb.cpb_size_value_minus1)?;
                    self.u(1, cpb.cbr_flag)?;
                }
            }
        }

        Ok(())
    }

    fn vui_parameters(&mut self, vui: &Vui, max_sub_layers_minus1: u8) -> SynthesizerResult<()> {
        self.u(1, vui.aspect_ratio_info_present_flag)?;
        if vui.aspect_ratio_info_present_flag {
            self.u(8, vui.aspect_ratio_idc)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui.sar_width)?;
                self.u(16, vui.sar_height)?;
            }
        }

        self.u(1, vui.overscan_info_present_flag)?;
        if vui.overscan_info_present_flag {
            self.u(1, vui.overscan_appropriate_flag)?;
        }

        self.u(1, vui.video_signal_type_present_flag)?;
        if vui.video_signal_type_present_flag {
            self.u(3, vui.video_format)?;
            self.u(1, vui.video_full_range_flag)?;
            self.u(1, vui.colour_description_present_flag)?;
            if vui.colour_description_present_flag {
                self.u(8, vui.colour_primaries)?;
                self.u(8, vui.transfer_characteristics)?;
                self.u(8, vui.matrix_coeffs)?;
            }
        }

        self.u(1, vui.chroma_loc_info_present_flag)?;
        if vui.chroma_loc_info_present_flag {
            self.ue(vui.chroma_sample_loc_type_top_field)?;
            self.ue(vui.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui.neutral_chroma_indication_flag)?;
        self.u(1, vui.field_seq_flag)?;
        self.u(1, vui.frame_field_info_present_flag)?;

        self.u(1, vui.default_display_window_flag)?;
        if vui.default_display_window_flag {
            self.ue(vui.def_disp_win_left_offset)?;
            self.ue(vui.def_disp_win_right_offset)?;
            self.ue(vui.def_disp_win_top_offset)?;
            self.ue(vui.def_disp_win_bottom_offset)?;
        }

        self.u(1, vui.timing_info_present_flag)?;
        if vui.timing_info_present_flag {
            self.u(32, vui.num_units_in_tick)?;
            self.u(32, vui.time_scale)?;
            self.u(1, vui.poc_proportional_to_timing_flag)?;
            if vui.poc_proportional_to_timing_flag {
                self.ue(vui.num_ticks_poc_diff_one_minus1)?;
            }
            self.u(1, vui.hrd_parameters_present_flag)?;
            if vui.hrd_parameters_present_flag {
                self.hrd_parameters(&vui.hrd, true, max_sub_layers_minus1)?;
            }
        }

        self.u(1, vui.bitstream_restriction_flag)?;
        if vui.bitstream_restriction_flag {
            self.u(1, vui.tiles_fixed_structure_flag)?;
            self.u(1, vui.motion_vectors_over_pic_boundaries_flag)?;
            self.u(1, vui.restricted_ref_pic_lists_flag)?;
            self.ue(vui.min_spatial_segmentation_idc)?;
            self.ue(vui.max_bytes_per_pic_denom)?;
            self.ue(vui.max_bits_per_min_cu_denom)?;
            self.ue(vui.log2_max_mv_length_horizontal)?;
            self.ue(vui.log2_max_mv_length_vertical)?;
        }

        Ok(())
    }

    /// st_ref_pic_set(idx). `sets` holds the SPS sets plus, when a slice
    /// signals its set inline, one extra entry at index `num_sps_sets`.
    fn short_term_ref_pic_set(
        &mut self,
        sets: &[ShortTermRefPicSet],
        num_sps_sets: usize,
        idx: usize,
    ) -> SynthesizerResult<()> {
        let strps = &sets[idx];

        if idx != 0 {
            self.u(1, strps.inter_ref_pic_set_prediction_flag)?;
        }

        if strps.inter_ref_pic_set_prediction_flag {
            if idx == num_sps_sets {
                self.ue(strps.delta_idx_minus1)?;
            }

            self.u(1, strps.delta_rps_sign)?;
            self.ue(strps.abs_delta_rps_minus1)?;

            let ref_rps_idx = idx - (usize::from(strps.delta_idx_minus1) + 1);
            let num_delta_pocs = sets[ref_rps_idx].num_pics();

            for pic in &strps.pic[..=num_delta_pocs] {
                self.u(1, pic.used_by_curr_pic_flag)?;

                if !pic.used_by_curr_pic_flag {
                    self.u(1, pic.use_delta_flag)?;
                }
            }
        } else {
            self.ue(strps.num_negative_pics)?;
            self.ue(strps.num_positive_pics)?;

            for pic in &strps.pic[..strps.num_pics()] {
                self.ue(pic.delta_poc_sx_minus1)?;
                self.u(1, pic.used_by_curr_pic_sx_flag)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Vps, W> {
    pub fn synthesize(vps: &'n Vps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: vps,
        };

        s.writer.write_header(NaluType::VpsNut, 0)?;
        s.video_parameter_set()?;
        s.rbsp_trailing_bits()
    }

    fn video_parameter_set(&mut self) -> SynthesizerResult<()> {
        let vps = self.nalu;

        // Layer sets and VPS-level HRD are not emitted.
        if vps.num_layer_sets_minus1 != 0 || vps.num_hrd_parameters != 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.u(4, vps.video_parameter_set_id)?;
        self.u(2, vps.reserved_three_2bits)?;
        self.u(6, vps.max_layers_minus1)?;
        self.u(3, vps.max_sub_layers_minus1)?;
        self.u(1, vps.temporal_id_nesting_flag)?;
        self.u(16, vps.reserved_0xffff_16bits)?;

        self.profile_tier_level(&vps.general, &vps.sub_layer, vps.max_sub_layers_minus1)?;
        self.sub_layer_ordering(
            vps.sub_layer_ordering_info_present_flag,
            &vps.sub_layer,
            vps.max_sub_layers_minus1,
        )?;

        self.u(6, vps.max_layer_id)?;
        self.ue(vps.num_layer_sets_minus1)?;

        self.u(1, vps.timing_info_present_flag)?;
        if vps.timing_info_present_flag {
            self.u(32, vps.num_units_in_tick)?;
            self.u(32, vps.time_scale)?;
            self.u(1, vps.poc_proportional_to_timing_flag)?;
            if vps.poc_proportional_to_timing_flag {
                self.ue(vps.num_ticks_poc_diff_one_minus1)?;
            }
            self.ue(vps.num_hrd_parameters)?;
        }

        // vps_extension_flag
        self.u(1, false)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(sps: &'n Sps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(NaluType::SpsNut, 0)?;
        s.seq_parameter_set()?;
        s.rbsp_trailing_bits()
    }

    fn seq_parameter_set(&mut self) -> SynthesizerResult<()> {
        let sps = self.nalu;

        if sps.scaling_list_enabled_flag
            || sps.pcm_enabled_flag
            || sps.separate_colour_plane_flag
            || sps.extension_flag
        {
            return Err(SynthesizerError::Unsupported);
        }

        self.u(4, sps.video_parameter_set_id)?;
        self.u(3, sps.max_sub_layers_minus1)?;
        self.u(1, sps.temporal_id_nesting_flag)?;

        self.profile_tier_level(&sps.general, &sps.sub_layer, sps.max_sub_layers_minus1)?;

        self.ue(sps.seq_parameter_set_id)?;
        self.ue(sps.chroma_format_idc)?;
        if sps.chroma_format_idc == 3 {
            self.u(1, sps.separate_colour_plane_flag)?;
        }

        self.ue(sps.pic_width_in_luma_samples)?;
        self.ue(sps.pic_height_in_luma_samples)?;

        self.u(1, sps.conformance_window_flag)?;
        if sps.conformance_window_flag {
            self.ue(sps.conf_win_left_offset)?;
            self.ue(sps.conf_win_right_offset)?;
            self.ue(sps.conf_win_top_offset)?;
            self.ue(sps.conf_win_bottom_offset)?;
        }

        self.ue(sps.bit_depth_luma_minus8)?;
        self.ue(sps.bit_depth_chroma_minus8)?;
        self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;

        self.sub_layer_ordering(
            sps.sub_layer_ordering_info_present_flag,
            &sps.sub_layer,
            sps.max_sub_layers_minus1,
        )?;

        self.ue(sps.log2_min_luma_coding_block_size_minus3)?;
        self.ue(sps.log2_diff_max_min_luma_coding_block_size)?;
        self.ue(sps.log2_min_transform_block_size_minus2)?;
        self.ue(sps.log2_diff_max_min_transform_block_size)?;
        self.ue(sps.max_transform_hierarchy_depth_inter)?;
        self.ue(sps.max_transform_hierarchy_depth_intra)?;

        self.u(1, sps.scaling_list_enabled_flag)?;
        self.u(1, sps.amp_enabled_flag)?;
        self.u(1, sps.sample_adaptive_offset_enabled_flag)?;
        self.u(1, sps.pcm_enabled_flag)?;

        self.ue(sps.num_short_term_ref_pic_sets)?;
        for idx in 0..usize::from(sps.num_short_term_ref_pic_sets) {
            self.short_term_ref_pic_set(
                &sps.strps,
                usize::from(sps.num_short_term_ref_pic_sets),
                idx,
            )?;
        }

        self.u(1, sps.long_term_ref_pics_present_flag)?;
        if sps.long_term_ref_pics_present_flag {
            self.ue(sps.num_long_term_ref_pics_sps)?;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                self.u(
                    usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                    sps.lt_ref_pic_poc_lsb_sps[i],
                )?;
                self.u(1, sps.used_by_curr_pic_lt_sps_flag[i])?;
            }
        }

        self.u(1, sps.temporal_mvp_enabled_flag)?;
        self.u(1, sps.strong_intra_smoothing_enabled_flag)?;

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters(&sps.vui, sps.max_sub_layers_minus1)?;
        }

        // sps_extension_flag
        self.u(1, false)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(pps: &'n Pps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(NaluType::PpsNut, 0)?;
        s.pic_parameter_set()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;

        if pps.scaling_list_data_present_flag
            || pps.slice_segment_header_extension_present_flag
            || pps.extension_flag
        {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.dependent_slice_segments_enabled_flag)?;
        self.u(1, pps.output_flag_present_flag)?;
        self.u(3, pps.num_extra_slice_header_bits)?;
        self.u(1, pps.sign_data_hiding_enabled_flag)?;
        self.u(1, pps.cabac_init_present_flag)?;
        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.se(pps.init_qp_minus26)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.transform_skip_enabled_flag)?;

        self.u(1, pps.cu_qp_delta_enabled_flag)?;
        if pps.cu_qp_delta_enabled_flag {
            self.ue(pps.diff_cu_qp_delta_depth)?;
        }

        self.se(pps.cb_qp_offset)?;
        self.se(pps.cr_qp_offset)?;
        self.u(1, pps.slice_chroma_qp_offsets_present_flag)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(1, pps.weighted_bipred_flag)?;
        self.u(1, pps.transquant_bypass_enabled_flag)?;
        self.u(1, pps.tiles_enabled_flag)?;
        self.u(1, pps.entropy_coding_sync_enabled_flag)?;

        if pps.tiles_enabled_flag {
            self.ue(pps.num_tile_columns_minus1)?;
            self.ue(pps.num_tile_rows_minus1)?;
            self.u(1, pps.uniform_spacing_flag)?;

            if !pps.uniform_spacing_flag {
                for i in 0..usize::from(pps.num_tile_columns_minus1) {
                    self.ue(u32::from(pps.column_width[i].max(1)) - 1)?;
                }
                for i in 0..usize::from(pps.num_tile_rows_minus1) {
                    self.ue(u32::from(pps.row_height[i].max(1)) - 1)?;
                }
            }

            self.u(1, pps.loop_filter_across_tiles_enabled_flag)?;
        }

        self.u(1, pps.loop_filter_across_slices_enabled_flag)?;

        self.u(1, pps.deblocking_filter_control_present_flag)?;
        if pps.deblocking_filter_control_present_flag {
            self.u(1, pps.deblocking_filter_override_enabled_flag)?;
            self.u(1, pps.deblocking_filter_disabled_flag)?;

            if !pps.deblocking_filter_disabled_flag {
                self.se(pps.beta_offset_div2)?;
                self.se(pps.tc_offset_div2)?;
            }
        }

        self.u(1, pps.scaling_list_data_present_flag)?;
        self.u(1, pps.lists_modification_present_flag)?;
        self.ue(pps.log2_parallel_merge_level_minus2)?;
        self.u(1, pps.slice_segment_header_extension_present_flag)?;

        // pps_extension_flag
        self.u(1, false)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    pub fn synthesize(
        nalu_type: NaluType,
        temporal_id: u8,
        slice: &'n SliceHeader,
        sps: &Sps,
        pps: &Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: slice,
        };

        s.writer.write_header(nalu_type, temporal_id)?;
        s.slice_segment_header(nalu_type, sps, pps)
    }

    /// Packs only the header fields and their byte alignment, without a start
    /// code, NAL header or emulation prevention, so that entropy-coded slice
    /// data can continue byte aligned in the same buffer.
    pub(crate) fn rbsp(
        nalu_type: NaluType,
        slice: &'n SliceHeader,
        sps: &Sps,
        pps: &Pps,
        writer: W,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, false),
            nalu: slice,
        };

        s.slice_segment_header(nalu_type, sps, pps)
    }

    fn slice_segment_header(
        &mut self,
        nalu_type: NaluType,
        sps: &Sps,
        pps: &Pps,
    ) -> SynthesizerResult<()> {
        let slice = self.nalu;

        self.u(1, slice.first_slice_segment_in_pic_flag)?;

        if nalu_type.is_irap() {
            self.u(1, slice.no_output_of_prior_pics_flag)?;
        }

        self.ue(slice.pic_parameter_set_id)?;

        if !slice.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                self.u(1, slice.dependent_slice_segment_flag)?;
            }

            let address_bits = ceil_log2(sps.pic_size_in_ctbs_y()) as usize;
            self.u(address_bits, slice.segment_address)?;
        }

        if !slice.dependent_slice_segment_flag {
            if pps.num_extra_slice_header_bits > 0 {
                self.u(usize::from(pps.num_extra_slice_header_bits), 0u32)?;
            }

            self.ue(slice.type_)?;

            if pps.output_flag_present_flag {
                self.u(1, slice.pic_output_flag)?;
            }

            if !nalu_type.is_idr() {
                self.u(
                    usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                    slice.pic_order_cnt_lsb,
                )?;

                self.u(1, slice.short_term_ref_pic_set_sps_flag)?;

                let num_sets = usize::from(sps.num_short_term_ref_pic_sets);

                if !slice.short_term_ref_pic_set_sps_flag {
                    let mut sets = sps.strps;
                    sets[num_sets] = slice.strps;
                    self.short_term_ref_pic_set(&sets, num_sets, num_sets)?;
                } else if sps.num_short_term_ref_pic_sets > 1 {
                    let idx_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets)) as usize;
                    self.u(idx_bits, slice.short_term_ref_pic_set_idx)?;
                }

                if sps.long_term_ref_pics_present_flag {
                    self.long_term_pics(sps)?;
                }

                if sps.temporal_mvp_enabled_flag {
                    self.u(1, slice.temporal_mvp_enabled_flag)?;
                }
            }

            if sps.sample_adaptive_offset_enabled_flag {
                self.u(1, slice.sao_luma_flag)?;
                self.u(1, slice.sao_chroma_flag)?;
            }

            if slice.is_p() || slice.is_b() {
                self.inter_slice_params(sps, pps)?;
            }

            self.se(slice.slice_qp_delta)?;

            if pps.slice_chroma_qp_offsets_present_flag {
                self.se(slice.slice_cb_qp_offset)?;
                self.se(slice.slice_cr_qp_offset)?;
            }

            if pps.deblocking_filter_override_enabled_flag {
                self.u(1, slice.deblocking_filter_override_flag)?;
            }

            if slice.deblocking_filter_override_flag {
                self.u(1, slice.deblocking_filter_disabled_flag)?;

                if !slice.deblocking_filter_disabled_flag {
                    self.se(slice.beta_offset_div2)?;
                    self.se(slice.tc_offset_div2)?;
                }
            }

            if pps.loop_filter_across_slices_enabled_flag
                && (slice.sao_luma_flag
                    || slice.sao_chroma_flag
                    || !slice.deblocking_filter_disabled_flag)
            {
                self.u(1, slice.loop_filter_across_slices_enabled_flag)?;
            }
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            if slice.num_entry_point_offsets != 0 {
                return Err(SynthesizerError::Unsupported);
            }

            self.ue(slice.num_entry_point_offsets)?;
        }

        self.rbsp_trailing_bits()
    }

    fn long_term_pics(&mut self, sps: &Sps) -> SynthesizerResult<()> {
        let slice = self.nalu;

        if sps.num_long_term_ref_pics_sps > 0 {
            self.ue(slice.num_long_term_sps)?;
        }

        self.ue(slice.num_long_term_pics)?;

        let total = usize::from(slice.num_long_term_sps) + usize::from(slice.num_long_term_pics);
        for (i, lt) in slice.lt[..total].iter().enumerate() {
            if i < usize::from(slice.num_long_term_sps) {
                if sps.num_long_term_ref_pics_sps > 1 {
                    let bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps)) as usize;
                    self.u(bits, lt.lt_idx_sps)?;
                }
            } else {
                self.u(
                    usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                    lt.poc_lsb_lt,
                )?;
                self.u(1, lt.used_by_curr_pic_lt_flag)?;
            }

            self.u(1, lt.delta_poc_msb_present_flag)?;

            if lt.delta_poc_msb_present_flag {
                self.ue(lt.delta_poc_msb_cycle_lt)?;
            }
        }

        Ok(())
    }

    /// The number of references marked used-for-current across the slice's
    /// short-term set and long-term entries (7.4.7.2 NumPocTotalCurr).
    fn num_poc_total_curr(&self) -> u32 {
        let slice = self.nalu;
        let mut total = 0;

        for pic in &slice.strps.pic[..slice.strps.num_pics()] {
            total += u32::from(pic.used_by_curr_pic_sx_flag);
        }

        let num_lt = usize::from(slice.num_long_term_sps) + usize::from(slice.num_long_term_pics);
        for lt in &slice.lt[..num_lt] {
            total += u32::from(lt.used_by_curr_pic_lt_flag);
        }

        total
    }

    fn inter_slice_params(&mut self, sps: &Sps, pps: &Pps) -> SynthesizerResult<()> {
        let slice = self.nalu;

        self.u(1, slice.num_ref_idx_active_override_flag)?;
        if slice.num_ref_idx_active_override_flag {
            self.ue(slice.num_ref_idx_l0_active_minus1)?;

            if slice.is_b() {
                self.ue(slice.num_ref_idx_l1_active_minus1)?;
            }
        }

        let num_poc_total_curr = self.num_poc_total_curr();

        if pps.lists_modification_present_flag && num_poc_total_curr > 1 {
            let entry_bits = ceil_log2(num_poc_total_curr) as usize;

            self.u(1, slice.ref_pic_list_modification_flag_lx[0])?;
            if slice.ref_pic_list_modification_flag_lx[0] {
                for i in 0..=usize::from(slice.num_ref_idx_l0_active_minus1) {
                    self.u(entry_bits, slice.list_entry_lx[0][i])?;
                }
            }

            if slice.is_b() {
                self.u(1, slice.ref_pic_list_modification_flag_lx[1])?;
                if slice.ref_pic_list_modification_flag_lx[1] {
                    for i in 0..=usize::from(slice.num_ref_idx_l1_active_minus1) {
                        self.u(entry_bits, slice.list_entry_lx[1][i])?;
                    }
                }
            }
        }

        if slice.is_b() {
            self.u(1, slice.mvd_l1_zero_flag)?;
        }

        if pps.cabac_init_present_flag {
            self.u(1, slice.cabac_init_flag)?;
        }

        if slice.temporal_mvp_enabled_flag {
            if slice.is_b() {
                self.u(1, slice.collocated_from_l0_flag)?;
            }

            if (slice.collocated_from_l0_flag && slice.num_ref_idx_l0_active_minus1 > 0)
                || (!slice.collocated_from_l0_flag && slice.num_ref_idx_l1_active_minus1 > 0)
            {
                self.ue(slice.collocated_ref_idx)?;
            }
        }

        if (pps.weighted_pred_flag && slice.is_p())
            || (pps.weighted_bipred_flag && slice.is_b())
        {
            self.pred_weight_table(sps)?;
        }

        self.ue(slice.five_minus_max_num_merge_cand)?;

        Ok(())
    }

    fn pred_weight_table(&mut self, sps: &Sps) -> SynthesizerResult<()> {
        const Y: usize = 0;
        const CB: usize = 1;
        const CR: usize = 2;
        const WEIGHT: usize = 0;
        const OFFSET: usize = 1;

        let slice = self.nalu;

        let half_range_c = 1i32 << 7;
        let w_y = 1i16 << slice.luma_log2_weight_denom;
        let w_c = 1i16 << slice.chroma_log2_weight_denom;
        let l2_wd_c = slice.chroma_log2_weight_denom;

        self.ue(slice.luma_log2_weight_denom)?;

        if sps.chroma_format_idc != 0 {
            self.se(
                i32::from(slice.chroma_log2_weight_denom) - i32::from(slice.luma_log2_weight_denom),
            )?;
        }

        for l in 0..(1 + usize::from(slice.is_b())) {
            let sz = if l == 1 {
                usize::from(slice.num_ref_idx_l1_active_minus1) + 1
            } else {
                usize::from(slice.num_ref_idx_l0_active_minus1) + 1
            };

            let mut lumaw = 0u32;
            let mut chromaw = 0u32;

            for i in 0..sz {
                lumaw <<= 1;
                lumaw |=
                    u32::from(!(slice.pwt[l][i][Y][OFFSET] == 0 && slice.pwt[l][i][Y][WEIGHT] == w_y));
                chromaw <<= 1;
                chromaw |= u32::from(
                    !(slice.pwt[l][i][CB][OFFSET] == 0 && slice.pwt[l][i][CB][WEIGHT] == w_c),
                );
                chromaw |= u32::from(
                    !(slice.pwt[l][i][CR][OFFSET] == 0 && slice.pwt[l][i][CR][WEIGHT] == w_c),
                );
            }

            self.u(sz, lumaw)?;

            if sps.chroma_format_idc != 0 {
                self.u(sz, chromaw)?;
            } else {
                chromaw = 0;
            }

            for i in 0..sz {
                if lumaw & (1 << (sz - i - 1)) != 0 {
                    self.se(slice.pwt[l][i][Y][WEIGHT] - w_y)?;
                    self.se(slice.pwt[l][i][Y][OFFSET])?;
                }

                if chromaw & (1 << (sz - i - 1)) != 0 {
                    for plane in [CB, CR] {
                        self.se(slice.pwt[l][i][plane][WEIGHT] - w_c)?;
                        self.se(
                            (((half_range_c * i32::from(slice.pwt[l][i][plane][WEIGHT]))
                                >> l2_wd_c)
                                + i32::from(slice.pwt[l][i][plane][OFFSET])
                                - half_range_c)
                                .clamp(-4 * half_range_c, 4 * half_range_c - 1),
                        )?;
                    }
                }
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Aud, W> {
    pub fn synthesize(aud: &'n Aud, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: aud,
        };

        s.writer.write_header(NaluType::AudNut, 0)?;
        s.u(3, s.nalu.pic_type)?;
        s.rbsp_trailing_bits()
    }
}

impl<'n, W: Write> Synthesizer<'n, Sei<'n>, W> {
    pub fn synthesize(
        sei: &'n Sei<'n>,
        vui: &Vui,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sei,
        };

        s.writer.write_header(NaluType::PrefixSeiNut, 0)?;

        if let Some(bp) = s.nalu.buffering_period {
            let mut scratch = Vec::new();
            {
                let mut p = Synthesizer::<Sei, &mut Vec<u8>> {
                    writer: NaluWriter::new(&mut scratch, false),
                    nalu: s.nalu,
                };
                p.buffering_period_payload(bp, &vui.hrd)?;
                p.payload_trailing_bits()?;
            }
            s.sei_payload(PAYLOAD_TYPE_BUFFERING_PERIOD, &scratch)?;
        }

        if let Some(pt) = s.nalu.pic_timing {
            let mut scratch = Vec::new();
            {
                let mut p = Synthesizer::<Sei, &mut Vec<u8>> {
                    writer: NaluWriter::new(&mut scratch, false),
                    nalu: s.nalu,
                };
                p.pic_timing_payload(pt, vui)?;
                p.payload_trailing_bits()?;
            }
            s.sei_payload(PAYLOAD_TYPE_PIC_TIMING, &scratch)?;
        }

        s.rbsp_trailing_bits()
    }

    fn sei_payload(&mut self, payload_type: u32, payload: &[u8]) -> SynthesizerResult<()> {
        if payload.len() > 0xff {
            return Err(SynthesizerError::Unsupported);
        }

        self.u(8, payload_type)?;
        self.u(8, payload.len() as u32)?;
        self.writer.write_bytes(payload)?;

        Ok(())
    }

    fn buffering_period_payload(
        &mut self,
        bp: &BufferingPeriod,
        hrd: &HrdParams,
    ) -> SynthesizerResult<()> {
        if hrd.vcl_hrd_parameters_present_flag {
            return Err(SynthesizerError::Unsupported);
        }

        let init_len = usize::from(hrd.initial_cpb_removal_delay_length_minus1) + 1;
        let au_len = usize::from(hrd.au_cpb_removal_delay_length_minus1) + 1;
        let dpb_len = usize::from(hrd.dpb_output_delay_length_minus1) + 1;

        self.ue(bp.seq_parameter_set_id)?;
        self.u(1, bp.irap_cpb_params_present_flag)?;

        if bp.irap_cpb_params_present_flag {
            self.u(au_len, bp.cpb_delay_offset)?;
            self.u(dpb_len, bp.dpb_delay_offset)?;
        }

        self.u(1, bp.concatenation_flag)?;
        self.u(au_len, bp.au_cpb_removal_delay_delta_minus1)?;

        if hrd.nal_hrd_parameters_present_flag {
            for cpb in &bp.nal[..=usize::from(hrd.sl[0].cpb_cnt_minus1)] {
                self.u(init_len, cpb.initial_cpb_removal_delay)?;
                self.u(init_len, cpb.initial_cpb_removal_offset)?;
            }
        }

        Ok(())
    }

    fn pic_timing_payload(&mut self, pt: &PicTiming, vui: &Vui) -> SynthesizerResult<()> {
        let hrd = &vui.hrd;

        if vui.frame_field_info_present_flag {
            self.u(4, pt.pic_struct)?;
            self.u(2, pt.source_scan_type)?;
            self.u(1, pt.duplicate_flag)?;
        }

        if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
            self.u(
                usize::from(hrd.au_cpb_removal_delay_length_minus1) + 1,
                pt.au_cpb_removal_delay_minus1,
            )?;
            self.u(
                usize::from(hrd.dpb_output_delay_length_minus1) + 1,
                pt.pic_dpb_output_delay,
            )?;
        }

        Ok(())
    }
}
