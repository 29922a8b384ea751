// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of externally supplied H.265 parameter sets. This is the inverse
//! of the synthesizer for the syntax subset the encoder emits; anything
//! outside that subset is reported as unsupported rather than skipped.

use std::collections::BTreeMap;

use crate::bitstream::BitReader;
use crate::codec::h265::syntax::HrdParams;
use crate::codec::h265::syntax::Pps;
use crate::codec::h265::syntax::ProfileTierLevel;
use crate::codec::h265::syntax::ShortTermRefPicSet;
use crate::codec::h265::syntax::Sps;
use crate::codec::h265::syntax::Sublayer;
use crate::codec::h265::syntax::Vui;
use crate::codec::h265::syntax::MAX_DPB_REFS;
use crate::codec::h265::NaluType;

const MAX_SPS_COUNT: usize = 16;
const MAX_PPS_COUNT: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub layer_id: u8,
    pub temporal_id_plus1: u8,
}

/// One NAL unit located in an Annex B stream. `payload` holds the bytes after
/// the two-byte header, emulation prevention intact.
#[derive(Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    pub payload: &'a [u8],
}

fn parse_header(data: &[u8]) -> Result<NaluHeader, String> {
    if data.len() < 2 {
        return Err("truncated NAL unit header".into());
    }

    let mut r = BitReader::new(&data[..2], false);

    if r.read_bit()? {
        return Err("forbidden_zero_bit set".into());
    }

    Ok(NaluHeader {
        type_: NaluType::n(r.read_bits::<u32>(6)?).ok_or("invalid NAL unit type".to_string())?,
        layer_id: r.read_bits(6)?,
        temporal_id_plus1: r.read_bits(3)?,
    })
}

/// Splits Annex B data into NAL units by start-code scan.
pub fn split_nalus(data: &[u8]) -> Result<Vec<Nalu>, String> {
    let mut starts = Vec::new();

    for (pos, window) in data.windows(3).enumerate() {
        if window == [0x00, 0x00, 0x01] {
            // Skip start-code emulations within a previous unit, which cannot
            // occur in conforming data anyway.
            starts.push(pos + 3);
        }
    }

    if starts.is_empty() {
        return Err("no start code found".into());
    }

    let mut nalus = Vec::with_capacity(starts.len());

    for (i, start) in starts.iter().enumerate() {
        let mut end = if i + 1 < starts.len() {
            starts[i + 1] - 3
        } else {
            data.len()
        };

        // The zero_byte of a following long start code belongs to that code,
        // not to this unit.
        if end > *start && data[end - 1] == 0x00 {
            end -= 1;
        }

        let unit = &data[*start..end];
        let header = parse_header(unit)?;

        nalus.push(Nalu {
            header,
            payload: &unit[2..],
        });
    }

    Ok(nalus)
}

#[derive(Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Sps>,
    active_ppses: BTreeMap<u8, Pps>,
}

impl Parser {
    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.active_ppses.get(&pps_id)
    }

    fn parse_ptl_profile(ptl: &mut ProfileTierLevel, r: &mut BitReader) -> Result<(), String> {
        ptl.profile_space = r.read_bits(2)?;
        ptl.tier_flag = r.read_bit()?;
        ptl.profile_idc = r.read_bits(5)?;
        ptl.profile_compatibility_flags = r.read_bits::<u32>(24)? << 8;
        ptl.profile_compatibility_flags |= r.read_bits::<u32>(8)?;
        ptl.progressive_source_flag = r.read_bit()?;
        ptl.interlaced_source_flag = r.read_bit()?;
        ptl.non_packed_constraint_flag = r.read_bit()?;
        ptl.frame_only_constraint_flag = r.read_bit()?;

        // reserved_zero_44bits
        r.skip_bits(44)?;

        Ok(())
    }

    fn parse_profile_tier_level(
        general: &mut ProfileTierLevel,
        sub_layer: &mut [Sublayer],
        max_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> Result<(), String> {
        Self::parse_ptl_profile(general, r)?;
        general.level_idc = r.read_bits(8)?;

        let max = usize::from(max_sub_layers_minus1);

        for sl in sub_layer.iter_mut().take(max) {
            sl.ptl.profile_present_flag = r.read_bit()?;
            sl.ptl.level_present_flag = r.read_bit()?;
        }

        if max > 0 {
            for _ in max..8 {
                r.skip_bits(2)?;
            }
        }

        for sl in sub_layer.iter_mut().take(max) {
            if sl.ptl.profile_present_flag {
                Self::parse_ptl_profile(&mut sl.ptl, r)?;
            }

            if sl.ptl.level_present_flag {
                sl.ptl.level_idc = r.read_bits(8)?;
            }
        }

        Ok(())
    }

    fn parse_sub_layer_ordering(
        sub_layer: &mut [Sublayer],
        present: bool,
        max_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> Result<(), String> {
        let start = if present {
            0
        } else {
            usize::from(max_sub_layers_minus1)
        };

        for sl in sub_layer
            .iter_mut()
            .take(usize::from(max_sub_layers_minus1) + 1)
            .skip(start)
        {
            sl.ordering.max_dec_pic_buffering_minus1 = r.read_ue_max(15)?;
            sl.ordering.max_num_reorder_pics =
                r.read_ue_max(u32::from(sl.ordering.max_dec_pic_buffering_minus1))?;
            sl.ordering.max_latency_increase_plus1 = r.read_ue()?;
        }

        Ok(())
    }

    fn parse_hrd_parameters(
        hrd: &mut HrdParams,
        max_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> Result<(), String> {
        hrd.nal_hrd_parameters_present_flag = r.read_bit()?;
        hrd.vcl_hrd_parameters_present_flag = r.read_bit()?;

        if hrd.vcl_hrd_parameters_present_flag {
            return Err("VCL HRD parameters not supported".into());
        }

        if hrd.nal_hrd_parameters_present_flag {
            hrd.sub_pic_hrd_params_present_flag = r.read_bit()?;

            if hrd.sub_pic_hrd_params_present_flag {
                return Err("sub-picture HRD parameters not supported".into());
            }

            hrd.bit_rate_scale = r.read_bits(4)?;
            hrd.cpb_size_scale = r.read_bits(4)?;
            hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
            hrd.au_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
            hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        }

        for sl in hrd
            .sl
            .iter_mut()
            .take(usize::from(max_sub_layers_minus1) + 1)
        {
            sl.fixed_pic_rate_general_flag = r.read_bit()?;

            if !sl.fixed_pic_rate_general_flag {
                sl.fixed_pic_rate_within_cvs_flag = r.read_bit()?;
            }

            if sl.fixed_pic_rate_general_flag || sl.fixed_pic_rate_within_cvs_flag {
                sl.elemental_duration_in_tc_minus1 = r.read_ue_max(2047)?;
            } else {
                sl.low_delay_hrd_flag = r.read_bit()?;
            }

            if !sl.low_delay_hrd_flag {
                sl.cpb_cnt_minus1 = r.read_ue_max(31)?;
            }

            if hrd.nal_hrd_parameters_present_flag {
                for cpb in sl.cpb.iter_mut().take(usize::from(sl.cpb_cnt_minus1) + 1) {
                    cpb.bit_rate_value_minus1 = r.read_ue()?;
                    cpb.cpb_size_value_minus1 = r.read_ue()?;
                    cpb.cbr_flag = r.read_bit()?;
                }
            }
        }

        Ok(())
    }

    fn parse_vui_parameters(
        vui: &mut Vui,
        max_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> Result<(), String> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coeffs = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit()?;
        vui.field_seq_flag = r.read_bit()?;
        vui.frame_field_info_present_flag = r.read_bit()?;

        vui.default_display_window_flag = r.read_bit()?;
        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(31)? << 1;
            vui.num_units_in_tick |= r.read_bits::<u32>(1)?;

            vui.time_scale = r.read_bits::<u32>(31)? << 1;
            vui.time_scale |= r.read_bits::<u32>(1)?;

            vui.poc_proportional_to_timing_flag = r.read_bit()?;
            if vui.poc_proportional_to_timing_flag {
                vui.num_ticks_poc_diff_one_minus1 = r.read_ue()?;
            }

            vui.hrd_parameters_present_flag = r.read_bit()?;
            if vui.hrd_parameters_present_flag {
                Self::parse_hrd_parameters(&mut vui.hrd, max_sub_layers_minus1, r)?;
            }
        }

        vui.bitstream_restriction_flag = r.read_bit()?;
        if vui.bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.read_bit()?;
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.restricted_ref_pic_lists_flag = r.read_bit()?;
            vui.min_spatial_segmentation_idc = r.read_ue_max(4095)?;
            vui.max_bytes_per_pic_denom = r.read_ue_max(16)?;
            vui.max_bits_per_min_cu_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
        }

        Ok(())
    }

    /// st_ref_pic_set(idx). The inter-predicted form is expanded into the
    /// explicit delta-POC representation per 7.4.8 so that downstream code
    /// never needs the reference set again.
    fn parse_short_term_ref_pic_set(
        sets: &mut [ShortTermRefPicSet],
        num_sps_sets: usize,
        idx: usize,
        r: &mut BitReader,
    ) -> Result<(), String> {
        let mut set = ShortTermRefPicSet::default();

        if idx != 0 {
            set.inter_ref_pic_set_prediction_flag = r.read_bit()?;
        }

        if set.inter_ref_pic_set_prediction_flag {
            if idx == num_sps_sets {
                set.delta_idx_minus1 = r.read_ue_max(idx as u32 - 1)?;
            }

            set.delta_rps_sign = r.read_bit()?;
            set.abs_delta_rps_minus1 = r.read_ue_max(0x7fff)?;

            let ref_rps_idx = idx - (usize::from(set.delta_idx_minus1) + 1);
            let ref_set = sets[ref_rps_idx];
            let num_delta_pocs = ref_set.num_pics();

            if num_delta_pocs >= MAX_DPB_REFS {
                return Err(format!("reference RPS {} has too many entries", ref_rps_idx));
            }

            for pic in set.pic.iter_mut().take(num_delta_pocs + 1) {
                pic.used_by_curr_pic_flag = r.read_bit()?;

                pic.use_delta_flag = if pic.used_by_curr_pic_flag {
                    true
                } else {
                    r.read_bit()?
                };
            }

            Self::expand_inter_rps(&mut set, &ref_set)?;
        } else {
            set.num_negative_pics = r.read_ue_max(MAX_DPB_REFS as u32 - 1)?;
            set.num_positive_pics =
                r.read_ue_max(MAX_DPB_REFS as u32 - 1 - u32::from(set.num_negative_pics))?;

            let num_neg = usize::from(set.num_negative_pics);

            let mut prev = 0i32;
            for pic in set.pic.iter_mut().take(num_neg) {
                pic.delta_poc_sx_minus1 = r.read_ue_max(0x7fff)?;
                pic.used_by_curr_pic_sx_flag = r.read_bit()?;

                prev -= i32::from(pic.delta_poc_sx_minus1) + 1;
                pic.delta_poc = i16::try_from(prev).map_err(|_| "delta POC overflow")?;
            }

            let num_pics = set.num_pics();
            let mut prev = 0i32;
            for pic in set.pic[num_neg..].iter_mut().take(num_pics - num_neg) {
                pic.delta_poc_sx_minus1 = r.read_ue_max(0x7fff)?;
                pic.used_by_curr_pic_sx_flag = r.read_bit()?;

                prev += i32::from(pic.delta_poc_sx_minus1) + 1;
                pic.delta_poc = i16::try_from(prev).map_err(|_| "delta POC overflow")?;
            }
        }

        sets[idx] = set;

        Ok(())
    }

    /// 7.4.8 derivation of DeltaPocS0/S1 and the used flags for an
    /// inter-predicted set.
    fn expand_inter_rps(
        set: &mut ShortTermRefPicSet,
        ref_set: &ShortTermRefPicSet,
    ) -> Result<(), String> {
        let delta_rps = (1 - 2 * i32::from(set.delta_rps_sign))
            * (i32::from(set.abs_delta_rps_minus1) + 1);

        let ref_neg = usize::from(ref_set.num_negative_pics);
        let ref_pos = usize::from(ref_set.num_positive_pics);
        let num_delta_pocs = ref_set.num_pics();

        // The flags just read, indexed by reference-set position.
        let used: Vec<bool> = set.pic[..=num_delta_pocs]
            .iter()
            .map(|p| p.used_by_curr_pic_flag)
            .collect();
        let use_delta: Vec<bool> = set.pic[..=num_delta_pocs]
            .iter()
            .map(|p| p.use_delta_flag)
            .collect();

        let mut delta_s0 = [0i32; MAX_DPB_REFS];
        let mut used_s0 = [false; MAX_DPB_REFS];
        let mut delta_s1 = [0i32; MAX_DPB_REFS];
        let mut used_s1 = [false; MAX_DPB_REFS];

        let mut num_neg = 0;
        for j in (0..ref_pos).rev() {
            let d = i32::from(ref_set.pic[ref_neg + j].delta_poc) + delta_rps;
            if d < 0 && use_delta[ref_neg + j] {
                delta_s0[num_neg] = d;
                used_s0[num_neg] = used[ref_neg + j];
                num_neg += 1;
            }
        }
        if delta_rps < 0 && use_delta[num_delta_pocs] {
            delta_s0[num_neg] = delta_rps;
            used_s0[num_neg] = used[num_delta_pocs];
            num_neg += 1;
        }
        for j in 0..ref_neg {
            let d = i32::from(ref_set.pic[j].delta_poc) + delta_rps;
            if d < 0 && use_delta[j] {
                delta_s0[num_neg] = d;
                used_s0[num_neg] = used[j];
                num_neg += 1;
            }
        }

        let mut num_pos = 0;
        for j in (0..ref_neg).rev() {
            let d = i32::from(ref_set.pic[j].delta_poc) + delta_rps;
            if d > 0 && use_delta[j] {
                delta_s1[num_pos] = d;
                used_s1[num_pos] = used[j];
                num_pos += 1;
            }
        }
        if delta_rps > 0 && use_delta[num_delta_pocs] {
            delta_s1[num_pos] = delta_rps;
            used_s1[num_pos] = used[num_delta_pocs];
            num_pos += 1;
        }
        for j in 0..ref_pos {
            let d = i32::from(ref_set.pic[ref_neg + j].delta_poc) + delta_rps;
            if d > 0 && use_delta[ref_neg + j] {
                delta_s1[num_pos] = d;
                used_s1[num_pos] = used[ref_neg + j];
                num_pos += 1;
            }
        }

        set.num_negative_pics = num_neg as u8;
        set.num_positive_pics = num_pos as u8;

        let mut prev = 0i32;
        for i in 0..num_neg {
            let pic = &mut set.pic[i];
            pic.delta_poc = i16::try_from(delta_s0[i]).map_err(|_| "delta POC overflow")?;
            pic.delta_poc_sx_minus1 =
                u16::try_from(prev - delta_s0[i] - 1).map_err(|_| "delta POC overflow")?;
            pic.used_by_curr_pic_sx_flag = used_s0[i];
            prev = delta_s0[i];
        }

        let mut prev = 0i32;
        for i in 0..num_pos {
            let pic = &mut set.pic[num_neg + i];
            pic.delta_poc = i16::try_from(delta_s1[i]).map_err(|_| "delta POC overflow")?;
            pic.delta_poc_sx_minus1 =
                u16::try_from(delta_s1[i] - prev - 1).map_err(|_| "delta POC overflow")?;
            pic.used_by_curr_pic_sx_flag = used_s1[i];
            prev = delta_s1[i];
        }

        Ok(())
    }

    /// Parse an SPS NALU.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Sps, String> {
        if !matches!(nalu.header.type_, NaluType::SpsNut) {
            return Err(format!(
                "invalid NALU type, expected {:?}, got {:?}",
                NaluType::SpsNut,
                nalu.header.type_
            ));
        }

        if nalu.header.layer_id != 0 {
            return Err("multi-layer streams not supported".into());
        }

        let mut r = BitReader::new(nalu.payload, true);

        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        Self::parse_profile_tier_level(
            &mut sps.general,
            &mut sps.sub_layer,
            sps.max_sub_layers_minus1,
            &mut r,
        )?;

        sps.seq_parameter_set_id = r.read_ue_max(15)?;
        sps.chroma_format_idc = r.read_ue_max(3)?;

        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
            if sps.separate_colour_plane_flag {
                return Err("separate colour planes not supported".into());
            }
        }

        sps.pic_width_in_luma_samples = r.read_ue()?;
        sps.pic_height_in_luma_samples = r.read_ue()?;

        sps.conformance_window_flag = r.read_bit()?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(8)?;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;

        sps.sub_layer_ordering_info_present_flag = r.read_bit()?;
        Self::parse_sub_layer_ordering(
            &mut sps.sub_layer,
            sps.sub_layer_ordering_info_present_flag,
            sps.max_sub_layers_minus1,
            &mut r,
        )?;

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue()?;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue()?;
        sps.log2_min_transform_block_size_minus2 = r.read_ue()?;
        sps.log2_diff_max_min_transform_block_size = r.read_ue()?;
        sps.max_transform_hierarchy_depth_inter = r.read_ue()?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue()?;

        sps.scaling_list_enabled_flag = r.read_bit()?;
        if sps.scaling_list_enabled_flag {
            return Err("scaling lists not supported".into());
        }

        sps.amp_enabled_flag = r.read_bit()?;
        sps.sample_adaptive_offset_enabled_flag = r.read_bit()?;

        sps.pcm_enabled_flag = r.read_bit()?;
        if sps.pcm_enabled_flag {
            return Err("PCM not supported".into());
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(64)?;
        for idx in 0..usize::from(sps.num_short_term_ref_pic_sets) {
            Self::parse_short_term_ref_pic_set(
                &mut sps.strps,
                usize::from(sps.num_short_term_ref_pic_sets),
                idx,
                &mut r,
            )?;
        }

        sps.long_term_ref_pics_present_flag = r.read_bit()?;
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(32)?;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                sps.lt_ref_pic_poc_lsb_sps[i] =
                    r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit()?;
            }
        }

        sps.temporal_mvp_enabled_flag = r.read_bit()?;
        sps.strong_intra_smoothing_enabled_flag = r.read_bit()?;

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Self::parse_vui_parameters(&mut sps.vui, sps.max_sub_layers_minus1, &mut r)?;
        }

        sps.extension_flag = r.read_bit()?;
        if sps.extension_flag {
            return Err("SPS extensions not supported".into());
        }

        let key = sps.seq_parameter_set_id;
        self.active_spses.insert(key, sps);

        if self.active_spses.len() > MAX_SPS_COUNT {
            return Err("broken data: number of active SPSes > MAX_SPS_COUNT".into());
        }

        Ok(self.get_sps(key).ok_or("BUG: SPS not stored")?)
    }

    /// Parse a PPS NALU.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Pps, String> {
        if !matches!(nalu.header.type_, NaluType::PpsNut) {
            return Err(format!(
                "invalid NALU type, expected {:?}, got {:?}",
                NaluType::PpsNut,
                nalu.header.type_
            ));
        }

        if nalu.header.layer_id != 0 {
            return Err("multi-layer streams not supported".into());
        }

        let mut r = BitReader::new(nalu.payload, true);

        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(63)?,
            seq_parameter_set_id: r.read_ue_max(15)?,
            dependent_slice_segments_enabled_flag: r.read_bit()?,
            output_flag_present_flag: r.read_bit()?,
            num_extra_slice_header_bits: r.read_bits(3)?,
            sign_data_hiding_enabled_flag: r.read_bit()?,
            cabac_init_present_flag: r.read_bit()?,
            num_ref_idx_l0_default_active_minus1: r.read_ue_max(14)?,
            num_ref_idx_l1_default_active_minus1: r.read_ue_max(14)?,
            init_qp_minus26: r.read_se_bounded(-26, 25)?,
            constrained_intra_pred_flag: r.read_bit()?,
            transform_skip_enabled_flag: r.read_bit()?,
            ..Default::default()
        };

        pps.cu_qp_delta_enabled_flag = r.read_bit()?;
        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth = r.read_ue()?;
        }

        pps.cb_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.cr_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.slice_chroma_qp_offsets_present_flag = r.read_bit()?;
        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_flag = r.read_bit()?;
        pps.transquant_bypass_enabled_flag = r.read_bit()?;
        pps.tiles_enabled_flag = r.read_bit()?;
        pps.entropy_coding_sync_enabled_flag = r.read_bit()?;

        if pps.tiles_enabled_flag {
            pps.num_tile_columns_minus1 = r.read_ue_max(18)?;
            pps.num_tile_rows_minus1 = r.read_ue_max(20)?;
            pps.uniform_spacing_flag = r.read_bit()?;

            if !pps.uniform_spacing_flag {
                for i in 0..usize::from(pps.num_tile_columns_minus1) {
                    pps.column_width[i] = r.read_ue_max::<u16>(0xfffe)? + 1;
                }
                for i in 0..usize::from(pps.num_tile_rows_minus1) {
                    pps.row_height[i] = r.read_ue_max::<u16>(0xfffe)? + 1;
                }
            }

            pps.loop_filter_across_tiles_enabled_flag = r.read_bit()?;
        }

        pps.loop_filter_across_slices_enabled_flag = r.read_bit()?;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = r.read_bit()?;
            pps.deblocking_filter_disabled_flag = r.read_bit()?;

            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                pps.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        pps.scaling_list_data_present_flag = r.read_bit()?;
        if pps.scaling_list_data_present_flag {
            return Err("scaling lists not supported".into());
        }

        pps.lists_modification_present_flag = r.read_bit()?;
        pps.log2_parallel_merge_level_minus2 = r.read_ue_max(4)?;

        pps.slice_segment_header_extension_present_flag = r.read_bit()?;
        if pps.slice_segment_header_extension_present_flag {
            return Err("slice segment header extensions not supported".into());
        }

        pps.extension_flag = r.read_bit()?;
        if pps.extension_flag {
            return Err("PPS extensions not supported".into());
        }

        let key = pps.pic_parameter_set_id;
        self.active_ppses.insert(key, pps);

        if self.active_ppses.len() > MAX_PPS_COUNT {
            return Err("broken data: number of active PPSes > MAX_PPS_COUNT".into());
        }

        Ok(self.get_pps(key).ok_or("BUG: PPS not stored")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::synthesizer::Synthesizer;

    fn rich_sps() -> Sps {
        let mut sps = Sps {
            max_sub_layers_minus1: 0,
            temporal_id_nesting_flag: true,
            seq_parameter_set_id: 2,
            chroma_format_idc: 1,
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1088,
            conformance_window_flag: true,
            conf_win_bottom_offset: 4,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            log2_diff_max_min_luma_coding_block_size: 2,
            log2_diff_max_min_transform_block_size: 3,
            max_transform_hierarchy_depth_inter: 2,
            max_transform_hierarchy_depth_intra: 2,
            amp_enabled_flag: true,
            sample_adaptive_offset_enabled_flag: true,
            temporal_mvp_enabled_flag: true,
            strong_intra_smoothing_enabled_flag: true,
            vui_parameters_present_flag: true,
            ..Default::default()
        };

        sps.general.profile_idc = 1;
        sps.general.profile_compatibility_flags = 1 << 30;
        sps.general.progressive_source_flag = true;
        sps.general.frame_only_constraint_flag = true;
        sps.general.level_idc = 120;

        sps.sub_layer_ordering_info_present_flag = true;
        sps.sub_layer[0].ordering.max_dec_pic_buffering_minus1 = 3;
        sps.sub_layer[0].ordering.max_num_reorder_pics = 2;

        sps.num_short_term_ref_pic_sets = 2;
        sps.strps[0].num_negative_pics = 2;
        sps.strps[0].pic[0].delta_poc = -1;
        sps.strps[0].pic[0].delta_poc_sx_minus1 = 0;
        sps.strps[0].pic[0].used_by_curr_pic_sx_flag = true;
        sps.strps[0].pic[1].delta_poc = -3;
        sps.strps[0].pic[1].delta_poc_sx_minus1 = 1;
        sps.strps[0].pic[1].used_by_curr_pic_sx_flag = true;
        sps.strps[1].num_negative_pics = 1;
        sps.strps[1].num_positive_pics = 1;
        sps.strps[1].pic[0].delta_poc = -2;
        sps.strps[1].pic[0].delta_poc_sx_minus1 = 1;
        sps.strps[1].pic[0].used_by_curr_pic_sx_flag = true;
        sps.strps[1].pic[1].delta_poc = 2;
        sps.strps[1].pic[1].delta_poc_sx_minus1 = 1;
        sps.strps[1].pic[1].used_by_curr_pic_sx_flag = true;

        sps.long_term_ref_pics_present_flag = true;
        sps.num_long_term_ref_pics_sps = 1;
        sps.lt_ref_pic_poc_lsb_sps[0] = 0;
        sps.used_by_curr_pic_lt_sps_flag[0] = false;

        sps.vui.video_signal_type_present_flag = true;
        sps.vui.video_format = 5;
        sps.vui.colour_description_present_flag = true;
        sps.vui.colour_primaries = 1;
        sps.vui.transfer_characteristics = 1;
        sps.vui.matrix_coeffs = 1;
        sps.vui.timing_info_present_flag = true;
        sps.vui.num_units_in_tick = 1;
        sps.vui.time_scale = 30;
        sps.vui.hrd_parameters_present_flag = true;
        sps.vui.hrd.nal_hrd_parameters_present_flag = true;
        sps.vui.hrd.bit_rate_scale = 2;
        sps.vui.hrd.cpb_size_scale = 3;
        sps.vui.hrd.initial_cpb_removal_delay_length_minus1 = 23;
        sps.vui.hrd.au_cpb_removal_delay_length_minus1 = 23;
        sps.vui.hrd.dpb_output_delay_length_minus1 = 23;
        sps.vui.hrd.sl[0].fixed_pic_rate_general_flag = true;
        sps.vui.hrd.sl[0].cpb[0].bit_rate_value_minus1 = 3905;
        sps.vui.hrd.sl[0].cpb[0].cpb_size_value_minus1 = 7811;

        sps
    }

    #[test]
    fn sps_round_trip() {
        let sps = rich_sps();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Sps, _>::synthesize(&sps, &mut buf, true).unwrap();

        let nalus = split_nalus(&buf).unwrap();
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].header.type_, NaluType::SpsNut);

        let mut parser = Parser::default();
        let parsed = parser.parse_sps(&nalus[0]).unwrap();
        assert_eq!(*parsed, sps);
    }

    #[test]
    fn pps_round_trip_with_tiles() {
        let mut pps = Pps {
            pic_parameter_set_id: 1,
            init_qp_minus26: 4,
            cu_qp_delta_enabled_flag: true,
            diff_cu_qp_delta_depth: 1,
            tiles_enabled_flag: true,
            num_tile_columns_minus1: 2,
            num_tile_rows_minus1: 1,
            loop_filter_across_tiles_enabled_flag: true,
            loop_filter_across_slices_enabled_flag: true,
            lists_modification_present_flag: true,
            ..Default::default()
        };
        pps.column_width[0] = 20;
        pps.column_width[1] = 20;
        pps.row_height[0] = 17;

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Pps, _>::synthesize(&pps, &mut buf, true).unwrap();

        let nalus = split_nalus(&buf).unwrap();
        let mut parser = Parser::default();
        let parsed = parser.parse_pps(&nalus[0]).unwrap();
        assert_eq!(*parsed, pps);
    }

    #[test]
    fn inter_predicted_rps_expansion() {
        // Set 1 predicts {-2, -4} from set 0 {-1, -3} with deltaRps -1.
        let mut sps = rich_sps();
        sps.vui_parameters_present_flag = false;
        sps.long_term_ref_pics_present_flag = false;

        sps.strps[1] = ShortTermRefPicSet {
            inter_ref_pic_set_prediction_flag: true,
            delta_rps_sign: true,
            abs_delta_rps_minus1: 0,
            ..Default::default()
        };
        sps.strps[1].pic[0].used_by_curr_pic_flag = true;
        sps.strps[1].pic[0].use_delta_flag = true;
        sps.strps[1].pic[1].used_by_curr_pic_flag = true;
        sps.strps[1].pic[1].use_delta_flag = true;

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Sps, _>::synthesize(&sps, &mut buf, true).unwrap();

        let nalus = split_nalus(&buf).unwrap();
        let mut parser = Parser::default();
        let parsed = parser.parse_sps(&nalus[0]).unwrap();

        let set = &parsed.strps[1];
        assert!(set.inter_ref_pic_set_prediction_flag);
        assert_eq!(set.num_negative_pics, 2);
        assert_eq!(set.num_positive_pics, 0);
        assert_eq!(set.pic[0].delta_poc, -2);
        assert_eq!(set.pic[1].delta_poc, -4);
        assert_eq!(set.pic[0].delta_poc_sx_minus1, 1);
        assert_eq!(set.pic[1].delta_poc_sx_minus1, 1);
        assert!(set.pic[0].used_by_curr_pic_sx_flag);
        assert!(set.pic[1].used_by_curr_pic_sx_flag);
    }

    #[test]
    fn split_finds_all_units() {
        let sps = rich_sps();
        let pps = Pps::default();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Sps, _>::synthesize(&sps, &mut buf, true).unwrap();
        Synthesizer::<Pps, _>::synthesize(&pps, &mut buf, true).unwrap();

        let nalus = split_nalus(&buf).unwrap();
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].header.type_, NaluType::SpsNut);
        assert_eq!(nalus[1].header.type_, NaluType::PpsNut);
    }

    #[test]
    fn rejects_forbidden_bit() {
        let data = [0x00, 0x00, 0x01, 0x80, 0x01, 0x42];
        assert!(split_nalus(&data).is_err());
    }

    #[test]
    fn rejects_wrong_nalu_type() {
        let pps = Pps::default();
        let mut buf = Vec::<u8>::new();
        Synthesizer::<Pps, _>::synthesize(&pps, &mut buf, true).unwrap();

        let nalus = split_nalus(&buf).unwrap();
        let mut parser = Parser::default();
        assert!(parser.parse_sps(&nalus[0]).is_err());
    }
}
