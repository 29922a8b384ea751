// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Value types for the H.265 syntax structures the encoder emits.
//!
//! Unlike the decoder side these are plain pub-field structs: the packer
//! builds them field by field and the synthesizer serializes them in syntax
//! table order. Flags are `bool`, multi-bit fields use the narrowest integer
//! that holds the legal range; range enforcement happens at synthesis time.

pub const MAX_NUM_TILE_COLUMNS: usize = 20;
pub const MAX_NUM_TILE_ROWS: usize = 22;
pub const MAX_NUM_LONG_TERM_PICS: usize = 8;
/// Per 7.4.3.2.1 an SPS carries at most 64 sets; one more may be signalled
/// inline in a slice header.
pub const MAX_SHORT_TERM_REF_PIC_SETS: usize = 65;
pub const MAX_DPB_REFS: usize = 16;

/// profile_tier_level() contents for one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flags: u32,
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    /// sub_layer_profile_present_flag when used inside a sub-layer entry.
    pub profile_present_flag: bool,
    pub level_present_flag: bool,
    pub level_idc: u8,
}

/// Per-sublayer ordering info shared by VPS and SPS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SublayerOrdering {
    pub max_dec_pic_buffering_minus1: u8,
    pub max_num_reorder_pics: u8,
    pub max_latency_increase_plus1: u32,
}

/// One reference entry of a short-term RPS. `delta_poc` always holds the full
/// signed delta against the current POC; the `minus1` form is the successive
/// difference actually signalled in the explicit branch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StRefPic {
    /// used_by_curr_pic_flag of the inter-predicted branch.
    pub used_by_curr_pic_flag: bool,
    pub use_delta_flag: bool,
    pub delta_poc: i16,
    pub delta_poc_sx_minus1: u16,
    /// used_by_curr_pic_sX_flag of the explicit branch.
    pub used_by_curr_pic_sx_flag: bool,
}

/// st_ref_pic_set() contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub delta_idx_minus1: u8,
    pub delta_rps_sign: bool,
    pub abs_delta_rps_minus1: u16,
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    pub pic: [StRefPic; MAX_DPB_REFS],
}

impl ShortTermRefPicSet {
    pub fn num_pics(&self) -> usize {
        usize::from(self.num_negative_pics) + usize::from(self.num_positive_pics)
    }

    /// Set equality for deduplication purposes: the prediction encoding is
    /// irrelevant, only the delta-POC entries and their used flags count.
    pub fn same_refs(&self, other: &Self) -> bool {
        self.num_negative_pics == other.num_negative_pics
            && self.num_positive_pics == other.num_positive_pics
            && self.pic[..self.num_pics()]
                .iter()
                .zip(other.pic[..other.num_pics()].iter())
                .all(|(a, b)| {
                    a.delta_poc == b.delta_poc
                        && a.used_by_curr_pic_sx_flag == b.used_by_curr_pic_sx_flag
                })
    }
}

/// One sub-layer of hrd_parameters().
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrd {
    pub fixed_pic_rate_general_flag: bool,
    pub fixed_pic_rate_within_cvs_flag: bool,
    pub low_delay_hrd_flag: bool,
    pub elemental_duration_in_tc_minus1: u16,
    pub cpb_cnt_minus1: u8,
    pub cpb: [Cpb; 32],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cpb {
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cbr_flag: bool,
}

/// hrd_parameters() contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub sl: [SublayerHrd; 8],
}

/// vui_parameters() contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vui {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,

    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,

    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u16,
    pub max_bytes_per_pic_denom: u8,
    pub max_bits_per_min_cu_denom: u8,
    pub log2_max_mv_length_horizontal: u8,
    pub log2_max_mv_length_vertical: u8,
}

/// One sub-layer entry of a parameter set: its PTL plus ordering info.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sublayer {
    pub ptl: ProfileTierLevel,
    pub ordering: SublayerOrdering,
}

/// A H.265 Video Parameter Set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub video_parameter_set_id: u8,
    /// Always 3 in the bitstream.
    pub reserved_three_2bits: u8,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    /// Always 0xffff in the bitstream.
    pub reserved_0xffff_16bits: u16,

    pub general: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub sub_layer: [Sublayer; 8],

    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u16,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u16,
    pub num_hrd_parameters: u16,
}

/// A H.265 Sequence Parameter Set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,

    pub general: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub sub_layer: [Sublayer; 8],

    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,

    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,

    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    pub log2_min_luma_coding_block_size_minus3: u32,
    pub log2_diff_max_min_luma_coding_block_size: u32,
    pub log2_min_transform_block_size_minus2: u32,
    pub log2_diff_max_min_transform_block_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,

    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,

    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,

    pub num_short_term_ref_pic_sets: u8,
    pub strps: [ShortTermRefPicSet; MAX_SHORT_TERM_REF_PIC_SETS],

    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: [u16; 32],
    pub used_by_curr_pic_lt_sps_flag: [bool; 32],

    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,

    pub vui_parameters_present_flag: bool,
    pub vui: Vui,

    pub extension_flag: bool,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            video_parameter_set_id: 0,
            max_sub_layers_minus1: 0,
            temporal_id_nesting_flag: false,
            general: Default::default(),
            sub_layer_ordering_info_present_flag: false,
            sub_layer: Default::default(),
            seq_parameter_set_id: 0,
            chroma_format_idc: 0,
            separate_colour_plane_flag: false,
            pic_width_in_luma_samples: 0,
            pic_height_in_luma_samples: 0,
            conformance_window_flag: false,
            conf_win_left_offset: 0,
            conf_win_right_offset: 0,
            conf_win_top_offset: 0,
            conf_win_bottom_offset: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            log2_min_luma_coding_block_size_minus3: 0,
            log2_diff_max_min_luma_coding_block_size: 0,
            log2_min_transform_block_size_minus2: 0,
            log2_diff_max_min_transform_block_size: 0,
            max_transform_hierarchy_depth_inter: 0,
            max_transform_hierarchy_depth_intra: 0,
            scaling_list_enabled_flag: false,
            scaling_list_data_present_flag: false,
            amp_enabled_flag: false,
            sample_adaptive_offset_enabled_flag: false,
            pcm_enabled_flag: false,
            num_short_term_ref_pic_sets: 0,
            strps: [Default::default(); MAX_SHORT_TERM_REF_PIC_SETS],
            long_term_ref_pics_present_flag: false,
            num_long_term_ref_pics_sps: 0,
            lt_ref_pic_poc_lsb_sps: [0; 32],
            used_by_curr_pic_lt_sps_flag: [false; 32],
            temporal_mvp_enabled_flag: false,
            strong_intra_smoothing_enabled_flag: false,
            vui_parameters_present_flag: false,
            vui: Default::default(),
            extension_flag: false,
        }
    }
}

impl Sps {
    /// Log2 of the CTB size.
    pub fn ctb_log2_size_y(&self) -> u32 {
        self.log2_min_luma_coding_block_size_minus3
            + 3
            + self.log2_diff_max_min_luma_coding_block_size
    }

    pub fn pic_width_in_ctbs_y(&self) -> u32 {
        let ctb_size = 1 << self.ctb_log2_size_y();
        self.pic_width_in_luma_samples.div_ceil(ctb_size)
    }

    pub fn pic_height_in_ctbs_y(&self) -> u32 {
        let ctb_size = 1 << self.ctb_log2_size_y();
        self.pic_height_in_luma_samples.div_ceil(ctb_size)
    }

    pub fn pic_size_in_ctbs_y(&self) -> u32 {
        self.pic_width_in_ctbs_y() * self.pic_height_in_ctbs_y()
    }

    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }
}

/// A H.265 Picture Parameter Set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u16,
    pub num_tile_rows_minus1: u16,
    pub uniform_spacing_flag: bool,
    pub column_width: [u16; MAX_NUM_TILE_COLUMNS - 1],
    pub row_height: [u16; MAX_NUM_TILE_ROWS - 1],
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_list_data_present_flag: bool,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u16,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_flag: bool,
}

/// Slice types per Table 7-7.
pub const SLICE_TYPE_B: u8 = 0;
pub const SLICE_TYPE_P: u8 = 1;
pub const SLICE_TYPE_I: u8 = 2;

/// One long-term reference entry of a slice header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceLongTerm {
    pub lt_idx_sps: u8,
    pub poc_lsb_lt: u32,
    pub used_by_curr_pic_lt_flag: bool,
    pub delta_poc_msb_present_flag: bool,
    pub delta_poc_msb_cycle_lt: u32,
}

/// A H.265 slice segment header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,

    pub type_: u8,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u32,

    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u8,
    pub strps: ShortTermRefPicSet,

    pub num_long_term_sps: u8,
    pub num_long_term_pics: u16,
    pub lt: [SliceLongTerm; MAX_NUM_LONG_TERM_PICS],

    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,

    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_lx: [bool; 2],
    pub list_entry_lx: [[u8; 16]; 2],

    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,

    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    /// [list][entry][Y, Cb, Cr][weight, offset]
    pub pwt: [[[[i16; 2]; 3]; 16]; 2],

    pub five_minus_max_num_merge_cand: u8,

    pub slice_qp_delta: i8,
    pub slice_cb_qp_offset: i8,
    pub slice_cr_qp_offset: i8,

    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,

    pub num_entry_point_offsets: u32,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            first_slice_segment_in_pic_flag: false,
            no_output_of_prior_pics_flag: false,
            pic_parameter_set_id: 0,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            type_: SLICE_TYPE_I,
            pic_output_flag: true,
            colour_plane_id: 0,
            pic_order_cnt_lsb: 0,
            short_term_ref_pic_set_sps_flag: false,
            short_term_ref_pic_set_idx: 0,
            strps: Default::default(),
            num_long_term_sps: 0,
            num_long_term_pics: 0,
            lt: Default::default(),
            temporal_mvp_enabled_flag: false,
            sao_luma_flag: false,
            sao_chroma_flag: false,
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_modification_flag_lx: [false; 2],
            list_entry_lx: [[0; 16]; 2],
            mvd_l1_zero_flag: false,
            cabac_init_flag: false,
            collocated_from_l0_flag: true,
            collocated_ref_idx: 0,
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            pwt: [[[[0; 2]; 3]; 16]; 2],
            five_minus_max_num_merge_cand: 0,
            slice_qp_delta: 0,
            slice_cb_qp_offset: 0,
            slice_cr_qp_offset: 0,
            deblocking_filter_override_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            loop_filter_across_slices_enabled_flag: false,
            num_entry_point_offsets: 0,
        }
    }
}

impl SliceHeader {
    pub fn is_i(&self) -> bool {
        self.type_ == SLICE_TYPE_I
    }

    pub fn is_p(&self) -> bool {
        self.type_ == SLICE_TYPE_P
    }

    pub fn is_b(&self) -> bool {
        self.type_ == SLICE_TYPE_B
    }
}

/// Buffering-period SEI payload (D.2.2). Only NAL HRD entries are emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    pub irap_cpb_params_present_flag: bool,
    pub cpb_delay_offset: u32,
    pub dpb_delay_offset: u32,
    pub concatenation_flag: bool,
    pub au_cpb_removal_delay_delta_minus1: u32,
    pub nal: [BufferingPeriodCpb; 32],
    pub vcl: [BufferingPeriodCpb; 32],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriodCpb {
    pub initial_cpb_removal_delay: u32,
    pub initial_cpb_removal_offset: u32,
}

/// Picture-timing SEI payload (D.2.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub pic_struct: u8,
    pub source_scan_type: u8,
    pub duplicate_flag: bool,
    pub au_cpb_removal_delay_minus1: u32,
    pub pic_dpb_output_delay: u32,
}
