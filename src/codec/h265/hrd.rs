// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex C hypothetical reference decoder model.
//!
//! Tracks CPB arrival and removal times across encoded access units to
//! produce the `initial_cpb_removal_delay` carried by buffering period SEI
//! messages. Equation labels refer to the numbered formulas of Annex C and
//! clause D.3.3. Arrival times are kept in `90000 * bits` units so the
//! bitrate division only happens on readout.

use crate::codec::h265::syntax::Sps;

#[derive(Clone, Debug, Default)]
pub struct Hrd {
    required: bool,
    cbr: bool,
    bitrate: u32,
    max_cpb_removal_delay: u32,
    clock_tick: f64,
    cpb_size_90k: u32,
    init_cpb_removal_delay: u32,
    prev_au_cpb_removal_delay_minus1: i32,
    prev_au_cpb_removal_delay_msb: u32,
    prev_au_final_arrival_time: f64,
    prev_bp_au_nominal_removal_time: f64,
    prev_bp_enc_order: u32,
}

impl Hrd {
    /// Builds the model from the SPS HRD parameters. Without NAL or VCL HRD
    /// in the VUI the model stays disabled and every method is a no-op.
    pub fn new(sps: &Sps, initial_delay_kb: u32) -> Self {
        let vui = &sps.vui;
        let hrd = &vui.hrd;
        let cpb0 = &hrd.sl[0].cpb[0];

        if !sps.vui_parameters_present_flag
            || !vui.hrd_parameters_present_flag
            || !(hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag)
        {
            return Self::default();
        }

        let cpb_size = (cpb0.cpb_size_value_minus1 + 1) << (4 + hrd.cpb_size_scale);
        let bitrate = (cpb0.bit_rate_value_minus1 + 1) << (6 + hrd.bit_rate_scale);
        let init_cpb_removal_delay =
            (90000.0 * 8000.0 * f64::from(initial_delay_kb) / f64::from(bitrate)) as u32;

        Self {
            required: true,
            cbr: cpb0.cbr_flag,
            bitrate,
            max_cpb_removal_delay: 1 << (hrd.au_cpb_removal_delay_length_minus1 + 1),
            clock_tick: f64::from(vui.num_units_in_tick) * 90000.0 / f64::from(vui.time_scale),
            cpb_size_90k: (90000.0 * f64::from(cpb_size) / f64::from(bitrate)) as u32,
            init_cpb_removal_delay,
            prev_au_cpb_removal_delay_minus1: -1,
            prev_au_cpb_removal_delay_msb: 0,
            prev_au_final_arrival_time: 0.0,
            prev_bp_au_nominal_removal_time: f64::from(init_cpb_removal_delay),
            prev_bp_enc_order: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.required
    }

    /// Re-derives the rates after a bitrate change; arrival state carries
    /// over.
    pub fn reset(&mut self, sps: &Sps) {
        if !self.required {
            return;
        }

        let hrd = &sps.vui.hrd;
        let cpb0 = &hrd.sl[0].cpb[0];

        let cpb_size = (cpb0.cpb_size_value_minus1 + 1) << (4 + hrd.cpb_size_scale);
        self.bitrate = (cpb0.bit_rate_value_minus1 + 1) << (6 + hrd.bit_rate_scale);
        self.cpb_size_90k = (90000.0 * f64::from(cpb_size) / f64::from(self.bitrate)) as u32;
    }

    /// Advances the model past one encoded access unit of `size_in_bits`,
    /// encoded `eo`-th overall. `buffering_period_pic` marks units carrying
    /// a buffering period SEI.
    pub fn update(&mut self, size_in_bits: u32, eo: u32, buffering_period_pic: bool) {
        if !self.required {
            return;
        }

        let au_nominal_removal_time = if eo > 0 {
            let au_cpb_removal_delay_minus1 = (eo - self.prev_bp_enc_order) - 1;
            // (D-1)
            let mut au_cpb_removal_delay_msb = 0;

            if !buffering_period_pic && eo - self.prev_bp_enc_order != 1 {
                au_cpb_removal_delay_msb = if au_cpb_removal_delay_minus1 as i32
                    <= self.prev_au_cpb_removal_delay_minus1
                {
                    self.prev_au_cpb_removal_delay_msb + self.max_cpb_removal_delay
                } else {
                    self.prev_au_cpb_removal_delay_msb
                };
            }

            self.prev_au_cpb_removal_delay_msb = au_cpb_removal_delay_msb;
            self.prev_au_cpb_removal_delay_minus1 = au_cpb_removal_delay_minus1 as i32;

            // (D-2)
            let au_cpb_removal_delay_val_minus1 =
                au_cpb_removal_delay_msb + au_cpb_removal_delay_minus1;
            // (C-10, C-11)
            self.prev_bp_au_nominal_removal_time
                + self.clock_tick * f64::from(au_cpb_removal_delay_val_minus1 + 1)
        } else {
            // (C-9)
            f64::from(self.init_cpb_removal_delay)
        };

        // (C-3)
        let mut init_arrival_time = self.prev_au_final_arrival_time;

        if !self.cbr {
            let init_arrival_earliest_time = if buffering_period_pic {
                // (C-7)
                au_nominal_removal_time - f64::from(self.init_cpb_removal_delay)
            } else {
                // (C-6)
                au_nominal_removal_time - f64::from(self.cpb_size_90k)
            };
            // (C-4)
            init_arrival_time = self
                .prev_au_final_arrival_time
                .max(init_arrival_earliest_time * f64::from(self.bitrate));
        }

        // (C-8)
        self.prev_au_final_arrival_time = init_arrival_time + f64::from(size_in_bits) * 90000.0;

        if buffering_period_pic {
            self.prev_bp_au_nominal_removal_time = au_nominal_removal_time;
            self.prev_bp_enc_order = eo;
        }
    }

    /// initial_cpb_removal_delay for a buffering period starting at encoding
    /// order `eo`, from the nominal removal time against the final arrival
    /// time of everything sent so far.
    pub fn init_cpb_removal_delay(&mut self, eo: u32) -> u32 {
        if !self.required {
            return 0;
        }

        if eo > 0 {
            // (D-1, D-2) with msb 0: a buffering period resets the delay
            let au_cpb_removal_delay_val_minus1 = eo - self.prev_bp_enc_order - 1;
            // (C-10, C-11)
            let au_nominal_removal_time = self.prev_bp_au_nominal_removal_time
                + self.clock_tick * f64::from(au_cpb_removal_delay_val_minus1 + 1);

            // (C-17)
            let delta_time_90k =
                au_nominal_removal_time - self.prev_au_final_arrival_time / f64::from(self.bitrate);

            self.init_cpb_removal_delay = if self.cbr {
                // (C-19)
                delta_time_90k as u32
            } else {
                // (C-18)
                delta_time_90k.min(f64::from(self.cpb_size_90k)) as u32
            };
        }

        self.init_cpb_removal_delay
    }

    pub fn init_cpb_removal_delay_offset(&self) -> u32 {
        self.cpb_size_90k.saturating_sub(self.init_cpb_removal_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 Mbps CBR, 1 Mbit CPB, 30 fps, 62KB initial delay
    fn hrd_sps(cbr: bool) -> Sps {
        let mut sps = Sps::default();
        sps.vui_parameters_present_flag = true;
        sps.vui.timing_info_present_flag = true;
        sps.vui.num_units_in_tick = 1;
        sps.vui.time_scale = 30;
        sps.vui.hrd_parameters_present_flag = true;
        sps.vui.hrd.nal_hrd_parameters_present_flag = true;
        sps.vui.hrd.bit_rate_scale = 0;
        sps.vui.hrd.cpb_size_scale = 0;
        sps.vui.hrd.au_cpb_removal_delay_length_minus1 = 23;
        sps.vui.hrd.sl[0].cpb[0].bit_rate_value_minus1 = 15624; // 15625 * 64 = 1_000_000
        sps.vui.hrd.sl[0].cpb[0].cpb_size_value_minus1 = 62499; // 62500 * 16 = 1_000_000
        sps.vui.hrd.sl[0].cpb[0].cbr_flag = cbr;
        sps
    }

    #[test]
    fn disabled_without_hrd_params() {
        let sps = Sps::default();
        let mut hrd = Hrd::new(&sps, 62);

        assert!(!hrd.enabled());
        hrd.update(100_000, 0, true);
        assert_eq!(hrd.init_cpb_removal_delay(1), 0);
    }

    #[test]
    fn initial_delay_from_config() {
        let mut hrd = Hrd::new(&hrd_sps(true), 62);

        assert!(hrd.enabled());
        // 90000 * 8000 * 62 / 1_000_000
        assert_eq!(hrd.init_cpb_removal_delay(0), 44640);
        assert_eq!(hrd.init_cpb_removal_delay_offset(), 90000 - 44640);
    }

    #[test]
    fn small_frame_grows_the_delay() {
        let mut hrd = Hrd::new(&hrd_sps(true), 62);

        // 33000 bits at 1 Mbps arrive in 2970 ticks, one 30fps clock tick is
        // 3000: the buffer gains 30 ticks
        hrd.update(33_000, 0, true);
        assert_eq!(hrd.init_cpb_removal_delay(1), 44640 + 30);
    }

    #[test]
    fn vbr_delay_is_clipped_to_cpb_size() {
        let mut cbr = Hrd::new(&hrd_sps(true), 62);
        let mut vbr = Hrd::new(&hrd_sps(false), 62);

        cbr.update(0, 0, true);
        vbr.update(0, 0, true);

        // 20 frames of nothing: nominal removal runs far ahead of arrival
        assert_eq!(cbr.init_cpb_removal_delay(20), 44640 + 20 * 3000);
        assert_eq!(vbr.init_cpb_removal_delay(20), 90000);
    }

    #[test]
    fn reset_rescales_buffer() {
        let mut hrd = Hrd::new(&hrd_sps(true), 62);

        let mut sps = hrd_sps(true);
        // double the rate, same buffer: half the ticks
        sps.vui.hrd.sl[0].cpb[0].bit_rate_value_minus1 = 31249;
        hrd.reset(&sps);

        assert_eq!(hrd.init_cpb_removal_delay_offset(), 45000 - 44640);
    }
}
