// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Short-term reference picture sets.
//!
//! A set is first built explicitly from the DPB contents of one frame, then
//! the SPS table is shrunk in three steps: identical sets are deduplicated
//! over a simulated GOP, each table entry is re-coded as an inter-predicted
//! set when that costs fewer bits, and trailing rare sets are dropped when
//! signalling them inline in the slice headers is cheaper.

use std::cmp::Reverse;
use std::collections::VecDeque;

use crate::codec::h265::ceil_log2;
use crate::codec::h265::dpb::construct_rpl;
use crate::codec::h265::dpb::get_frame_type;
use crate::codec::h265::dpb::is_b;
use crate::codec::h265::dpb::is_i;
use crate::codec::h265::dpb::is_idr;
use crate::codec::h265::dpb::is_ref;
use crate::codec::h265::dpb::p_layer;
use crate::codec::h265::dpb::reorder;
use crate::codec::h265::dpb::update_dpb;
use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbError;
use crate::codec::h265::dpb::DpbFrame;
use crate::codec::h265::dpb::FrameBaseInfo;
use crate::codec::h265::dpb::GopParams;
use crate::codec::h265::dpb::Rpl;
use crate::codec::h265::dpb::TemporalLayers;
use crate::codec::h265::dpb::FRAME_REF;
use crate::codec::h265::syntax::ShortTermRefPicSet;
use crate::codec::h265::syntax::Sps;
use crate::codec::h265::syntax::MAX_DPB_REFS;

/// One deduplicated set and the number of frames that used it.
#[derive(Clone, Copy, Debug)]
pub struct StrpsFreq {
    pub rps: ShortTermRefPicSet,
    pub count: u32,
}

/// Reference-list sizing and GOP-simulation inputs for [`build_sps_sets`].
#[derive(Clone, Copy, Debug)]
pub struct SpsRpsParams<'a> {
    pub gop: &'a GopParams,
    pub tl: &'a TemporalLayers,
    /// Active references per P layer.
    pub num_ref_active_p: [u8; 8],
    /// Active L0/L1 references per B-pyramid layer.
    pub num_ref_active_bl0: [u8; 8],
    pub num_ref_active_bl1: [u8; 8],
    /// VDENC requires LDB L1 to mirror L0 exactly.
    pub low_power: bool,
    pub num_slices: u32,
}

/// Whether `poc` is an active reference of the frame `rpl` was built for.
pub fn is_curr_ref(dpb: &Dpb, rpl: &Rpl, poc: i32) -> bool {
    for lx in 0..2 {
        for j in 0..usize::from(rpl.num_active[lx]) {
            if dpb[usize::from(rpl.list[lx][j])].poc == poc {
                return true;
            }
        }
    }

    false
}

/// Whether `poc` is an active reference and marked long-term.
pub fn is_curr_lt(dpb: &Dpb, rpl: &Rpl, poc: i32) -> bool {
    for lx in 0..2 {
        for j in 0..usize::from(rpl.num_active[lx]) {
            let f = &dpb[usize::from(rpl.list[lx][j])];
            if f.poc == poc {
                return f.ltr;
            }
        }
    }

    false
}

/// Builds the explicit set for one frame from the short-term DPB entries.
/// Negative deltas come first by increasing distance, then positive deltas
/// by increasing distance, with the successive-difference form filled in.
pub fn construct(dpb: &Dpb, rpl: &Rpl, poc: i32) -> ShortTermRefPicSet {
    let mut rps = ShortTermRefPicSet::default();
    let mut n = 0usize;

    for f in dpb.iter() {
        if f.ltr {
            continue;
        }

        let delta = (f.poc - poc) as i16;
        rps.pic[n].delta_poc = delta;
        rps.pic[n].used_by_curr_pic_sx_flag = is_curr_ref(dpb, rpl, f.poc);
        rps.num_negative_pics += u8::from(delta < 0);
        rps.num_positive_pics += u8::from(delta > 0);
        n += 1;
    }

    rps.pic[..n].sort_by_key(|p| p.delta_poc);
    rps.pic[..usize::from(rps.num_negative_pics)].sort_by_key(|p| Reverse(p.delta_poc));

    for i in 0..n {
        let prev = if i == 0 || i == usize::from(rps.num_negative_pics) {
            0
        } else {
            rps.pic[i - 1].delta_poc
        };
        rps.pic[i].delta_poc_sx_minus1 = (rps.pic[i].delta_poc - prev).unsigned_abs() - 1;
    }

    rps
}

/// ue(v) code length of `b`.
fn nbits_ue(b: u32) -> u32 {
    if b == 0 {
        return 1;
    }

    let n = 32 - (b + 1).leading_zeros();
    n * 2 - 1
}

/// Bit cost of signalling `rps` as entry `idx` of a table of
/// `num_sps_sets` sets; `idx == num_sps_sets` is the inline slice-header
/// position where delta_idx_minus1 is also coded.
pub fn nbits(
    list: &[ShortTermRefPicSet],
    num_sps_sets: usize,
    rps: &ShortTermRefPicSet,
    idx: usize,
) -> u32 {
    let mut n = u32::from(idx != 0);

    if rps.inter_ref_pic_set_prediction_flag {
        let r = &list[idx - usize::from(rps.delta_idx_minus1) - 1];
        let ref_npics = r.num_pics().min(MAX_DPB_REFS - 1);

        if idx == num_sps_sets {
            n += nbits_ue(u32::from(rps.delta_idx_minus1));
        }

        n += 1;
        n += nbits_ue(u32::from(rps.abs_delta_rps_minus1));
        n += ref_npics as u32;

        for p in rps.pic[..=ref_npics].iter() {
            n += u32::from(!p.used_by_curr_pic_flag);
        }

        return n;
    }

    n += nbits_ue(u32::from(rps.num_negative_pics));
    n += nbits_ue(u32::from(rps.num_positive_pics));

    for p in rps.pic[..rps.num_pics()].iter() {
        n += nbits_ue(u32::from(p.delta_poc_sx_minus1)) + 1;
    }

    n
}

fn delta_at(rps: &ShortTermRefPicSet, i: usize) -> i16 {
    if i < rps.num_pics() {
        rps.pic[i].delta_poc
    } else {
        0
    }
}

/// Re-codes `old` as an inter-predicted set off an earlier table entry when
/// that is cheaper. Mid-table entries may only predict from their immediate
/// predecessor; the inline slice-header set (`idx == num_sps_sets`) tries
/// every earlier entry.
pub fn optimize(
    list: &[ShortTermRefPicSet],
    num_sps_sets: usize,
    old: &mut ShortTermRefPicSet,
    idx: usize,
) {
    if idx == 0 {
        return;
    }

    for k in (0..idx).rev() {
        let r = &list[k];
        let ref_npics = r.num_pics();

        // prediction maps the old entries onto the reference entries plus
        // the deltaRps slot, so the reference needs enough of them
        if ref_npics + 1 < old.num_pics() || ref_npics >= MAX_DPB_REFS {
            continue;
        }

        let mut new = *old;
        new.inter_ref_pic_set_prediction_flag = true;
        new.delta_idx_minus1 = (idx - k - 1) as u8;

        if new.delta_idx_minus1 > 0 && idx < num_sps_sets {
            break;
        }

        // candidate deltaRps values: each old delta on its own and against
        // every reference delta, nearest first, negatives preferred
        let mut negs: Vec<i16> = Vec::new();
        let mut poss: Vec<i16> = Vec::new();

        for i in 0..old.num_pics() {
            let d = old.pic[i].delta_poc;
            if d != 0 {
                if d > 0 { poss.push(d) } else { negs.push(d) }
            }

            for j in 0..ref_npics {
                let d = old.pic[i].delta_poc - r.pic[j].delta_poc;
                if d != 0 {
                    if d > 0 { poss.push(d) } else { negs.push(d) }
                }
            }
        }

        negs.sort_unstable_by_key(|&d| Reverse(d));
        negs.dedup();
        poss.sort_unstable();
        poss.dedup();

        let mut dpocs: [VecDeque<i16>; 2] = [negs.into(), poss.into()];

        let mut dpoc: i16 = 0;
        let mut found = false;

        while (!dpocs[0].is_empty() || !dpocs[1].is_empty()) && !found {
            dpoc = -dpoc;
            let positive = (dpoc > 0 && !dpocs[1].is_empty()) || dpocs[0].is_empty();
            dpoc = match dpocs[usize::from(positive)].pop_front() {
                Some(d) => d,
                None => break,
            };

            for p in new.pic[..=ref_npics].iter_mut() {
                p.used_by_curr_pic_flag = false;
                p.use_delta_flag = false;
            }

            let mut i = 0usize;

            // negative old deltas map onto reference positives (backward),
            // the deltaRps slot, then reference negatives (forward)
            for j in (usize::from(r.num_negative_pics)..ref_npics).rev() {
                if delta_at(old, i) < 0 && delta_at(old, i) - r.pic[j].delta_poc == dpoc {
                    new.pic[j].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                    new.pic[j].use_delta_flag = true;
                    i += 1;
                }
            }

            if dpoc < 0 && delta_at(old, i) == dpoc {
                new.pic[ref_npics].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                new.pic[ref_npics].use_delta_flag = true;
                i += 1;
            }

            for j in 0..usize::from(r.num_negative_pics) {
                if delta_at(old, i) < 0 && delta_at(old, i) - r.pic[j].delta_poc == dpoc {
                    new.pic[j].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                    new.pic[j].use_delta_flag = true;
                    i += 1;
                }
            }

            if i != usize::from(old.num_negative_pics) {
                continue;
            }

            // positive old deltas map symmetrically
            for j in (0..usize::from(r.num_negative_pics)).rev() {
                if delta_at(old, i) > 0 && delta_at(old, i) - r.pic[j].delta_poc == dpoc {
                    new.pic[j].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                    new.pic[j].use_delta_flag = true;
                    i += 1;
                }
            }

            if dpoc > 0 && delta_at(old, i) == dpoc {
                new.pic[ref_npics].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                new.pic[ref_npics].use_delta_flag = true;
                i += 1;
            }

            for j in usize::from(r.num_negative_pics)..ref_npics {
                if delta_at(old, i) > 0 && delta_at(old, i) - r.pic[j].delta_poc == dpoc {
                    new.pic[j].used_by_curr_pic_flag = old.pic[i].used_by_curr_pic_sx_flag;
                    new.pic[j].use_delta_flag = true;
                    i += 1;
                }
            }

            found = i == old.num_pics();
        }

        if found {
            new.delta_rps_sign = dpoc < 0;
            new.abs_delta_rps_minus1 = dpoc.unsigned_abs() - 1;

            if nbits(list, num_sps_sets, &new, idx) < nbits(list, num_sps_sets, old, idx) {
                *old = new;
            }
        }

        if idx < num_sps_sets {
            break;
        }
    }
}

/// Drops trailing table entries while signalling the set inline in every
/// slice header costs fewer bits than keeping it in the SPS plus indexing it.
pub fn reduce(sets: &mut Vec<StrpsFreq>, num_slices: u32) {
    while let Some(last) = sets.last() {
        let mut rps = last.rps;
        let count = last.count;
        let n_set = sets.len() as u32;
        let table: Vec<ShortTermRefPicSet> = sets.iter().map(|s| s.rps).collect();

        // SPS bits for the set, the ue-coded set-count field shrinking, and
        // the per-slice-header set index
        let mut bits_in_sps = nbits(&table, n_set as usize, &rps, n_set as usize - 1)
            + (ceil_log2(n_set + 1) - ceil_log2(n_set)) * 2
            + u32::from(n_set > 1) * num_slices * ceil_log2(n_set) * count;

        // a table shrinking across a power of two also shortens the index
        // of every slice still pointing at a predicted SPS set
        if ceil_log2(n_set) != ceil_log2(n_set - 1) {
            let with_sps_rps: u32 = sets[..n_set as usize - 1]
                .iter()
                .map(|s| u32::from(s.rps.inter_ref_pic_set_prediction_flag) * s.count)
                .sum();
            bits_in_sps = num_slices * (bits_in_sps + with_sps_rps);
        }

        // removal leaves the set to be coded inline in every slice header
        rps.inter_ref_pic_set_prediction_flag = false;
        let n_set = n_set as usize;
        optimize(&table[..n_set - 1], n_set - 1, &mut rps, n_set - 1);

        let bits_inline = nbits(&table[..n_set - 1], n_set - 1, &rps, n_set - 1)
            * num_slices
            * count;

        if bits_inline >= bits_in_sps {
            return;
        }
        sets.pop();
    }
}

/// Simulates one GOP to collect the frequent short-term sets into the SPS,
/// optimizes and reduces the table, and harvests the long-term POC lsb table
/// when an LTR interval is configured.
pub fn build_sps_sets(par: &SpsRpsParams, sps: &mut Sps) -> Result<(), DpbError> {
    let max_poc_lsb = 1i32 << (sps.log2_max_pic_order_cnt_lsb_minus4 + 4);
    // the lookahead spans the whole IDR period: open GOPs reuse sets across
    // their CRA frames
    let n_gops = if par.gop.idr_interval > 0 { par.gop.idr_interval } else { 4 };
    let st_dist = std::cmp::min(par.gop.gop_pic_size.saturating_mul(n_gops), 128) as i32;
    let mut more_ltr = par.gop.ltr_interval > 0;
    let mut last_ipoc = 0i32;
    let mut frames: Vec<FrameBaseInfo> = Vec::new();
    let mut dpb = Dpb::default();
    let mut sets: Vec<StrpsFreq> = Vec::new();
    let mut rpl = Rpl::default();

    sps.num_short_term_ref_pic_sets = 0;
    sps.num_long_term_ref_pics_sps = 0;

    let mut order = 0u32;
    while more_ltr || sets.len() < 64 {
        frames.push(FrameBaseInfo {
            fo: order,
            poc: order as i32,
            frame_type: get_frame_type(par.gop, order),
            ..Default::default()
        });

        let cur_idx = match reorder(par.gop, &dpb, &mut frames, false) {
            Some(idx) => idx,
            None => {
                order += 1;
                continue;
            }
        };
        let mut cur = frames[cur_idx];

        if par.tl.is_scalable() {
            cur.tid = par.tl.tid_of(cur.poc as u32);
            if par.tl.highest_tid() == cur.tid {
                cur.frame_type &= !FRAME_REF;
            }

            let tid = cur.tid;
            dpb.retain(|f| !(f.tid > 0 && f.tid >= tid));
        }

        if (order > 0 && is_idr(cur.frame_type))
            || (!more_ltr && cur.poc >= st_dist)
            || sets.len() >= 64
        {
            break;
        }

        if !is_i(cur.frame_type) && cur.poc < st_dist {
            let num_ref = if is_b(cur.frame_type) {
                let layer = if par.gop.b_pyramid {
                    (cur.level as i32 - 1).clamp(0, 7) as usize
                } else {
                    0
                };
                [par.num_ref_active_bl0[layer], par.num_ref_active_bl1[layer]]
            } else {
                let layer = usize::from(p_layer(par.gop, (cur.poc - last_ipoc) as u32));
                let l1 = if par.low_power {
                    par.num_ref_active_p[layer]
                } else {
                    std::cmp::min(par.num_ref_active_p[layer], par.num_ref_active_bl1[0])
                };
                [par.num_ref_active_p[layer], l1]
            };

            rpl = construct_rpl(par.gop, &dpb, is_b(cur.frame_type), cur.poc, cur.tid, num_ref)?;
            let rps = construct(&dpb, &rpl, cur.poc);

            match sets.iter_mut().find(|s| s.rps.same_refs(&rps)) {
                Some(s) => s.count += 1,
                None => sets.push(StrpsFreq { rps, count: 1 }),
            }
        } else {
            last_ipoc = cur.poc;
        }

        if is_ref(cur.frame_type) {
            if more_ltr {
                for j in 0..dpb.len() {
                    if !dpb[j].ltr {
                        continue;
                    }

                    let d_poc_cycle_msb = cur.poc / max_poc_lsb - dpb[j].poc / max_poc_lsb;
                    let d_poc_lsb = dpb[j].poc
                        - (cur.poc - d_poc_cycle_msb * max_poc_lsb - (cur.poc & (max_poc_lsb - 1)));
                    let mut skip = false;

                    if u32::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 5
                        <= ceil_log2(u32::from(sps.num_long_term_ref_pics_sps))
                    {
                        more_ltr = false;
                    } else {
                        for k in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                            if i32::from(sps.lt_ref_pic_poc_lsb_sps[k]) == d_poc_lsb {
                                // one lsb wrap is enough to cover the cycle
                                more_ltr = cur.poc < max_poc_lsb;
                                skip = true;
                                break;
                            }
                        }
                    }

                    if !more_ltr || skip {
                        break;
                    }

                    let n = usize::from(sps.num_long_term_ref_pics_sps);
                    sps.lt_ref_pic_poc_lsb_sps[n] = d_poc_lsb as u16;
                    sps.used_by_curr_pic_lt_sps_flag[n] = is_curr_lt(&dpb, &rpl, dpb[j].poc);
                    sps.num_long_term_ref_pics_sps += 1;

                    if sps.num_long_term_ref_pics_sps == 32 {
                        more_ltr = false;
                    }
                }
            }

            let frame = DpbFrame {
                poc: cur.poc,
                fo: cur.fo,
                tid: cur.tid,
                frame_type: cur.frame_type,
                idx_rec: 0,
                ..Default::default()
            };
            update_dpb(par.gop, &frame, &mut dpb, &[])?;
        }

        frames.remove(cur_idx);
        order += 1;
    }

    sets.sort_by_key(|s| Reverse(s.count));

    for i in 0..sets.len() {
        let table: Vec<ShortTermRefPicSet> = sets.iter().map(|s| s.rps).collect();
        let mut rps = sets[i].rps;
        optimize(&table, sets.len(), &mut rps, i);
        sets[i].rps = rps;
    }

    reduce(&mut sets, par.num_slices.max(1));

    // 64 sets is the most the SPS can index
    for s in sets.iter().take(64) {
        sps.strps[usize::from(sps.num_short_term_ref_pic_sets)] = s.rps;
        sps.num_short_term_ref_pic_sets += 1;
    }

    sps.long_term_ref_pics_present_flag = true;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dpb_with(entries: &[(i32, bool)]) -> Dpb {
        let mut dpb = Dpb::default();
        for &(poc, ltr) in entries {
            dpb.push(DpbFrame {
                poc,
                fo: poc as u32,
                frame_type: FRAME_REF,
                ltr,
                idx_rec: 0,
                ..Default::default()
            })
            .unwrap();
        }
        dpb
    }

    fn explicit_set(deltas: &[i16]) -> ShortTermRefPicSet {
        let mut rps = ShortTermRefPicSet::default();
        let mut sorted: Vec<i16> = deltas.to_vec();
        sorted.sort_unstable();
        let neg = sorted.iter().filter(|&&d| d < 0).count();
        sorted[..neg].sort_unstable_by_key(|&d| Reverse(d));

        for (i, &d) in sorted.iter().enumerate() {
            let prev = if i == 0 || i == neg { 0 } else { sorted[i - 1] };
            rps.pic[i].delta_poc = d;
            rps.pic[i].delta_poc_sx_minus1 = (d - prev).unsigned_abs() - 1;
            rps.pic[i].used_by_curr_pic_sx_flag = true;
        }
        rps.num_negative_pics = neg as u8;
        rps.num_positive_pics = (sorted.len() - neg) as u8;
        rps
    }

    #[test]
    fn ue_code_lengths() {
        assert_eq!(nbits_ue(0), 1);
        assert_eq!(nbits_ue(1), 3);
        assert_eq!(nbits_ue(2), 3);
        assert_eq!(nbits_ue(3), 5);
        assert_eq!(nbits_ue(6), 5);
        assert_eq!(nbits_ue(7), 7);
    }

    #[test]
    fn construct_sorts_and_encodes_deltas() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };
        let dpb = dpb_with(&[(0, false), (4, false), (8, false), (12, false)]);
        let rpl = construct_rpl(&par, &dpb, true, 6, 0, [2, 1]).unwrap();

        let rps = construct(&dpb, &rpl, 6);

        assert_eq!(rps.num_negative_pics, 2);
        assert_eq!(rps.num_positive_pics, 2);

        let deltas: Vec<i16> = rps.pic[..4].iter().map(|p| p.delta_poc).collect();
        assert_eq!(deltas, vec![-2, -6, 2, 6]);

        let minus1: Vec<u16> = rps.pic[..4].iter().map(|p| p.delta_poc_sx_minus1).collect();
        assert_eq!(minus1, vec![1, 3, 1, 3]);

        // POC 12 was trimmed from L1, everything else is an active reference
        let used: Vec<bool> = rps.pic[..4]
            .iter()
            .map(|p| p.used_by_curr_pic_sx_flag)
            .collect();
        assert_eq!(used, vec![true, true, true, false]);
    }

    #[test]
    fn construct_skips_long_term_entries() {
        let par = GopParams {
            num_ref_frame: 4,
            ..Default::default()
        };
        let dpb = dpb_with(&[(0, true), (8, false)]);
        let rpl = construct_rpl(&par, &dpb, false, 9, 0, [2, 2]).unwrap();

        let rps = construct(&dpb, &rpl, 9);

        assert_eq!(rps.num_pics(), 1);
        assert_eq!(rps.pic[0].delta_poc, -1);
    }

    #[test]
    fn optimize_predicts_from_shifted_set() {
        let set0 = explicit_set(&[-1, -3]);
        let mut set1 = explicit_set(&[-2, -4]);
        let list = [set0];

        optimize(&list, 2, &mut set1, 1);

        // {-2, -4} is {-1, -3} shifted by a deltaRps of -1
        assert!(set1.inter_ref_pic_set_prediction_flag);
        assert_eq!(set1.delta_idx_minus1, 0);
        assert!(set1.delta_rps_sign);
        assert_eq!(set1.abs_delta_rps_minus1, 0);
        assert!(set1.pic[0].used_by_curr_pic_flag);
        assert!(set1.pic[0].use_delta_flag);
        assert!(set1.pic[1].used_by_curr_pic_flag);
        assert!(set1.pic[1].use_delta_flag);
        // the deltaRps slot itself is not part of the new set
        assert!(!set1.pic[2].used_by_curr_pic_flag);
        assert!(!set1.pic[2].use_delta_flag);

        // the original delta POCs survive for later comparisons
        assert_eq!(set1.pic[0].delta_poc, -2);
        assert_eq!(set1.pic[1].delta_poc, -4);
    }

    #[test]
    fn optimize_keeps_explicit_form_when_cheaper() {
        // a large single-delta set shares no structure with the reference
        let set0 = explicit_set(&[-1]);
        let mut set1 = explicit_set(&[-1, -2, -3, -4]);
        let list = [set0];

        let before = set1;
        optimize(&list, 2, &mut set1, 1);

        // prediction needs ref_npics + 1 slots, impossible here
        assert_eq!(set1, before);
    }

    #[test]
    fn reduce_drops_rare_tail_set() {
        let sets_in = vec![
            StrpsFreq {
                rps: explicit_set(&[-1]),
                count: 100,
            },
            StrpsFreq {
                rps: explicit_set(&[-2]),
                count: 1,
            },
        ];

        let mut sets = sets_in.clone();
        reduce(&mut sets, 1);

        assert_eq!(sets.len(), 1);
        assert!(sets[0].rps.same_refs(&sets_in[0].rps));

        // a frequent tail set stays in the table
        let mut sets = sets_in;
        sets[1].count = 100;
        reduce(&mut sets, 1);
        assert_eq!(sets.len(), 2);
    }

    #[test]
    fn reduce_weighs_the_count_field_and_index_widths() {
        // shrinking from two sets to one crosses a power of two: the
        // ue-coded set count loses two bits and the rare tail set goes
        // inline even when the per-slice index cost alone would keep it
        let mut sets = vec![
            StrpsFreq {
                rps: explicit_set(&[-1]),
                count: 100,
            },
            StrpsFreq {
                rps: explicit_set(&[-2]),
                count: 1,
            },
        ];

        reduce(&mut sets, 2);

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].rps.pic[0].delta_poc, -1);
    }

    #[test]
    fn ippp_gop_collapses_to_one_set() {
        let gop = GopParams {
            gop_pic_size: 32,
            gop_ref_dist: 1,
            num_ref_frame: 1,
            ..Default::default()
        };
        let tl = TemporalLayers::default();
        let par = SpsRpsParams {
            gop: &gop,
            tl: &tl,
            num_ref_active_p: [1; 8],
            num_ref_active_bl0: [1; 8],
            num_ref_active_bl1: [1; 8],
            low_power: false,
            num_slices: 1,
        };
        let mut sps = Sps::default();

        build_sps_sets(&par, &mut sps).unwrap();

        // every P frame references its predecessor, one set covers them all
        assert_eq!(sps.num_short_term_ref_pic_sets, 1);
        let rps = &sps.strps[0];
        assert_eq!(rps.num_negative_pics, 1);
        assert_eq!(rps.num_positive_pics, 0);
        assert_eq!(rps.pic[0].delta_poc, -1);
        assert!(rps.pic[0].used_by_curr_pic_sx_flag);

        assert!(sps.long_term_ref_pics_present_flag);
        assert_eq!(sps.num_long_term_ref_pics_sps, 0);
    }

    #[test]
    fn lookahead_spans_the_idr_period() {
        // with an open GOP the simulation runs across the CRA frames up to
        // the IDR, so the sets of the Bs straddling each CRA reach the table
        let gop = GopParams {
            gop_pic_size: 8,
            gop_ref_dist: 4,
            idr_interval: 4,
            num_ref_frame: 3,
            ..Default::default()
        };
        let tl = TemporalLayers::default();
        let par = SpsRpsParams {
            gop: &gop,
            tl: &tl,
            num_ref_active_p: [2; 8],
            num_ref_active_bl0: [2; 8],
            num_ref_active_bl1: [1; 8],
            low_power: false,
            num_slices: 1,
        };
        let mut sps = Sps::default();

        build_sps_sets(&par, &mut sps).unwrap();

        // the B one past an anchor references both anchors and the frame
        // before the previous one, e.g. POC 5 against 0, 4 and the CRA at 8
        let wanted = explicit_set(&[-5, -1, 3]);
        let num_sets = usize::from(sps.num_short_term_ref_pic_sets);
        assert!((0..num_sets).any(|i| sps.strps[i].same_refs(&wanted)));
    }

    #[test]
    fn ltr_lookahead_fills_lsb_table() {
        let gop = GopParams {
            gop_pic_size: 0xffff,
            gop_ref_dist: 1,
            num_ref_frame: 2,
            ltr_interval: 4,
            ..Default::default()
        };
        let tl = TemporalLayers::default();
        let par = SpsRpsParams {
            gop: &gop,
            tl: &tl,
            num_ref_active_p: [2; 8],
            num_ref_active_bl0: [1; 8],
            num_ref_active_bl1: [1; 8],
            low_power: false,
            num_slices: 1,
        };
        let mut sps = Sps::default();
        sps.log2_max_pic_order_cnt_lsb_minus4 = 0;

        build_sps_sets(&par, &mut sps).unwrap();

        assert!(sps.long_term_ref_pics_present_flag);
        assert!(sps.num_long_term_ref_pics_sps > 0);
        assert!(sps.num_short_term_ref_pic_sets > 0);
    }

    #[test]
    fn lookahead_dpb_stays_consistent() {
        // B-pyramid GOP: the simulation must drain without DPB errors and
        // produce a non-trivial deduplicated table
        let gop = GopParams {
            gop_pic_size: 32,
            gop_ref_dist: 4,
            num_ref_frame: 4,
            b_pyramid: true,
            ..Default::default()
        };
        let tl = TemporalLayers::default();
        let par = SpsRpsParams {
            gop: &gop,
            tl: &tl,
            num_ref_active_p: [2; 8],
            num_ref_active_bl0: [2; 8],
            num_ref_active_bl1: [1; 8],
            low_power: false,
            num_slices: 1,
        };
        let mut sps = Sps::default();

        build_sps_sets(&par, &mut sps).unwrap();

        assert!(sps.num_short_term_ref_pic_sets >= 1);
        assert!(usize::from(sps.num_short_term_ref_pic_sets) <= 64);

        // table entries must stay decodable in order: a predicted set only
        // refers backwards
        for i in 0..usize::from(sps.num_short_term_ref_pic_sets) {
            let rps = &sps.strps[i];
            if rps.inter_ref_pic_set_prediction_flag {
                assert!(usize::from(rps.delta_idx_minus1) < i);
            }
        }
    }
}
