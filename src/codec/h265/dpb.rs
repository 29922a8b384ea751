// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder-side DPB and reference-list management: sliding-window eviction,
//! long-term marking, RPL construction, GOP frame typing, B-frame reordering
//! and NAL unit type selection.

use thiserror::Error;

use crate::codec::h265::NaluType;

pub const MAX_DPB_SIZE: usize = 16;

/// Marks an empty DPB slot.
pub const IDX_INVALID: u8 = 0xff;

/// B-pyramid order not assigned yet.
pub const BPO_UNKNOWN: u32 = u32::MAX;

pub const FRAME_I: u8 = 1 << 0;
pub const FRAME_P: u8 = 1 << 1;
pub const FRAME_B: u8 = 1 << 2;
pub const FRAME_REF: u8 = 1 << 5;
pub const FRAME_IDR: u8 = 1 << 6;

pub fn is_i(frame_type: u8) -> bool {
    frame_type & FRAME_I != 0
}

pub fn is_p(frame_type: u8) -> bool {
    frame_type & FRAME_P != 0
}

pub fn is_b(frame_type: u8) -> bool {
    frame_type & FRAME_B != 0
}

pub fn is_ref(frame_type: u8) -> bool {
    frame_type & FRAME_REF != 0
}

pub fn is_idr(frame_type: u8) -> bool {
    frame_type & FRAME_IDR != 0
}

/// Effective picture type after reference analysis. `B1`/`B2` are B frames
/// referencing other Bs (first and second pyramid tier).
pub const CODING_TYPE_I: u8 = 1;
pub const CODING_TYPE_P: u8 = 2;
pub const CODING_TYPE_B: u8 = 3;
pub const CODING_TYPE_B1: u8 = 4;
pub const CODING_TYPE_B2: u8 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("no space in the DPB for a new reference frame")]
    Overflow,
    #[error("no L0 reference available for a predicted frame")]
    EmptyRefList,
}

/// GOP structure parameters shared by frame typing, reordering, the DPB
/// update and the STRPS lookahead.
#[derive(Clone, Copy, Debug)]
pub struct GopParams {
    pub gop_pic_size: u32,
    pub gop_ref_dist: u32,
    /// Distance between IDRs in GOPs; 0 keeps only frame 0 an IDR.
    pub idr_interval: u32,
    pub gop_closed: bool,
    pub num_ref_frame: u8,
    pub b_pyramid: bool,
    /// Low-delay P-pyramid referencing. Mutually exclusive with temporal
    /// layers; the session layer clears it when layers are configured.
    pub p_pyramid: bool,
    pub p_pyr_interval: u32,
    pub ltr_interval: u32,
}

impl Default for GopParams {
    fn default() -> Self {
        Self {
            gop_pic_size: 0xffff,
            gop_ref_dist: 1,
            idr_interval: 0,
            gop_closed: false,
            num_ref_frame: 1,
            b_pyramid: false,
            p_pyramid: false,
            p_pyr_interval: 1,
            ltr_interval: 0,
        }
    }
}

impl GopParams {
    pub fn is_low_delay(&self) -> bool {
        self.p_pyramid
    }
}

/// Temporal scalability structure: the sub-layer id of every frame follows
/// from the per-layer frame-rate scales.
#[derive(Clone, Copy, Debug)]
pub struct TemporalLayers {
    tid: [u8; 8],
    scale: [u16; 8],
    num: u8,
}

impl Default for TemporalLayers {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl TemporalLayers {
    /// Builds the layer table from per-layer scales; zero entries are
    /// disabled layers. With no layers configured a single base layer
    /// remains.
    pub fn new(layer_scales: &[u16]) -> Self {
        let mut tl = Self {
            tid: [0; 8],
            scale: [1, 0, 0, 0, 0, 0, 0, 0],
            num: 0,
        };

        for (i, &scale) in layer_scales.iter().take(8).enumerate() {
            if scale != 0 {
                tl.tid[usize::from(tl.num)] = i as u8;
                tl.scale[usize::from(tl.num)] = scale;
                tl.num += 1;
            }
        }

        tl.num = tl.num.max(1);
        tl
    }

    pub fn num_layers(&self) -> u8 {
        self.num
    }

    pub fn is_scalable(&self) -> bool {
        self.num > 1
    }

    pub fn highest_tid(&self) -> u8 {
        self.tid[usize::from(self.num - 1)]
    }

    /// Sub-layer of `frame_order`: the first layer whose scale step divides
    /// the frame order.
    pub fn tid_of(&self, frame_order: u32) -> u8 {
        let top = u32::from(self.scale[usize::from(self.num - 1)]);

        for i in 0..usize::from(self.num) {
            let step = top / u32::from(self.scale[i]).max(1);
            if step != 0 && frame_order % step == 0 {
                return self.tid[i];
            }
        }

        0
    }
}

/// Per-frame state consumed by the reorder logic. Shared between the live
/// task queue and the GOP simulation that builds the SPS STRPS table.
#[derive(Clone, Copy, Debug)]
pub struct FrameBaseInfo {
    pub fo: u32,
    pub poc: i32,
    pub frame_type: u8,
    pub tid: u8,
    /// B-pyramid encoding order within the mini-GOP.
    pub bpo: u32,
    /// B-pyramid tier, 0 for non-pyramid frames.
    pub level: u32,
}

impl Default for FrameBaseInfo {
    fn default() -> Self {
        Self {
            fo: 0,
            poc: 0,
            frame_type: 0,
            tid: 0,
            bpo: BPO_UNKNOWN,
            level: 0,
        }
    }
}

/// Accessor for the reorder state embedded in a queue entry.
pub trait HasFrameInfo {
    fn info(&self) -> &FrameBaseInfo;
    fn info_mut(&mut self) -> &mut FrameBaseInfo;
}

impl HasFrameInfo for FrameBaseInfo {
    fn info(&self) -> &FrameBaseInfo {
        self
    }

    fn info_mut(&mut self) -> &mut FrameBaseInfo {
        self
    }
}

/// One reconstructed reference frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DpbFrame {
    pub poc: i32,
    pub fo: u32,
    pub tid: u8,
    pub frame_type: u8,
    /// B-pyramid tier the frame was encoded at.
    pub level: u32,
    pub ltr: bool,
    /// P frame rewritten as a low-delay B (GPB).
    pub ldb: bool,
    /// One of `CODING_TYPE_*`, 0 when unknown or cleared.
    pub coding_type: u8,
    /// Reconstructed surface index; [`IDX_INVALID`] marks an empty slot.
    pub idx_rec: u8,
}

impl Default for DpbFrame {
    fn default() -> Self {
        Self {
            poc: -1,
            fo: 0,
            tid: 0,
            frame_type: 0,
            level: 0,
            ltr: false,
            ldb: false,
            coding_type: 0,
            idx_rec: IDX_INVALID,
        }
    }
}

/// Fixed-size DPB. Valid entries form a contiguous prefix; the first slot
/// with `idx_rec == IDX_INVALID` ends the buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dpb {
    frames: [DpbFrame; MAX_DPB_SIZE],
}

impl Dpb {
    pub fn len(&self) -> usize {
        self.frames
            .iter()
            .position(|f| f.idx_rec == IDX_INVALID)
            .unwrap_or(MAX_DPB_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.frames[0].idx_rec == IDX_INVALID
    }

    pub fn iter(&self) -> impl Iterator<Item = &DpbFrame> {
        self.frames.iter().take(self.len())
    }

    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        self.frames = [DpbFrame::default(); MAX_DPB_SIZE];
    }

    pub fn push(&mut self, frame: DpbFrame) -> Result<(), DpbError> {
        let end = self.len();
        if end == MAX_DPB_SIZE {
            return Err(DpbError::Overflow);
        }

        log::debug!("Storing POC {} in the DPB, length {}", frame.poc, end);
        self.frames[end] = frame;
        Ok(())
    }

    /// Removes the entry at `idx`, keeping the valid prefix contiguous.
    pub fn remove(&mut self, idx: usize) {
        let end = self.len();
        debug_assert!(idx < end);

        log::debug!("Removing POC {} from the DPB", self.frames[idx].poc);
        self.frames.copy_within(idx + 1..end, idx);
        self.frames[end - 1] = DpbFrame::default();
    }

    /// Inserts at `idx`, shifting later entries back.
    pub fn insert(&mut self, idx: usize, frame: DpbFrame) -> Result<(), DpbError> {
        let end = self.len();
        if end == MAX_DPB_SIZE {
            return Err(DpbError::Overflow);
        }
        debug_assert!(idx <= end);

        self.frames.copy_within(idx..end, idx + 1);
        self.frames[idx] = frame;
        Ok(())
    }

    pub(crate) fn retain<F: Fn(&DpbFrame) -> bool>(&mut self, keep: F) {
        let mut i = 0;
        while i < self.len() {
            if keep(&self.frames[i]) {
                i += 1;
            } else {
                self.remove(i);
            }
        }
    }

    pub fn idx_by_fo(&self, fo: u32) -> Option<usize> {
        self.iter().position(|f| f.fo == fo)
    }

    pub fn idx_by_poc(&self, poc: i32) -> Option<usize> {
        self.iter().position(|f| f.poc == poc)
    }
}

impl std::ops::Index<usize> for Dpb {
    type Output = DpbFrame;

    fn index(&self, idx: usize) -> &DpbFrame {
        &self.frames[idx]
    }
}

/// Reference picture lists for one frame; entries index into the active DPB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rpl {
    pub list: [[u8; MAX_DPB_SIZE]; 2],
    pub num_active: [u8; 2],
}

impl Default for Rpl {
    fn default() -> Self {
        Self {
            list: [[IDX_INVALID; MAX_DPB_SIZE]; 2],
            num_active: [0; 2],
        }
    }
}

impl Rpl {
    fn remove(&mut self, lx: usize, idx: usize) {
        let n = usize::from(self.num_active[lx]);
        self.list[lx].copy_within(idx + 1..n, idx);
        self.list[lx][n - 1] = IDX_INVALID;
        self.num_active[lx] -= 1;
    }

    fn insert(&mut self, lx: usize, idx: usize, entry: u8) {
        let n = usize::from(self.num_active[lx]);
        self.list[lx].copy_within(idx..n, idx + 1);
        self.list[lx][idx] = entry;
        self.num_active[lx] += 1;
    }
}

/// I/P/B cadence for `frame_order` from the GOP structure. Closed GOPs and
/// IDR boundaries rewrite the trailing B into a P.
pub fn get_frame_type(par: &GopParams, frame_order: u32) -> u8 {
    let (gop_pic_size, idr_pic_dist) = if par.gop_pic_size == 0xffff {
        (u32::MAX, u32::MAX)
    } else {
        (par.gop_pic_size, par.gop_pic_size.saturating_mul(par.idr_interval))
    };

    let fo = frame_order;
    let idr = if idr_pic_dist != 0 { fo % idr_pic_dist } else { fo } == 0;

    if idr {
        return FRAME_I | FRAME_REF | FRAME_IDR;
    }

    if fo % gop_pic_size == 0 {
        return FRAME_I | FRAME_REF;
    }

    if fo % gop_pic_size % par.gop_ref_dist == 0 {
        return FRAME_P | FRAME_REF;
    }

    if ((fo + 1) % gop_pic_size == 0 && par.gop_closed)
        || (idr_pic_dist != 0 && idr_pic_dist != u32::MAX && (fo + 1) % idr_pic_dist == 0)
    {
        // switch the last B of the (closed) GOP to P
        return FRAME_P | FRAME_REF;
    }

    FRAME_B
}

/// Encoding order of display position `display` within a span of `num`
/// consecutive B frames, pivot-first. Also yields whether the position is a
/// reference and its pyramid tier.
pub fn bi_frame_location(display: u32, num: u32) -> (u32, bool, u32) {
    let mut begin = 0;
    let mut end = num;
    let mut level = 1;
    let mut before = 0;

    loop {
        let is_ref = end - begin > 1;
        let pivot = (begin + end) / 2;

        if display == pivot {
            return (level + before, is_ref, level);
        }

        level += 1;
        if display < pivot {
            end = pivot;
        } else {
            before += pivot - begin;
            begin = pivot + 1;
        }
    }
}

/// Pyramid tier of the `i`-th P frame in a low-delay anchor interval of
/// `num` frames.
pub fn p_frame_level(i: u32, num: u32) -> u8 {
    if i == 0 || i >= num {
        return 0;
    }

    let mut level = 1u8;
    let mut begin = 0;
    let mut end = num;
    let mut t = (begin + end + 1) / 2;

    while t != i {
        level += 1;
        if i > t {
            begin = t;
        } else {
            end = t;
        }
        t = (begin + end + 1) / 2;
    }

    level
}

/// QP-offset layer for a P frame, from its distance to the last I frame.
pub fn p_layer(par: &GopParams, order: u32) -> u8 {
    if par.is_low_delay() {
        std::cmp::min(7, p_frame_level(order % par.p_pyr_interval.max(1), par.p_pyr_interval))
    } else {
        0
    }
}

fn l1_ready(dpb: &Dpb, poc: i32) -> bool {
    dpb.iter().any(|f| f.poc > poc)
}

fn bpyr_reorder<T: HasFrameInfo>(frames: &mut [T], brefs: &[usize]) -> usize {
    if frames[brefs[0]].info().bpo == BPO_UNKNOWN {
        let num = brefs.len() as u32;
        for (i, &idx) in brefs.iter().enumerate() {
            let (bpo, is_ref_pos, level) = bi_frame_location(i as u32, num);
            let f = frames[idx].info_mut();
            f.bpo = bpo;
            f.level = level;
            if is_ref_pos {
                f.frame_type |= FRAME_REF;
            }
        }
    }

    let mut min_bpo = BPO_UNKNOWN;
    let mut which = 0;
    for (i, &idx) in brefs.iter().enumerate() {
        if frames[idx].info().bpo < min_bpo {
            min_bpo = frames[idx].info().bpo;
            which = i;
        }
    }
    which
}

/// Picks the next frame to encode from the pending queue, in encoding order.
/// B frames wait until an L1 reference is in the DPB; with `flush` the tail
/// frame is forced to P so the queue can drain.
pub fn reorder<T: HasFrameInfo>(
    par: &GopParams,
    dpb: &Dpb,
    frames: &mut [T],
    flush: bool,
) -> Option<usize> {
    let mut top = 0;
    let mut b0: Option<usize> = None;
    let mut brefs: Vec<usize> = Vec::new();

    while top < frames.len() && is_b(frames[top].info().frame_type) {
        if l1_ready(dpb, frames[top].info().poc) {
            if par.b_pyramid {
                brefs.push(top);
            } else if is_ref(frames[top].info().frame_type) {
                if b0.map_or(true, |i| frames[top].info().poc - frames[i].info().poc < 2) {
                    return Some(top);
                }
            } else if b0.is_none() {
                b0 = Some(top);
            }
        }
        top += 1;
    }

    if !brefs.is_empty() {
        let i = bpyr_reorder(frames, &brefs);
        return Some(brefs[i]);
    }

    if b0.is_some() {
        return b0;
    }

    if flush && top == frames.len() && !frames.is_empty() {
        top -= 1;
        frames[top].info_mut().frame_type = FRAME_P | FRAME_REF;
    }

    (top < frames.len()).then_some(top)
}

/// The active DPB for a new frame: previous frame's after-state, reduced to
/// the RAP and LTRs at the first trailing frame after a RAP, stripped of
/// higher temporal layers, minus externally rejected LTRs.
pub fn init_dpb(
    prev_after: &Dpb,
    first_trail: bool,
    last_rap: i32,
    tid: u8,
    rejected_fo: &[u32],
) -> Dpb {
    let mut active = if first_trail {
        let mut d = Dpb::default();
        for f in prev_after.iter() {
            if f.poc == last_rap || f.ltr {
                // cannot overflow, this is a subset of a valid DPB
                let _ = d.push(*f);
            }
        }
        d
    } else {
        *prev_after
    };

    active.retain(|f| !(f.tid > 0 && f.tid >= tid));

    for &fo in rejected_fo {
        if let Some(idx) = active.idx_by_fo(fo) {
            if active[idx].ltr {
                active.remove(idx);
            }
        }
    }

    active
}

/// Whether `poc` is the next long-term candidate for the configured
/// LTR interval.
pub(crate) fn is_ltr_candidate(dpb: &Dpb, ltr_interval: u32, poc: i32) -> bool {
    let mut candidate = dpb[0].poc;

    for f in dpb.iter().skip(1) {
        if f.poc > candidate && f.poc - candidate >= ltr_interval as i32 {
            candidate = f.poc;
            break;
        }
    }

    poc == candidate || (candidate == 0 && poc >= ltr_interval as i32)
}

/// Stores `frame` in `dpb`, evicting by sliding window when full. LTRs sort
/// before STRs, both POC ascending. The victim is the minimum-POC STR except
/// for P-pyramid anchor retention and LTR promotion. `ltr_fo` marks frames
/// long-term by display order.
pub fn update_dpb(
    par: &GopParams,
    frame: &DpbFrame,
    dpb: &mut Dpb,
    ltr_fo: &[u32],
) -> Result<(), DpbError> {
    let mut end = dpb.len();
    let mut st0 = dpb.iter().position(|f| !f.ltr).unwrap_or(end);

    dpb.frames[..st0].sort_by_key(|f| f.poc);
    dpb.frames[st0..end].sort_by_key(|f| f.poc);

    // sliding window over STRs
    if end > 0 && end == usize::from(par.num_ref_frame) {
        if par.is_low_delay() && st0 == 0 {
            // P-pyramid: keep anchors spaced at the pyramid interval
            let interval = par.p_pyr_interval.max(1) as i32;
            st0 = 1;
            while st0 < end && (dpb.frames[st0].poc - dpb.frames[0].poc) % interval == 0 {
                st0 += 1;
            }
        } else if par.ltr_interval > 0 {
            // mark/replace the LTR
            if st0 == 0 {
                dpb.frames[0].ltr = true;
                st0 = 1;
            } else if dpb.frames[st0].poc - dpb.frames[0].poc >= par.ltr_interval as i32 {
                dpb.frames[st0].ltr = true;
                st0 = 0;
            }
        }

        dpb.remove(if st0 == end { 0 } else { st0 });
        end -= 1;
    }

    if end == MAX_DPB_SIZE {
        return Err(DpbError::Overflow);
    }
    dpb.frames[end] = *frame;

    if !ltr_fo.is_empty() {
        let mut st0 = dpb.iter().position(|f| !f.ltr).unwrap_or(dpb.len());
        let mut sort = false;

        for &fo in ltr_fo {
            if let Some(idx) = dpb.idx_by_fo(fo) {
                if !dpb[idx].ltr {
                    let mut ltr = dpb[idx];
                    ltr.ltr = true;
                    dpb.remove(idx);
                    // just removed one, the insert cannot fail
                    let _ = dpb.insert(st0, ltr);
                    st0 += 1;
                    sort = true;
                }
            }
        }

        if sort {
            dpb.frames[..st0].sort_by_key(|f| f.poc);
        }
    }

    if par.b_pyramid && (frame.ldb || frame.coding_type < CODING_TYPE_B) {
        // the previous mini-GOP's coding types no longer matter
        let len = dpb.len();
        for f in dpb.frames[..len.saturating_sub(1)].iter_mut() {
            f.coding_type = 0;
        }
    }

    Ok(())
}

/// Builds the reference picture lists for one frame. L0 holds past frames
/// POC-descending with LTRs from the second entry on, L1 future frames
/// POC-ascending; a B with no future reference borrows the last L0 entry,
/// and P copies L0 into L1 for GPB.
pub fn construct_rpl(
    par: &GopParams,
    dpb: &Dpb,
    is_b_frame: bool,
    poc: i32,
    tid: u8,
    num_ref_lx: [u8; 2],
) -> Result<Rpl, DpbError> {
    let mut rpl = Rpl::default();
    let mut ltr: Vec<u8> = Vec::new();
    let mut num_st_ref_l0 = usize::from(num_ref_lx[0]);

    let mut l0 = 0usize;
    let mut l1 = 0usize;

    for (i, f) in dpb.iter().enumerate() {
        if f.tid > tid {
            continue;
        }

        if poc > f.poc {
            if f.ltr || (par.ltr_interval > 0 && is_ltr_candidate(dpb, par.ltr_interval, f.poc)) {
                ltr.push(i as u8);
            } else {
                rpl.list[0][l0] = i as u8;
                l0 += 1;
            }
        } else if is_b_frame {
            rpl.list[1][l1] = i as u8;
            l1 += 1;
        }
    }

    num_st_ref_l0 = num_st_ref_l0.saturating_sub(usize::from(!ltr.is_empty()));

    if l0 > num_st_ref_l0 {
        // farthest first, so trimming from the front drops the farthest
        rpl.list[0][..l0].sort_by_key(|&i| std::cmp::Reverse((dpb[usize::from(i)].poc - poc).abs()));

        if par.is_low_delay() {
            // P-pyramid: prefer dropping non-anchor references
            let interval = par.p_pyr_interval.max(1) as i32;
            while l0 > num_st_ref_l0 {
                let anchor_poc = dpb[usize::from(rpl.list[0][0])].poc;
                let mut i = 0;
                while i < l0 && (dpb[usize::from(rpl.list[0][i])].poc - anchor_poc) % interval == 0 {
                    i += 1;
                }

                rpl.num_active[0] = l0 as u8;
                rpl.remove(0, if i >= l0 - 1 { 0 } else { i });
                l0 -= 1;
            }
        } else {
            let start = usize::from(par.ltr_interval > 0 && ltr.is_empty() && l0 > 1);
            rpl.num_active[0] = l0 as u8;
            while l0 > num_st_ref_l0 {
                rpl.remove(0, start);
                l0 -= 1;
            }
        }
    }

    if l1 > usize::from(num_ref_lx[1]) {
        rpl.list[1][..l1].sort_by_key(|&i| (dpb[usize::from(i)].poc - poc).abs());

        rpl.num_active[1] = l1 as u8;
        while l1 > usize::from(num_ref_lx[1]) {
            rpl.remove(1, l1 - 1);
            l1 -= 1;
        }
    }

    rpl.list[0][..l0].sort_by_key(|&i| std::cmp::Reverse(dpb[usize::from(i)].poc));
    rpl.list[1][..l1].sort_by_key(|&i| dpb[usize::from(i)].poc);

    if !ltr.is_empty() {
        ltr.sort_unstable();

        // LTR goes in as the second reference
        rpl.num_active[0] = l0 as u8;
        rpl.insert(0, usize::from(l0 > 0), ltr[0]);
        l0 += 1;

        for &idx in ltr.iter().skip(1) {
            if l0 >= usize::from(num_ref_lx[0]) {
                break;
            }
            rpl.insert(0, l0, idx);
            l0 += 1;
        }
    }

    if l0 == 0 {
        return Err(DpbError::EmptyRefList);
    }

    if is_b_frame && l1 == 0 {
        rpl.list[1][0] = rpl.list[0][l0 - 1];
        l1 = 1;
    }

    if !is_b_frame {
        l1 = 0;
        for i in 0..std::cmp::min(l0, usize::from(num_ref_lx[1])) {
            rpl.list[1][l1] = rpl.list[0][i];
            l1 += 1;
        }
    }

    rpl.num_active = [l0 as u8, l1 as u8];
    Ok(rpl)
}

/// Effective coding type of a frame given what it references.
pub fn get_coding_type(dpb: &Dpb, rpl: &Rpl, frame_type: u8, ldb: bool) -> u8 {
    if is_i(frame_type) {
        return CODING_TYPE_I;
    }

    if is_p(frame_type) {
        return CODING_TYPE_P;
    }

    if ldb {
        return CODING_TYPE_B;
    }

    let mut t = CODING_TYPE_B;

    for lx in 0..2 {
        for j in 0..usize::from(rpl.num_active[lx]) {
            let r = &dpb[usize::from(rpl.list[lx][j])];

            if r.ldb {
                continue;
            }

            if r.coding_type > CODING_TYPE_B {
                return CODING_TYPE_B2;
            }

            if r.coding_type == CODING_TYPE_B {
                t = CODING_TYPE_B1;
            }
        }
    }

    t
}

/// Slice NAL unit type for a frame. `rap_intra` requests CRA for non-IDR I
/// frames, demoted to TRAIL_R when an older LTR is still in the DPB.
pub fn sh_nut(frame: &DpbFrame, dpb_after: &Dpb, last_rap: i32, rap_intra: bool) -> NaluType {
    let is_reference = is_ref(frame.frame_type);

    if is_idr(frame.frame_type) {
        return NaluType::IdrWRadl;
    }

    if is_i(frame.frame_type) && rap_intra {
        for f in dpb_after.iter() {
            if f.ltr && f.idx_rec != frame.idx_rec {
                // following frames may refer to the previous GOP
                return NaluType::TrailR;
            }
        }
        return NaluType::CraNut;
    }

    if frame.tid > 0 {
        return if is_reference {
            NaluType::TsaR
        } else {
            NaluType::TsaN
        };
    }

    if frame.poc > last_rap {
        return if is_reference {
            NaluType::TrailR
        } else {
            NaluType::TrailN
        };
    }

    if is_reference {
        NaluType::RaslR
    } else {
        NaluType::RaslN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_frame(poc: i32, idx_rec: u8) -> DpbFrame {
        DpbFrame {
            poc,
            fo: poc as u32,
            frame_type: FRAME_P | FRAME_REF,
            idx_rec,
            ..Default::default()
        }
    }

    fn dpb_with_pocs(pocs: &[i32]) -> Dpb {
        let mut dpb = Dpb::default();
        for (i, &poc) in pocs.iter().enumerate() {
            dpb.push(str_frame(poc, i as u8)).unwrap();
        }
        dpb
    }

    #[test]
    fn frame_type_cadence() {
        let par = GopParams {
            gop_pic_size: 8,
            gop_ref_dist: 4,
            idr_interval: 1,
            ..Default::default()
        };

        assert_eq!(get_frame_type(&par, 0), FRAME_I | FRAME_REF | FRAME_IDR);
        assert_eq!(get_frame_type(&par, 1), FRAME_B);
        assert_eq!(get_frame_type(&par, 4), FRAME_P | FRAME_REF);
        // last B before the IDR becomes P
        assert_eq!(get_frame_type(&par, 7), FRAME_P | FRAME_REF);
        assert_eq!(get_frame_type(&par, 8), FRAME_I | FRAME_REF | FRAME_IDR);
    }

    #[test]
    fn frame_type_closed_gop() {
        let par = GopParams {
            gop_pic_size: 8,
            gop_ref_dist: 4,
            idr_interval: 2,
            gop_closed: true,
            ..Default::default()
        };

        assert_eq!(get_frame_type(&par, 7), FRAME_P | FRAME_REF);
        assert_eq!(get_frame_type(&par, 8), FRAME_I | FRAME_REF);
        assert_eq!(get_frame_type(&par, 16), FRAME_I | FRAME_REF | FRAME_IDR);
    }

    #[test]
    fn bi_frame_location_pivot_first() {
        // Four Bs: the pivot (display 2) is encoded first, then display 1,
        // then the leaves.
        assert_eq!(bi_frame_location(2, 4), (1, true, 1));
        assert_eq!(bi_frame_location(1, 4), (2, true, 2));
        assert_eq!(bi_frame_location(0, 4), (3, false, 3));
        assert_eq!(bi_frame_location(3, 4), (4, false, 2));
    }

    #[test]
    fn p_frame_levels() {
        assert_eq!(p_frame_level(0, 4), 0);
        assert_eq!(p_frame_level(4, 4), 0);
        assert_eq!(p_frame_level(2, 4), 1);
        assert_eq!(p_frame_level(1, 4), 2);
        assert_eq!(p_frame_level(3, 4), 2);
    }

    #[test]
    fn temporal_layer_assignment() {
        // 30/60 fps two-layer structure: odd frames are the top layer.
        let tl = TemporalLayers::new(&[1, 2]);

        assert!(tl.is_scalable());
        assert_eq!(tl.num_layers(), 2);
        assert_eq!(tl.highest_tid(), 1);
        assert_eq!(tl.tid_of(0), 0);
        assert_eq!(tl.tid_of(1), 1);
        assert_eq!(tl.tid_of(2), 0);

        // 15/30/60 with a gap: layer ids keep their configured positions.
        let tl = TemporalLayers::new(&[1, 0, 2, 4]);
        assert_eq!(tl.highest_tid(), 3);
        assert_eq!(tl.tid_of(0), 0);
        assert_eq!(tl.tid_of(1), 3);
        assert_eq!(tl.tid_of(2), 2);

        let single = TemporalLayers::default();
        assert!(!single.is_scalable());
        assert_eq!(single.tid_of(7), 0);
    }

    #[test]
    fn sliding_window_evicts_oldest() {
        let par = GopParams {
            gop_pic_size: 0xffff,
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        let mut dpb = dpb_with_pocs(&[0, 2, 4, 6]);
        update_dpb(&par, &str_frame(8, 4), &mut dpb, &[]).unwrap();

        assert_eq!(dpb.len(), 4);
        let pocs: Vec<i32> = dpb.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![2, 4, 6, 8]);

        // contiguous prefix, unique POCs
        for i in 0..dpb.len() {
            assert_ne!(dpb[i].idx_rec, IDX_INVALID);
        }
        let mut seen = pocs.clone();
        seen.dedup();
        assert_eq!(seen.len(), pocs.len());
    }

    #[test]
    fn ltr_interval_marks_first_str() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 2,
            ltr_interval: 16,
            ..Default::default()
        };

        let mut dpb = dpb_with_pocs(&[0, 4]);
        update_dpb(&par, &str_frame(8, 2), &mut dpb, &[]).unwrap();

        // POC 0 becomes the LTR, the window evicts POC 4 instead.
        assert!(dpb[0].ltr);
        assert_eq!(dpb[0].poc, 0);
        let pocs: Vec<i32> = dpb.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 8]);
    }

    #[test]
    fn explicit_ltr_marking_moves_to_front() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 8,
            ..Default::default()
        };

        let mut dpb = dpb_with_pocs(&[0, 4]);
        update_dpb(&par, &str_frame(8, 2), &mut dpb, &[4]).unwrap();

        assert!(dpb[0].ltr);
        assert_eq!(dpb[0].poc, 4);
        assert!(!dpb[1].ltr);
    }

    #[test]
    fn rpl_trims_farthest_and_sorts() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        let dpb = dpb_with_pocs(&[0, 2, 4, 8]);
        let rpl = construct_rpl(&par, &dpb, true, 6, 0, [2, 1]).unwrap();

        assert_eq!(rpl.num_active, [2, 1]);
        let l0: Vec<i32> = (0..2)
            .map(|i| dpb[usize::from(rpl.list[0][i])].poc)
            .collect();
        // POC descending, farthest (POC 0) dropped
        assert_eq!(l0, vec![4, 2]);
        assert_eq!(dpb[usize::from(rpl.list[1][0])].poc, 8);
    }

    #[test]
    fn b_without_future_ref_borrows_l0() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        let dpb = dpb_with_pocs(&[0, 2]);
        let rpl = construct_rpl(&par, &dpb, true, 4, 0, [2, 1]).unwrap();

        assert_eq!(rpl.num_active[1], 1);
        assert_eq!(rpl.list[1][0], rpl.list[0][1]);
    }

    #[test]
    fn p_frame_copies_l0_to_l1() {
        let par = GopParams {
            gop_ref_dist: 1,
            num_ref_frame: 4,
            ..Default::default()
        };

        let dpb = dpb_with_pocs(&[0, 1, 2]);
        let rpl = construct_rpl(&par, &dpb, false, 3, 0, [3, 2]).unwrap();

        assert_eq!(rpl.num_active[0], 3);
        assert_eq!(rpl.num_active[1], 2);
        assert_eq!(rpl.list[1][0], rpl.list[0][0]);
        assert_eq!(rpl.list[1][1], rpl.list[0][1]);
    }

    #[test]
    fn empty_l0_is_an_error() {
        let par = GopParams::default();
        let dpb = Dpb::default();

        assert_eq!(
            construct_rpl(&par, &dpb, true, 1, 0, [1, 1]),
            Err(DpbError::EmptyRefList)
        );
    }

    #[test]
    fn ltr_inserted_as_second_reference() {
        let par = GopParams {
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        let mut dpb = dpb_with_pocs(&[0, 8, 12]);
        dpb.frames[0].ltr = true;

        let rpl = construct_rpl(&par, &dpb, false, 16, 0, [3, 1]).unwrap();
        let l0: Vec<i32> = (0..usize::from(rpl.num_active[0]))
            .map(|i| dpb[usize::from(rpl.list[0][i])].poc)
            .collect();
        assert_eq!(l0, vec![12, 0, 8]);
    }

    #[test]
    fn reorder_waits_for_l1() {
        let par = GopParams {
            gop_pic_size: 32,
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        // After the IDR (POC 0), the queue holds B1 B2 B3 P4.
        let dpb = dpb_with_pocs(&[0]);
        let mut frames: Vec<FrameBaseInfo> = (1..=4)
            .map(|poc| FrameBaseInfo {
                fo: poc as u32,
                poc,
                frame_type: get_frame_type(&par, poc as u32),
                ..Default::default()
            })
            .collect();

        // The P must go first; no L1 reference exists for the Bs yet.
        assert_eq!(reorder(&par, &dpb, &mut frames, false), Some(3));

        // Once POC 4 is in the DPB the first B is ready.
        let dpb = dpb_with_pocs(&[0, 4]);
        frames.remove(3);
        assert_eq!(reorder(&par, &dpb, &mut frames, false), Some(0));
    }

    #[test]
    fn reorder_b_pyramid_picks_pivot() {
        let par = GopParams {
            gop_pic_size: 32,
            gop_ref_dist: 4,
            num_ref_frame: 4,
            b_pyramid: true,
            ..Default::default()
        };

        let dpb = dpb_with_pocs(&[0, 4]);
        let mut frames: Vec<FrameBaseInfo> = (1..=3)
            .map(|poc| FrameBaseInfo {
                fo: poc as u32,
                poc,
                frame_type: FRAME_B,
                ..Default::default()
            })
            .collect();

        // Pivot of three Bs is display position 1 (POC 2), a reference.
        assert_eq!(reorder(&par, &dpb, &mut frames, false), Some(1));
        assert!(is_ref(frames[1].frame_type));
        assert_eq!(frames[1].level, 1);
    }

    #[test]
    fn reorder_flush_forces_tail_to_p() {
        let par = GopParams {
            gop_pic_size: 32,
            gop_ref_dist: 4,
            num_ref_frame: 4,
            ..Default::default()
        };

        let dpb = dpb_with_pocs(&[0]);
        let mut frames = vec![
            FrameBaseInfo {
                fo: 1,
                poc: 1,
                frame_type: FRAME_B,
                ..Default::default()
            },
            FrameBaseInfo {
                fo: 2,
                poc: 2,
                frame_type: FRAME_B,
                ..Default::default()
            },
        ];

        assert_eq!(reorder(&par, &dpb, &mut frames, false), None);
        assert_eq!(reorder(&par, &dpb, &mut frames, true), Some(1));
        assert_eq!(frames[1].frame_type, FRAME_P | FRAME_REF);
    }

    #[test]
    fn init_dpb_first_trail_keeps_rap_and_ltrs() {
        let mut prev_after = dpb_with_pocs(&[0, 4, 8]);
        prev_after.frames[1].ltr = true;

        let active = init_dpb(&prev_after, true, 8, 0, &[]);
        let pocs: Vec<i32> = active.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![4, 8]);
    }

    #[test]
    fn init_dpb_strips_higher_temporal_layers() {
        let mut prev_after = dpb_with_pocs(&[0, 1, 2]);
        prev_after.frames[1].tid = 2;
        prev_after.frames[2].tid = 1;

        let active = init_dpb(&prev_after, false, 0, 1, &[]);
        let pocs: Vec<i32> = active.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0]);
    }

    #[test]
    fn coding_type_tiers() {
        let mut dpb = dpb_with_pocs(&[0, 4]);
        dpb.frames[1].coding_type = CODING_TYPE_B;

        let mut rpl = Rpl::default();
        rpl.list[0][0] = 0;
        rpl.list[1][0] = 1;
        rpl.num_active = [1, 1];

        assert_eq!(get_coding_type(&dpb, &rpl, FRAME_B, false), CODING_TYPE_B1);

        dpb.frames[1].coding_type = CODING_TYPE_B1;
        assert_eq!(get_coding_type(&dpb, &rpl, FRAME_B, false), CODING_TYPE_B2);

        assert_eq!(get_coding_type(&dpb, &rpl, FRAME_I, false), CODING_TYPE_I);
        assert_eq!(
            get_coding_type(&dpb, &rpl, FRAME_P | FRAME_REF, false),
            CODING_TYPE_P
        );
    }

    #[test]
    fn nal_type_selection() {
        let dpb = Dpb::default();

        let mut frame = DpbFrame {
            frame_type: FRAME_I | FRAME_REF | FRAME_IDR,
            idx_rec: 0,
            ..Default::default()
        };
        assert_eq!(sh_nut(&frame, &dpb, 0, true), NaluType::IdrWRadl);

        frame.frame_type = FRAME_I | FRAME_REF;
        frame.poc = 16;
        assert_eq!(sh_nut(&frame, &dpb, 0, true), NaluType::CraNut);

        // LTR from a previous GOP forces TRAIL_R
        let mut with_ltr = dpb_with_pocs(&[0]);
        with_ltr.frames[0].ltr = true;
        with_ltr.frames[0].idx_rec = 5;
        assert_eq!(sh_nut(&frame, &with_ltr, 0, true), NaluType::TrailR);

        frame.frame_type = FRAME_B | FRAME_REF;
        frame.tid = 1;
        assert_eq!(sh_nut(&frame, &dpb, 0, true), NaluType::TsaR);

        frame.tid = 0;
        frame.poc = 20;
        assert_eq!(sh_nut(&frame, &dpb, 8, true), NaluType::TrailR);

        frame.frame_type = FRAME_B;
        frame.poc = 6;
        assert_eq!(sh_nut(&frame, &dpb, 8, true), NaluType::RaslN);
    }
}
