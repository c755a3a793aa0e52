//! Syntax-element back-end over CABAC
//!
//! [`SymbolEncoder`] and [`SymbolDecoder`] are the pluggable symbol codec the
//! entropy adapter drives: one method per syntax element, each owning the
//! element's binarization and context selection. Context increments that
//! depend on neighboring CUs are derived by the adapter and passed in.
//!
//! [`Sbac`] implements both traits over any bin engine: with a
//! [`CabacWriter`](super::cabac::CabacWriter) it produces a bitstream, with a
//! [`BinCounter`](super::cabac::BinCounter) it estimates rate for RD
//! decisions, and with a [`CabacReader`](super::cabac::CabacReader) it parses.

use super::cabac::{BinDecoder, BinEncoder, ContextModel};
use super::config::SliceType;
use super::contexts::ContextSet;
use super::ctu::{InterDir, Mv, PartMode};
use super::residual::{decode_residual, encode_residual, ResidualParams};
use crate::error::{Error, Result};

/// Longest Exp-Golomb prefix accepted when parsing
const MAX_GOLOMB_PREFIX: u32 = 32;
/// Largest Golomb-Rice parameter
pub const MAX_GOLOMB_K: u32 = 31;

/// Inputs to the part_mode binarization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartModeCtx {
    pub intra: bool,
    pub log2_cb: u8,
    pub log2_min_cb: u8,
    pub amp: bool,
}

impl PartModeCtx {
    fn amp_allowed(&self) -> bool {
        self.amp && self.log2_cb > self.log2_min_cb
    }

    fn nxn_allowed(&self) -> bool {
        self.log2_cb == self.log2_min_cb && self.log2_cb > 3
    }
}

/// Encoder half of the symbol codec
pub trait SymbolEncoder {
    fn contexts(&self) -> &ContextSet;
    fn contexts_mut(&mut self) -> &mut ContextSet;
    /// Bits produced or estimated so far, in fractional-bit units
    fn frac_bits(&self) -> u64;

    fn encode_split_cu_flag(&mut self, split: bool, ctx_inc: usize);
    fn encode_cu_transquant_bypass_flag(&mut self, bypass: bool);
    fn encode_skip_flag(&mut self, skip: bool, ctx_inc: usize);
    fn encode_merge_flag(&mut self, merge: bool);
    fn encode_merge_idx(&mut self, idx: u8, max_cands: u8);
    fn encode_pred_mode_flag(&mut self, intra: bool);
    fn encode_part_mode(&mut self, part: PartMode, ctx: PartModeCtx);
    fn encode_prev_intra_luma_pred_flag(&mut self, flag: bool);
    fn encode_mpm_idx(&mut self, idx: u8, num_mpm: u8);
    fn encode_rem_intra_luma_pred_mode(&mut self, rem: u8, num_bits: u32);
    /// 0..=3 explicit chroma modes, 4 for the derived mode
    fn encode_intra_chroma_pred_mode(&mut self, symbol: u8);
    fn encode_inter_pred_idc(&mut self, dir: InterDir, small_pu: bool, ct_depth: u8);
    fn encode_ref_idx(&mut self, idx: u8, num_ref: u8);
    fn encode_mvd(&mut self, mvd: Mv);
    fn encode_mvp_idx(&mut self, idx: u8);
    fn encode_affine_flag(&mut self, flag: bool, ctx_inc: usize);
    fn encode_obmc_flag(&mut self, flag: bool);
    fn encode_rqt_root_cbf(&mut self, cbf: bool);
    fn encode_split_transform_flag(&mut self, split: bool, log2_size: u8);
    fn encode_cbf(&mut self, cbf: bool, is_luma: bool, depth: u8);
    fn encode_cu_qp_delta(&mut self, delta: i32);
    fn encode_transform_skip_flag(&mut self, skip: bool, is_luma: bool);
    fn encode_emt_cu_flag(&mut self, flag: bool, depth: u8);
    fn encode_emt_tu_idx(&mut self, idx: u8, intra: bool);
    fn encode_residual(&mut self, params: &ResidualParams, coeffs: &[i32]);
    fn encode_alf_ctrl_flag(&mut self, flag: bool, ctx_inc: usize);
    fn encode_end_of_slice_segment_flag(&mut self, last: bool);

    fn encode_flag_ep(&mut self, flag: bool);
    fn encode_bits_ep(&mut self, value: u32, num_bits: u32);
    /// Exp-Golomb of order `k` in bypass bins
    fn encode_exp_golomb_ep(&mut self, value: u32, k: u32);
    /// Signed Golomb-Rice code with parameter `k`
    fn encode_golomb_ep(&mut self, value: i32, k: u32);
}

/// Decoder half of the symbol codec
pub trait SymbolDecoder {
    fn contexts(&self) -> &ContextSet;
    fn contexts_mut(&mut self) -> &mut ContextSet;

    fn decode_split_cu_flag(&mut self, ctx_inc: usize) -> Result<bool>;
    fn decode_cu_transquant_bypass_flag(&mut self) -> Result<bool>;
    fn decode_skip_flag(&mut self, ctx_inc: usize) -> Result<bool>;
    fn decode_merge_flag(&mut self) -> Result<bool>;
    fn decode_merge_idx(&mut self, max_cands: u8) -> Result<u8>;
    fn decode_pred_mode_flag(&mut self) -> Result<bool>;
    fn decode_part_mode(&mut self, ctx: PartModeCtx) -> Result<PartMode>;
    fn decode_prev_intra_luma_pred_flag(&mut self) -> Result<bool>;
    fn decode_mpm_idx(&mut self, num_mpm: u8) -> Result<u8>;
    fn decode_rem_intra_luma_pred_mode(&mut self, num_bits: u32) -> Result<u8>;
    fn decode_intra_chroma_pred_mode(&mut self) -> Result<u8>;
    fn decode_inter_pred_idc(&mut self, small_pu: bool, ct_depth: u8) -> Result<InterDir>;
    fn decode_ref_idx(&mut self, num_ref: u8) -> Result<u8>;
    fn decode_mvd(&mut self) -> Result<Mv>;
    fn decode_mvp_idx(&mut self) -> Result<u8>;
    fn decode_affine_flag(&mut self, ctx_inc: usize) -> Result<bool>;
    fn decode_obmc_flag(&mut self) -> Result<bool>;
    fn decode_rqt_root_cbf(&mut self) -> Result<bool>;
    fn decode_split_transform_flag(&mut self, log2_size: u8) -> Result<bool>;
    fn decode_cbf(&mut self, is_luma: bool, depth: u8) -> Result<bool>;
    fn decode_cu_qp_delta(&mut self) -> Result<i32>;
    fn decode_transform_skip_flag(&mut self, is_luma: bool) -> Result<bool>;
    fn decode_emt_cu_flag(&mut self, depth: u8) -> Result<bool>;
    fn decode_emt_tu_idx(&mut self, intra: bool) -> Result<u8>;
    fn decode_residual(&mut self, params: &ResidualParams, coeffs: &mut [i32]) -> Result<()>;
    fn decode_alf_ctrl_flag(&mut self, ctx_inc: usize) -> Result<bool>;
    fn decode_end_of_slice_segment_flag(&mut self) -> Result<bool>;

    fn decode_flag_ep(&mut self) -> Result<bool>;
    fn decode_bits_ep(&mut self, num_bits: u32) -> Result<u32>;
    fn decode_exp_golomb_ep(&mut self, k: u32) -> Result<u32>;
    fn decode_golomb_ep(&mut self, k: u32) -> Result<i32>;
}

/// Syntax-based arithmetic coder: a bin engine plus the slice's contexts
#[derive(Debug, Clone)]
pub struct Sbac<B> {
    bins: B,
    contexts: ContextSet,
}

impl<B> Sbac<B> {
    /// Coder with contexts initialized for a slice
    pub fn new(bins: B, slice_type: SliceType, qp: i32) -> Self {
        Self {
            bins,
            contexts: ContextSet::new(slice_type, qp),
        }
    }

    /// Coder resuming from saved contexts
    pub fn with_contexts(bins: B, contexts: ContextSet) -> Self {
        Self { bins, contexts }
    }

    /// Reinitialize contexts (slice start, tile entry)
    pub fn reset_contexts(&mut self, slice_type: SliceType, qp: i32) {
        self.contexts = ContextSet::new(slice_type, qp);
    }

    pub fn bins(&self) -> &B {
        &self.bins
    }

    pub fn bins_mut(&mut self) -> &mut B {
        &mut self.bins
    }

    /// Release the bin engine
    pub fn into_inner(self) -> B {
        self.bins
    }
}

fn bin(flag: bool) -> u32 {
    flag as u32
}

impl<E: BinEncoder> Sbac<E> {
    fn write_truncated_unary_ep(&mut self, value: u32, max: u32) {
        for _ in 0..value {
            self.bins.encode_bin_ep(1);
        }
        if value < max {
            self.bins.encode_bin_ep(0);
        }
    }
}

impl<E: BinEncoder> SymbolEncoder for Sbac<E> {
    fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    fn contexts_mut(&mut self) -> &mut ContextSet {
        &mut self.contexts
    }

    fn frac_bits(&self) -> u64 {
        self.bins.frac_bits()
    }

    fn encode_split_cu_flag(&mut self, split: bool, ctx_inc: usize) {
        self.bins.encode_bin(bin(split), &mut self.contexts.split_cu_flag[ctx_inc]);
    }

    fn encode_cu_transquant_bypass_flag(&mut self, bypass: bool) {
        self.bins
            .encode_bin(bin(bypass), &mut self.contexts.cu_transquant_bypass_flag[0]);
    }

    fn encode_skip_flag(&mut self, skip: bool, ctx_inc: usize) {
        self.bins.encode_bin(bin(skip), &mut self.contexts.cu_skip_flag[ctx_inc]);
    }

    fn encode_merge_flag(&mut self, merge: bool) {
        self.bins.encode_bin(bin(merge), &mut self.contexts.merge_flag[0]);
    }

    fn encode_merge_idx(&mut self, idx: u8, max_cands: u8) {
        let max = max_cands as u32 - 1;
        let idx = idx as u32;
        debug_assert!(idx <= max);
        for i in 0..max {
            let b = bin(i < idx);
            if i == 0 {
                self.bins.encode_bin(b, &mut self.contexts.merge_idx[0]);
            } else {
                self.bins.encode_bin_ep(b);
            }
            if b == 0 {
                break;
            }
        }
    }

    fn encode_pred_mode_flag(&mut self, intra: bool) {
        self.bins.encode_bin(bin(intra), &mut self.contexts.pred_mode_flag[0]);
    }

    fn encode_part_mode(&mut self, part: PartMode, ctx: PartModeCtx) {
        let pm = &mut self.contexts.part_mode;
        if ctx.intra {
            self.bins.encode_bin(bin(part == PartMode::Part2Nx2N), &mut pm[0]);
            return;
        }
        if part == PartMode::Part2Nx2N {
            self.bins.encode_bin(1, &mut pm[0]);
            return;
        }
        self.bins.encode_bin(0, &mut pm[0]);
        let horizontal = part.is_horizontal_split();
        self.bins.encode_bin(bin(horizontal), &mut pm[1]);

        if ctx.amp_allowed() {
            self.bins.encode_bin(bin(!part.is_amp()), &mut pm[3]);
            if part.is_amp() {
                let second = matches!(part, PartMode::Part2NxnD | PartMode::PartnRx2N);
                self.bins.encode_bin_ep(bin(second));
            }
        } else if !horizontal && ctx.nxn_allowed() {
            self.bins.encode_bin(bin(part == PartMode::PartNx2N), &mut pm[2]);
        }
    }

    fn encode_prev_intra_luma_pred_flag(&mut self, flag: bool) {
        self.bins
            .encode_bin(bin(flag), &mut self.contexts.prev_intra_luma_pred_flag[0]);
    }

    fn encode_mpm_idx(&mut self, idx: u8, num_mpm: u8) {
        let max = num_mpm as u32 - 1;
        let idx = idx as u32;
        if num_mpm <= 3 {
            self.write_truncated_unary_ep(idx, max);
            return;
        }
        for i in 0..max {
            let b = bin(i < idx);
            if (i as usize) < self.contexts.mpm_idx.len() {
                self.bins.encode_bin(b, &mut self.contexts.mpm_idx[i as usize]);
            } else {
                self.bins.encode_bin_ep(b);
            }
            if b == 0 {
                break;
            }
        }
    }

    fn encode_rem_intra_luma_pred_mode(&mut self, rem: u8, num_bits: u32) {
        self.bins.encode_bins_ep(rem as u32, num_bits);
    }

    fn encode_intra_chroma_pred_mode(&mut self, symbol: u8) {
        if symbol == 4 {
            self.bins.encode_bin(0, &mut self.contexts.intra_chroma_pred_mode[0]);
        } else {
            self.bins.encode_bin(1, &mut self.contexts.intra_chroma_pred_mode[0]);
            self.bins.encode_bins_ep(symbol as u32, 2);
        }
    }

    fn encode_inter_pred_idc(&mut self, dir: InterDir, small_pu: bool, ct_depth: u8) {
        if !small_pu {
            self.bins.encode_bin(
                bin(dir == InterDir::Bi),
                &mut self.contexts.inter_pred_idc[ct_depth as usize],
            );
        }
        if dir != InterDir::Bi {
            self.bins
                .encode_bin(bin(dir == InterDir::L1), &mut self.contexts.inter_pred_idc[4]);
        }
    }

    fn encode_ref_idx(&mut self, idx: u8, num_ref: u8) {
        let max = num_ref as u32 - 1;
        let idx = idx as u32;
        for i in 0..max {
            let b = bin(i < idx);
            if i < 2 {
                self.bins.encode_bin(b, &mut self.contexts.ref_idx[i as usize]);
            } else {
                self.bins.encode_bin_ep(b);
            }
            if b == 0 {
                break;
            }
        }
    }

    fn encode_mvd(&mut self, mvd: Mv) {
        let (ax, ay) = (mvd.x.unsigned_abs(), mvd.y.unsigned_abs());
        self.bins.encode_bin(bin(ax > 0), &mut self.contexts.mvd[0]);
        self.bins.encode_bin(bin(ay > 0), &mut self.contexts.mvd[0]);
        if ax > 0 {
            self.bins.encode_bin(bin(ax > 1), &mut self.contexts.mvd[1]);
        }
        if ay > 0 {
            self.bins.encode_bin(bin(ay > 1), &mut self.contexts.mvd[1]);
        }
        for (abs, negative) in [(ax, mvd.x < 0), (ay, mvd.y < 0)] {
            if abs > 0 {
                if abs > 1 {
                    self.encode_exp_golomb_ep(abs - 2, 1);
                }
                self.bins.encode_bin_ep(bin(negative));
            }
        }
    }

    fn encode_mvp_idx(&mut self, idx: u8) {
        self.bins.encode_bin(bin(idx > 0), &mut self.contexts.mvp_idx[0]);
    }

    fn encode_affine_flag(&mut self, flag: bool, ctx_inc: usize) {
        self.bins.encode_bin(bin(flag), &mut self.contexts.affine_flag[ctx_inc]);
    }

    fn encode_obmc_flag(&mut self, flag: bool) {
        self.bins.encode_bin(bin(flag), &mut self.contexts.obmc_flag[0]);
    }

    fn encode_rqt_root_cbf(&mut self, cbf: bool) {
        self.bins.encode_bin(bin(cbf), &mut self.contexts.rqt_root_cbf[0]);
    }

    fn encode_split_transform_flag(&mut self, split: bool, log2_size: u8) {
        let ctx = (5u8.saturating_sub(log2_size) as usize).min(2);
        self.bins
            .encode_bin(bin(split), &mut self.contexts.split_transform_flag[ctx]);
    }

    fn encode_cbf(&mut self, cbf: bool, is_luma: bool, depth: u8) {
        if is_luma {
            let ctx = if depth == 0 { 1 } else { 0 };
            self.bins.encode_bin(bin(cbf), &mut self.contexts.cbf_luma[ctx]);
        } else {
            let ctx = (depth as usize).min(4);
            self.bins.encode_bin(bin(cbf), &mut self.contexts.cbf_chroma[ctx]);
        }
    }

    fn encode_cu_qp_delta(&mut self, delta: i32) {
        let abs = delta.unsigned_abs();
        let prefix = abs.min(5);
        for i in 0..5 {
            let b = bin(i < prefix);
            let ctx = if i == 0 { 0 } else { 1 };
            self.bins.encode_bin(b, &mut self.contexts.cu_qp_delta_abs[ctx]);
            if b == 0 {
                break;
            }
        }
        if abs >= 5 {
            self.encode_exp_golomb_ep(abs - 5, 0);
        }
        if abs > 0 {
            self.bins.encode_bin_ep(bin(delta < 0));
        }
    }

    fn encode_transform_skip_flag(&mut self, skip: bool, is_luma: bool) {
        let ctx = if is_luma { 0 } else { 1 };
        self.bins
            .encode_bin(bin(skip), &mut self.contexts.transform_skip_flag[ctx]);
    }

    fn encode_emt_cu_flag(&mut self, flag: bool, depth: u8) {
        let ctx = (depth as usize).min(3);
        self.bins.encode_bin(bin(flag), &mut self.contexts.emt_cu_flag[ctx]);
    }

    fn encode_emt_tu_idx(&mut self, idx: u8, intra: bool) {
        let base = if intra { 0 } else { 2 };
        self.bins
            .encode_bin((idx & 1) as u32, &mut self.contexts.emt_tu_idx[base]);
        self.bins
            .encode_bin(((idx >> 1) & 1) as u32, &mut self.contexts.emt_tu_idx[base + 1]);
    }

    fn encode_residual(&mut self, params: &ResidualParams, coeffs: &[i32]) {
        encode_residual(&mut self.bins, &mut self.contexts, params, coeffs);
    }

    fn encode_alf_ctrl_flag(&mut self, flag: bool, ctx_inc: usize) {
        self.bins.encode_bin(bin(flag), &mut self.contexts.alf_ctrl_flag[ctx_inc]);
    }

    fn encode_end_of_slice_segment_flag(&mut self, last: bool) {
        self.bins.encode_bin_trm(bin(last));
    }

    fn encode_flag_ep(&mut self, flag: bool) {
        self.bins.encode_bin_ep(bin(flag));
    }

    fn encode_bits_ep(&mut self, value: u32, num_bits: u32) {
        self.bins.encode_bins_ep(value, num_bits);
    }

    fn encode_exp_golomb_ep(&mut self, value: u32, k: u32) {
        let mut symbol = value;
        let mut count = k;
        while count < 31 && symbol >= (1 << count) {
            self.bins.encode_bin_ep(1);
            symbol -= 1 << count;
            count += 1;
        }
        self.bins.encode_bin_ep(0);
        self.bins.encode_bins_ep(symbol, count);
    }

    fn encode_golomb_ep(&mut self, value: i32, k: u32) {
        debug_assert!(k <= MAX_GOLOMB_K, "Golomb parameter {} out of range", k);
        let abs = value.unsigned_abs() as u64;
        let quotient = abs >> k;
        for _ in 0..quotient {
            self.bins.encode_bin_ep(1);
        }
        self.bins.encode_bin_ep(0);
        self.bins.encode_bins_ep((abs & ((1u64 << k) - 1)) as u32, k);
        if value != 0 {
            self.bins.encode_bin_ep(bin(value < 0));
        }
    }
}

impl<D: BinDecoder> Sbac<D> {
    fn read_truncated_unary_ep(&mut self, max: u32) -> Result<u32> {
        let mut value = 0;
        while value < max && self.bins.decode_bin_ep()? == 1 {
            value += 1;
        }
        Ok(value)
    }

    fn flag(&mut self, select: impl FnOnce(&mut ContextSet) -> &mut ContextModel) -> Result<bool> {
        let ctx = select(&mut self.contexts);
        Ok(self.bins.decode_bin(ctx)? == 1)
    }
}

impl<D: BinDecoder> SymbolDecoder for Sbac<D> {
    fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    fn contexts_mut(&mut self) -> &mut ContextSet {
        &mut self.contexts
    }

    fn decode_split_cu_flag(&mut self, ctx_inc: usize) -> Result<bool> {
        self.flag(|c| &mut c.split_cu_flag[ctx_inc])
    }

    fn decode_cu_transquant_bypass_flag(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.cu_transquant_bypass_flag[0])
    }

    fn decode_skip_flag(&mut self, ctx_inc: usize) -> Result<bool> {
        self.flag(|c| &mut c.cu_skip_flag[ctx_inc])
    }

    fn decode_merge_flag(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.merge_flag[0])
    }

    fn decode_merge_idx(&mut self, max_cands: u8) -> Result<u8> {
        let max = max_cands as u32 - 1;
        let mut idx = 0u32;
        while idx < max {
            let b = if idx == 0 {
                self.bins.decode_bin(&mut self.contexts.merge_idx[0])?
            } else {
                self.bins.decode_bin_ep()?
            };
            if b == 0 {
                break;
            }
            idx += 1;
        }
        Ok(idx as u8)
    }

    fn decode_pred_mode_flag(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.pred_mode_flag[0])
    }

    fn decode_part_mode(&mut self, ctx: PartModeCtx) -> Result<PartMode> {
        if ctx.intra {
            return Ok(if self.flag(|c| &mut c.part_mode[0])? {
                PartMode::Part2Nx2N
            } else {
                PartMode::PartNxN
            });
        }
        if self.flag(|c| &mut c.part_mode[0])? {
            return Ok(PartMode::Part2Nx2N);
        }
        let horizontal = self.flag(|c| &mut c.part_mode[1])?;

        if ctx.amp_allowed() {
            if self.flag(|c| &mut c.part_mode[3])? {
                return Ok(if horizontal {
                    PartMode::Part2NxN
                } else {
                    PartMode::PartNx2N
                });
            }
            let second = self.bins.decode_bin_ep()? == 1;
            return Ok(match (horizontal, second) {
                (true, false) => PartMode::Part2NxnU,
                (true, true) => PartMode::Part2NxnD,
                (false, false) => PartMode::PartnLx2N,
                (false, true) => PartMode::PartnRx2N,
            });
        }
        if horizontal {
            return Ok(PartMode::Part2NxN);
        }
        if ctx.nxn_allowed() && !self.flag(|c| &mut c.part_mode[2])? {
            return Ok(PartMode::PartNxN);
        }
        Ok(PartMode::PartNx2N)
    }

    fn decode_prev_intra_luma_pred_flag(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.prev_intra_luma_pred_flag[0])
    }

    fn decode_mpm_idx(&mut self, num_mpm: u8) -> Result<u8> {
        let max = num_mpm as u32 - 1;
        if num_mpm <= 3 {
            return Ok(self.read_truncated_unary_ep(max)? as u8);
        }
        let mut idx = 0u32;
        while idx < max {
            let b = if (idx as usize) < self.contexts.mpm_idx.len() {
                self.bins.decode_bin(&mut self.contexts.mpm_idx[idx as usize])?
            } else {
                self.bins.decode_bin_ep()?
            };
            if b == 0 {
                break;
            }
            idx += 1;
        }
        Ok(idx as u8)
    }

    fn decode_rem_intra_luma_pred_mode(&mut self, num_bits: u32) -> Result<u8> {
        Ok(self.bins.decode_bins_ep(num_bits)? as u8)
    }

    fn decode_intra_chroma_pred_mode(&mut self) -> Result<u8> {
        if !self.flag(|c| &mut c.intra_chroma_pred_mode[0])? {
            return Ok(4);
        }
        Ok(self.bins.decode_bins_ep(2)? as u8)
    }

    fn decode_inter_pred_idc(&mut self, small_pu: bool, ct_depth: u8) -> Result<InterDir> {
        if !small_pu && self.flag(|c| &mut c.inter_pred_idc[ct_depth as usize])? {
            return Ok(InterDir::Bi);
        }
        Ok(if self.flag(|c| &mut c.inter_pred_idc[4])? {
            InterDir::L1
        } else {
            InterDir::L0
        })
    }

    fn decode_ref_idx(&mut self, num_ref: u8) -> Result<u8> {
        let max = num_ref as u32 - 1;
        let mut idx = 0u32;
        while idx < max {
            let b = if idx < 2 {
                self.bins.decode_bin(&mut self.contexts.ref_idx[idx as usize])?
            } else {
                self.bins.decode_bin_ep()?
            };
            if b == 0 {
                break;
            }
            idx += 1;
        }
        Ok(idx as u8)
    }

    fn decode_mvd(&mut self) -> Result<Mv> {
        let gr0_x = self.flag(|c| &mut c.mvd[0])?;
        let gr0_y = self.flag(|c| &mut c.mvd[0])?;
        let gr1_x = gr0_x && self.flag(|c| &mut c.mvd[1])?;
        let gr1_y = gr0_y && self.flag(|c| &mut c.mvd[1])?;

        let mut out = [0i32; 2];
        for (i, (gr0, gr1)) in [(gr0_x, gr1_x), (gr0_y, gr1_y)].into_iter().enumerate() {
            if !gr0 {
                continue;
            }
            let abs = if gr1 {
                self.decode_exp_golomb_ep(1)? as i64 + 2
            } else {
                1
            };
            if abs > i32::MAX as i64 {
                tracing::warn!("mvd magnitude {} out of range", abs);
                return Err(Error::conformance("mvd magnitude out of range"));
            }
            let negative = self.bins.decode_bin_ep()? == 1;
            out[i] = if negative { -(abs as i32) } else { abs as i32 };
        }
        Ok(Mv::new(out[0], out[1]))
    }

    fn decode_mvp_idx(&mut self) -> Result<u8> {
        Ok(self.flag(|c| &mut c.mvp_idx[0])? as u8)
    }

    fn decode_affine_flag(&mut self, ctx_inc: usize) -> Result<bool> {
        self.flag(|c| &mut c.affine_flag[ctx_inc])
    }

    fn decode_obmc_flag(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.obmc_flag[0])
    }

    fn decode_rqt_root_cbf(&mut self) -> Result<bool> {
        self.flag(|c| &mut c.rqt_root_cbf[0])
    }

    fn decode_split_transform_flag(&mut self, log2_size: u8) -> Result<bool> {
        let ctx = (5u8.saturating_sub(log2_size) as usize).min(2);
        self.flag(|c| &mut c.split_transform_flag[ctx])
    }

    fn decode_cbf(&mut self, is_luma: bool, depth: u8) -> Result<bool> {
        if is_luma {
            let ctx = if depth == 0 { 1 } else { 0 };
            self.flag(|c| &mut c.cbf_luma[ctx])
        } else {
            let ctx = (depth as usize).min(4);
            self.flag(|c| &mut c.cbf_chroma[ctx])
        }
    }

    fn decode_cu_qp_delta(&mut self) -> Result<i32> {
        let mut prefix = 0u32;
        while prefix < 5 {
            let ctx = if prefix == 0 { 0 } else { 1 };
            if self.bins.decode_bin(&mut self.contexts.cu_qp_delta_abs[ctx])? == 0 {
                break;
            }
            prefix += 1;
        }
        let mut abs = prefix as i64;
        if prefix == 5 {
            abs += self.decode_exp_golomb_ep(0)? as i64;
        }
        if abs > 64 {
            tracing::warn!("cu_qp_delta_abs {} out of range", abs);
            return Err(Error::conformance(format!("cu_qp_delta_abs {} out of range", abs)));
        }
        if abs > 0 && self.bins.decode_bin_ep()? == 1 {
            abs = -abs;
        }
        Ok(abs as i32)
    }

    fn decode_transform_skip_flag(&mut self, is_luma: bool) -> Result<bool> {
        let ctx = if is_luma { 0 } else { 1 };
        self.flag(|c| &mut c.transform_skip_flag[ctx])
    }

    fn decode_emt_cu_flag(&mut self, depth: u8) -> Result<bool> {
        let ctx = (depth as usize).min(3);
        self.flag(|c| &mut c.emt_cu_flag[ctx])
    }

    fn decode_emt_tu_idx(&mut self, intra: bool) -> Result<u8> {
        let base = if intra { 0 } else { 2 };
        let low = self.bins.decode_bin(&mut self.contexts.emt_tu_idx[base])?;
        let high = self.bins.decode_bin(&mut self.contexts.emt_tu_idx[base + 1])?;
        Ok((low | (high << 1)) as u8)
    }

    fn decode_residual(&mut self, params: &ResidualParams, coeffs: &mut [i32]) -> Result<()> {
        decode_residual(&mut self.bins, &mut self.contexts, params, coeffs)
    }

    fn decode_alf_ctrl_flag(&mut self, ctx_inc: usize) -> Result<bool> {
        self.flag(|c| &mut c.alf_ctrl_flag[ctx_inc])
    }

    fn decode_end_of_slice_segment_flag(&mut self) -> Result<bool> {
        Ok(self.bins.decode_bin_trm()? == 1)
    }

    fn decode_flag_ep(&mut self) -> Result<bool> {
        Ok(self.bins.decode_bin_ep()? == 1)
    }

    fn decode_bits_ep(&mut self, num_bits: u32) -> Result<u32> {
        self.bins.decode_bins_ep(num_bits)
    }

    fn decode_exp_golomb_ep(&mut self, k: u32) -> Result<u32> {
        let mut count = k;
        let mut value = 0u64;
        while self.bins.decode_bin_ep()? == 1 {
            value += 1u64 << count;
            count += 1;
            if count > MAX_GOLOMB_PREFIX {
                tracing::warn!("Exp-Golomb prefix exceeds {} bins", MAX_GOLOMB_PREFIX);
                return Err(Error::conformance("Exp-Golomb prefix too long"));
            }
        }
        value += self.bins.decode_bins_ep(count)? as u64;
        u32::try_from(value).map_err(|_| {
            tracing::warn!("Exp-Golomb value {} overflows", value);
            Error::conformance("Exp-Golomb value overflows")
        })
    }

    fn decode_golomb_ep(&mut self, k: u32) -> Result<i32> {
        if k > MAX_GOLOMB_K {
            return Err(Error::invalid_input(format!("Golomb parameter {} out of range", k)));
        }
        // Largest magnitude an i32 can carry is 2^31
        let max_quotient = (1u64 << 31) >> k;
        let mut quotient = 0u64;
        while self.bins.decode_bin_ep()? == 1 {
            quotient += 1;
            if quotient > max_quotient {
                tracing::warn!("Golomb quotient exceeds {}", max_quotient);
                return Err(Error::conformance("Golomb quotient too long"));
            }
        }
        let abs = (quotient << k) | self.bins.decode_bins_ep(k)? as u64;
        let value = if abs != 0 && self.bins.decode_bin_ep()? == 1 {
            -(abs as i64)
        } else {
            abs as i64
        };
        i32::try_from(value).map_err(|_| {
            tracing::warn!("Golomb value {} overflows", value);
            Error::conformance("Golomb value overflows")
        })
    }
}
