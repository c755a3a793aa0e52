//! Quantization and dequantization of transform coefficients
//!
//! The quantization step doubles every 6 QP. With `per = qp / 6` and
//! `rem = qp % 6`:
//!
//! - **Quantize**: `level = (|c| · Q[rem] + offset) >> qbits`, with
//!   `qbits = 14 + per + (15 − bitDepth − log2N)`
//! - **Dequantize**: `c = (level · D[rem] << per + round) >> (bitDepth + log2N − 9)`
//!
//! `Q[rem] · D[rem] ≈ 2^20`. The rounding offset is 171/512 of a step for
//! intra blocks and 85/512 for inter blocks, biasing small values to zero.
//!
//! Two encoder paths exist: a plain scalar quantizer with sign data hiding
//! and a rate-distortion optimized quantizer (RDOQ) that chooses each level,
//! each coefficient group and the last position by Lagrangian cost using
//! rate estimates from the live CABAC context states.

use super::cabac::{ContextModel, FRAC_BITS_ONE};
use super::config::{ChromaFormat, CodecConfig, CodingTools};
use super::contexts::ContextSet;
use super::residual::{
    csbf_ctx, csbf_neighbors, gt1_ctx, gt1_ctx_set, gt2_ctx, last_pos_binarization,
    last_prefix_ctx, next_c1, next_rice, remain_bins, sig_ctx, ResidualParams,
    GT1_FLAGS_PER_CG, SBH_THRESHOLD,
};
use super::scan::{ScanOrder, ScanPattern};
use crate::error::{Error, Result};

/// Highest luma QP
pub const MAX_QP: i32 = 51;

/// Forward scales for QP % 6
const QUANT_SCALES: [i64; 6] = [26214, 23302, 20560, 18396, 16384, 14564];

/// Inverse scales for QP % 6
const DEQUANT_SCALES: [i64; 6] = [40, 45, 51, 57, 64, 72];

/// Chroma QP for qPi in 30..=43 (4:2:0 only)
const CHROMA_QP_TABLE: [i32; 14] = [29, 30, 31, 32, 33, 33, 34, 34, 35, 35, 36, 36, 37, 37];

const QUANT_SHIFT: i32 = 14;
const MAX_TR_DYNAMIC_RANGE: i32 = 15;
const ENTROPY_LEVEL_MIN: i32 = -32768;
const ENTROPY_LEVEL_MAX: i32 = 32767;

/// QP of one component, including the bit depth offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpParam {
    qp: i32,
}

impl QpParam {
    /// Wrap a QP' value (QP + QpBdOffset, never negative)
    pub fn new(qp_prime: i32) -> Result<Self> {
        if !(0..=MAX_QP + 24).contains(&qp_prime) {
            return Err(Error::invalid_input(format!("Invalid QP': {}", qp_prime)));
        }
        Ok(Self { qp: qp_prime })
    }

    /// QP' of component `c_idx` for a luma QP in `-QpBdOffsetY..=51`
    pub fn for_component(config: &CodecConfig, qp_y: i32, c_idx: usize) -> Result<Self> {
        let bd_offset_y = config.qp_bd_offset_luma();
        if qp_y < -bd_offset_y || qp_y > MAX_QP {
            return Err(Error::invalid_input(format!("Luma QP {} out of range", qp_y)));
        }
        match c_idx {
            0 => Self::new(qp_y + bd_offset_y),
            1 | 2 => {
                let offset = if c_idx == 1 {
                    config.cb_qp_offset
                } else {
                    config.cr_qp_offset
                } as i32;
                Self::new(chroma_qp(
                    qp_y,
                    offset,
                    config.chroma_format,
                    config.qp_bd_offset_chroma(),
                ))
            }
            _ => Err(Error::invalid_input(format!("Invalid component index {}", c_idx))),
        }
    }

    /// QP' value
    pub fn qp(&self) -> i32 {
        self.qp
    }

    /// QP' / 6
    pub fn per(&self) -> i32 {
        self.qp / 6
    }

    /// QP' % 6
    pub fn rem(&self) -> usize {
        (self.qp % 6) as usize
    }
}

/// Chroma QP' from the luma QP, a component offset and the chroma format
pub fn chroma_qp(qp_y: i32, offset: i32, format: ChromaFormat, qp_bd_offset_c: i32) -> i32 {
    let qpi = (qp_y + offset).clamp(-qp_bd_offset_c, 57);
    let qpc = if format == ChromaFormat::Yuv420 {
        match qpi {
            i32::MIN..=29 => qpi,
            30..=43 => CHROMA_QP_TABLE[(qpi - 30) as usize],
            _ => qpi - 6,
        }
    } else {
        qpi.min(MAX_QP)
    };
    qpc + qp_bd_offset_c
}

/// Approximate quantizer step size of a QP
pub fn step_size(qp: i32) -> f64 {
    2.0_f64.powf((qp - 4) as f64 / 6.0)
}

/// Per-block quantization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantBlock {
    /// Component QP
    pub qp: QpParam,
    /// log2 of the block size
    pub log2_size: u8,
    /// Luma or chroma
    pub is_luma: bool,
    /// Intra rounding offset
    pub intra: bool,
    /// Coefficient scan, needed for sign hiding and RDOQ
    pub scan: ScanPattern,
    /// Transquant bypass: levels equal the residual
    pub bypass: bool,
}

impl QuantBlock {
    fn params(&self, sign_hiding: bool) -> ResidualParams {
        ResidualParams {
            log2_size: self.log2_size,
            is_luma: self.is_luma,
            scan: self.scan,
            sign_hiding,
        }
    }
}

/// Rate model inputs for RDOQ
#[derive(Debug, Clone, Copy)]
pub struct RdoqInput<'a> {
    /// Lagrangian multiplier (8-bit normalized SSE units per bit)
    pub lambda: f64,
    /// Current CABAC context states
    pub contexts: &'a ContextSet,
    /// Context of the block's coded block flag, if it is signaled
    pub cbf_model: Option<ContextModel>,
}

/// Quantization and dequantization engine
#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    bit_depth: u8,
    sign_hiding: bool,
    rdoq: bool,
}

impl Quantizer {
    /// Create a quantizer for a component bit depth
    pub fn new(bit_depth: u8, tools: &CodingTools) -> Result<Self> {
        if !matches!(bit_depth, 8 | 10 | 12) {
            return Err(Error::invalid_input(format!("Invalid bit depth: {}", bit_depth)));
        }
        Ok(Self {
            bit_depth,
            sign_hiding: tools.sign_data_hiding,
            rdoq: tools.rdoq,
        })
    }

    /// Bit depth of the component
    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// True when sign data hiding is applied
    pub fn sign_hiding(&self) -> bool {
        self.sign_hiding
    }

    fn transform_shift(&self, log2_size: u8) -> i32 {
        MAX_TR_DYNAMIC_RANGE - self.bit_depth as i32 - log2_size as i32
    }

    fn qbits(&self, block: &QuantBlock) -> i32 {
        QUANT_SHIFT + block.qp.per() + self.transform_shift(block.log2_size)
    }

    /// Quantize `coeffs` into `levels` (raster order), returning the CBF
    ///
    /// RDOQ runs when it is enabled and a rate model is supplied.
    pub fn quantize(
        &self,
        block: &QuantBlock,
        coeffs: &[i32],
        levels: &mut [i32],
        rdoq: Option<&RdoqInput>,
    ) -> bool {
        let area = 1usize << (2 * block.log2_size);
        assert!(coeffs.len() >= area && levels.len() >= area);

        if block.bypass {
            levels[..area].copy_from_slice(&coeffs[..area]);
            return levels[..area].iter().any(|&l| l != 0);
        }

        match rdoq {
            Some(input) if self.rdoq => self.quantize_rdoq(block, coeffs, levels, input),
            _ => self.quantize_plain(block, coeffs, levels),
        }
    }

    fn quantize_plain(&self, block: &QuantBlock, coeffs: &[i32], levels: &mut [i32]) -> bool {
        let area = 1usize << (2 * block.log2_size);
        let scale = QUANT_SCALES[block.qp.rem()];
        let qbits = self.qbits(block);
        let add = (if block.intra { 171i64 } else { 85 }) << (qbits - 9);
        let mut delta_u = vec![0i64; area];
        let mut abs_sum = 0i64;

        for pos in 0..area {
            let coeff = coeffs[pos] as i64;
            let tmp = coeff.abs() * scale;
            let q = (tmp + add) >> qbits;
            delta_u[pos] = (tmp - (q << qbits)) >> (qbits - 8);
            abs_sum += q;
            let level = if coeff < 0 { -q } else { q };
            levels[pos] = level.clamp(ENTROPY_LEVEL_MIN as i64, ENTROPY_LEVEL_MAX as i64) as i32;
        }

        if self.sign_hiding && abs_sum >= 2 {
            let params = block.params(true);
            let order = params.order();
            hide_signs(
                order,
                &mut levels[..area],
                coeffs,
                |_, pos, _| -(delta_u[pos] as f64),
                |_, pos, _| delta_u[pos] as f64,
            );
        }

        levels[..area].iter().any(|&l| l != 0)
    }

    fn quantize_rdoq(
        &self,
        block: &QuantBlock,
        coeffs: &[i32],
        levels: &mut [i32],
        input: &RdoqInput,
    ) -> bool {
        let log2 = block.log2_size;
        let size = 1usize << log2;
        let area = size * size;
        let is_luma = block.is_luma;
        let params = block.params(self.sign_hiding);
        let order = params.order();
        let scale = QUANT_SCALES[block.qp.rem()];
        let qbits = self.qbits(block);
        // Coefficient-domain error to 8-bit pixel SSE
        let err_scale = 1.0 / ((scale * scale) as f64 * 4f64.powi(7 - log2 as i32));
        let lambda = input.lambda;
        let ctx = input.contexts;
        let err = |level_double: i64, level: u32| -> f64 {
            let d = (level_double - ((level as i64) << qbits)) as f64;
            d * d * err_scale
        };

        let mut level_double = vec![0i64; area];
        let mut max_abs = vec![0u32; area];
        for pos in 0..area {
            let ld = (coeffs[pos] as i64).abs() * scale;
            level_double[pos] = ld;
            max_abs[pos] = ((ld + (1i64 << (qbits - 1))) >> qbits).min(ENTROPY_LEVEL_MAX as i64) as u32;
        }

        levels[..area].fill(0);
        let last_init = match (0..area).rev().find(|&s| max_abs[order.position(s)] > 0) {
            Some(s) => s,
            None => return false,
        };

        let cgs_w = size >> 2;
        let last_cg = last_init >> 4;
        let mut csbf = vec![false; cgs_w * cgs_w];
        let mut cost_coeff = vec![0f64; area];
        let mut cost_coeff0 = vec![0f64; area];
        let mut cost_sig = vec![0f64; area];
        let mut cost_csbf = vec![0f64; cgs_w * cgs_w];
        let mut rate_up = vec![0f64; area];
        let mut rate_down = vec![0f64; area];
        let mut abs_levels = vec![0u32; area];
        let mut block_uncoded = 0.0;
        let mut prev_c1 = 1u8;
        let mut zeroed_groups = 0usize;

        for s in (last_init + 1)..area {
            let pos = order.position(s);
            cost_coeff0[s] = err(level_double[pos], 0);
            cost_coeff[s] = cost_coeff0[s];
            block_uncoded += cost_coeff0[s];
        }

        for cg in (0..=last_cg).rev() {
            let cg_raster = order.cg_position(cg);
            let (cg_x, cg_y) = (cg_raster % cgs_w, cg_raster / cgs_w);
            let neighbors = csbf_neighbors(&csbf, cg_x, cg_y, cgs_w);
            let base = cg << 4;
            let top = (base + 15).min(last_init);
            let ctx_set = gt1_ctx_set(cg, is_luma, prev_c1);
            let gt2_model = &ctx.gt2_flag[gt2_ctx(ctx_set, is_luma)];

            let mut c1 = 1u8;
            let mut c1_idx = 0usize;
            let mut c2_idx = 0usize;
            let mut rice = 0u32;
            let mut cg_coded = 0.0;
            let mut cg_uncoded = 0.0;
            let mut any_nonzero = false;

            for s in (base..=top).rev() {
                let pos = order.position(s);
                let ld = level_double[pos];
                cost_coeff0[s] = err(ld, 0);
                block_uncoded += cost_coeff0[s];

                let sig_model = if s == last_init {
                    None
                } else {
                    let (x, y) = (pos & (size - 1), pos >> log2);
                    Some(&ctx.sig_coeff_flag[sig_ctx(&params, neighbors, x, y)])
                };
                let gt1_model = &ctx.gt1_flag[gt1_ctx(ctx_set, c1, is_luma)];
                let state = LevelState {
                    sig: sig_model,
                    gt1: gt1_model,
                    gt2: gt2_model,
                    c1_idx,
                    c2_idx,
                    rice,
                };

                let max = max_abs[pos];
                let mut best_level = 0u32;
                let mut best_cost = f64::MAX;
                if s != last_init {
                    best_cost = cost_coeff0[s] + lambda * state.rate(0);
                }
                if max > 0 {
                    let min_level = if max > 1 { max - 1 } else { 1 };
                    for level in (min_level..=max).rev() {
                        let cost = err(ld, level) + lambda * state.rate(level);
                        if cost < best_cost {
                            best_cost = cost;
                            best_level = level;
                        }
                    }
                }

                cost_coeff[s] = best_cost;
                cost_sig[s] = sig_model.map_or(0.0, |m| {
                    lambda * frac_to_bits(m.entropy_bits((best_level > 0) as u32))
                });
                rate_up[pos] = state.rate(best_level + 1) - state.rate(best_level);
                rate_down[pos] = if best_level > 0 {
                    state.rate(best_level - 1) - state.rate(best_level)
                } else {
                    0.0
                };
                abs_levels[pos] = best_level;
                cg_coded += best_cost;
                cg_uncoded += cost_coeff0[s];

                if best_level > 0 {
                    any_nonzero = true;
                    let base_level = if c1_idx < GT1_FLAGS_PER_CG {
                        2 + (c2_idx < 1) as u32
                    } else {
                        1
                    };
                    if best_level >= base_level {
                        rice = next_rice(rice, best_level);
                    }
                    if c1_idx < GT1_FLAGS_PER_CG {
                        c1 = next_c1(c1, best_level > 1);
                        if best_level > 1 {
                            c2_idx += 1;
                        }
                    }
                    c1_idx += 1;
                }
            }

            if cg > 0 && cg < last_cg {
                let model = &ctx.coded_sub_block_flag[csbf_ctx(neighbors, is_luma)];
                let flag1 = lambda * frac_to_bits(model.entropy_bits(1));
                let flag0 = lambda * frac_to_bits(model.entropy_bits(0));
                if !any_nonzero || cg_uncoded + flag0 < cg_coded + flag1 {
                    if any_nonzero {
                        zeroed_groups += 1;
                    }
                    for s in base..base + 16 {
                        abs_levels[order.position(s)] = 0;
                        cost_coeff[s] = cost_coeff0[s];
                        cost_sig[s] = 0.0;
                    }
                    cost_csbf[cg] = flag0;
                    csbf[cg_raster] = false;
                } else {
                    cost_csbf[cg] = flag1;
                    csbf[cg_raster] = true;
                    prev_c1 = c1;
                }
            } else {
                csbf[cg_raster] = true;
                if any_nonzero {
                    prev_c1 = c1;
                }
            }
        }

        // Best last position
        let cbf_cost = |bin: u32| {
            input
                .cbf_model
                .map_or(0.0, |m| lambda * frac_to_bits(m.entropy_bits(bin)))
        };
        let mut best_cost = block_uncoded + cbf_cost(0);
        let mut base_cost = cbf_cost(1)
            + cost_coeff.iter().sum::<f64>()
            + cost_csbf.iter().sum::<f64>();
        let mut best_last: Option<usize> = None;

        'search: for cg in (0..=last_cg).rev() {
            base_cost -= cost_csbf[cg];
            if !csbf[order.cg_position(cg)] {
                continue;
            }
            let base = cg << 4;
            for s in (base..=(base + 15).min(last_init)).rev() {
                let pos = order.position(s);
                let level = abs_levels[pos];
                if level > 0 {
                    let total = base_cost + lambda * last_position_bits(ctx, &params, pos) - cost_sig[s];
                    if total < best_cost {
                        best_cost = total;
                        best_last = Some(s);
                    }
                    if level > 1 {
                        break 'search;
                    }
                    base_cost += cost_coeff0[s] - cost_coeff[s];
                } else {
                    base_cost -= cost_sig[s];
                }
            }
        }

        let best_last = match best_last {
            Some(s) => s,
            None => {
                tracing::trace!(log2, "RDOQ zeroed the whole block");
                return false;
            }
        };

        for s in 0..=best_last {
            let pos = order.position(s);
            let level = abs_levels[pos] as i32;
            levels[pos] = if coeffs[pos] < 0 { -level } else { level };
        }

        tracing::trace!(
            log2,
            last_init,
            best_last,
            zeroed_groups,
            "RDOQ block summary"
        );

        if self.sign_hiding {
            let abs_sum: i64 = levels[..area].iter().map(|&l| l.unsigned_abs() as i64).sum();
            if abs_sum >= 2 {
                hide_signs(
                    order,
                    &mut levels[..area],
                    coeffs,
                    |_, pos, abs| {
                        err(level_double[pos], abs + 1) - err(level_double[pos], abs)
                            + lambda * rate_up[pos]
                    },
                    |_, pos, abs| {
                        err(level_double[pos], abs - 1) - err(level_double[pos], abs)
                            + lambda * rate_down[pos]
                    },
                );
            }
        }

        true
    }

    /// Scale `levels` back to coefficients (raster order)
    pub fn dequantize(&self, block: &QuantBlock, levels: &[i32], coeffs: &mut [i32]) {
        let area = 1usize << (2 * block.log2_size);
        assert!(coeffs.len() >= area && levels.len() >= area);

        if block.bypass {
            coeffs[..area].copy_from_slice(&levels[..area]);
            return;
        }

        let scale = DEQUANT_SCALES[block.qp.rem()] << block.qp.per();
        let shift = self.bit_depth as i32 + block.log2_size as i32 - 9;
        let add = 1i64 << (shift - 1);
        for (out, &level) in coeffs[..area].iter_mut().zip(&levels[..area]) {
            let value = (level as i64 * scale + add) >> shift;
            *out = value.clamp(i16::MIN as i64, i16::MAX as i64) as i32;
        }
    }
}

#[inline]
fn frac_to_bits(frac: u32) -> f64 {
    frac as f64 / FRAC_BITS_ONE as f64
}

/// Context states seen by one coefficient during RDOQ
struct LevelState<'a> {
    sig: Option<&'a ContextModel>,
    gt1: &'a ContextModel,
    gt2: &'a ContextModel,
    c1_idx: usize,
    c2_idx: usize,
    rice: u32,
}

impl LevelState<'_> {
    /// Estimated bits of coding `level` (including its sign)
    fn rate(&self, level: u32) -> f64 {
        if level == 0 {
            return self.sig.map_or(0.0, |m| frac_to_bits(m.entropy_bits(0)));
        }
        let mut frac = self.sig.map_or(0, |m| m.entropy_bits(1)) as u64 + FRAC_BITS_ONE;
        let base_level = if self.c1_idx < GT1_FLAGS_PER_CG {
            2 + (self.c2_idx < 1) as u32
        } else {
            1
        };
        if level >= base_level {
            frac += remain_bins(level - base_level, self.rice) as u64 * FRAC_BITS_ONE;
            if self.c1_idx < GT1_FLAGS_PER_CG {
                frac += self.gt1.entropy_bits(1) as u64;
                if self.c2_idx < 1 {
                    frac += self.gt2.entropy_bits(1) as u64;
                }
            }
        } else if level == 1 {
            frac += self.gt1.entropy_bits(0) as u64;
        } else if level == 2 {
            frac += (self.gt1.entropy_bits(1) + self.gt2.entropy_bits(0)) as u64;
        }
        frac as f64 / FRAC_BITS_ONE as f64
    }
}

/// Estimated bits of signaling `pos` as the last significant position
fn last_position_bits(ctx: &ContextSet, params: &ResidualParams, pos: usize) -> f64 {
    let size = params.size();
    let (mut x, mut y) = (pos & (size - 1), pos >> params.log2_size);
    if params.scan == ScanPattern::Vertical {
        std::mem::swap(&mut x, &mut y);
    }
    let (offset, shift) = last_prefix_ctx(params.log2_size, params.is_luma);
    let c_max = ((params.log2_size as u32) << 1) - 1;
    let mut frac = 0u64;
    for (coord, models) in [(x, &ctx.last_x_prefix), (y, &ctx.last_y_prefix)] {
        let (prefix, _, suffix_len) = last_pos_binarization(coord);
        for bin in 0..prefix {
            frac += models[offset + (bin as usize >> shift)].entropy_bits(1) as u64;
        }
        if prefix < c_max {
            frac += models[offset + (prefix as usize >> shift)].entropy_bits(0) as u64;
        }
        frac += suffix_len as u64 * FRAC_BITS_ONE;
    }
    frac as f64 / FRAC_BITS_ONE as f64
}

/// Adjust one level per coefficient group so the level parity carries the
/// sign of the group's first nonzero level
///
/// `up_cost` and `down_cost` give the cost of changing the magnitude at a
/// (scan index, raster position, current magnitude) by +1 or -1.
fn hide_signs<U, D>(order: &ScanOrder, levels: &mut [i32], coeffs: &[i32], up_cost: U, down_cost: D)
where
    U: Fn(usize, usize, u32) -> f64,
    D: Fn(usize, usize, u32) -> f64,
{
    let last_scan = match (0..order.len()).rev().find(|&s| levels[order.position(s)] != 0) {
        Some(s) => s,
        None => return,
    };
    let last_cg = last_scan >> 4;

    for cg in (0..=last_cg).rev() {
        let base = cg << 4;
        let nonzero: Vec<usize> = (base..base + 16)
            .filter(|&s| levels[order.position(s)] != 0)
            .collect();
        let (first_nz, last_nz) = match (nonzero.first(), nonzero.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => continue,
        };
        if last_nz - first_nz < SBH_THRESHOLD {
            continue;
        }

        let abs_sum: u32 = nonzero
            .iter()
            .map(|&s| levels[order.position(s)].unsigned_abs())
            .sum();
        let first_negative = levels[order.position(first_nz)] < 0;
        if first_negative == (abs_sum % 2 == 1) {
            continue;
        }

        let top = if cg == last_cg { last_nz } else { base + 15 };
        let mut best: Option<(f64, usize, i32)> = None;
        for s in (base..=top).rev() {
            let pos = order.position(s);
            let abs = levels[pos].unsigned_abs();
            let candidate = if abs != 0 {
                let up = up_cost(s, pos, abs);
                let down = if s == first_nz && abs == 1 {
                    f64::MAX
                } else {
                    down_cost(s, pos, abs)
                };
                if up < down {
                    (up, 1)
                } else {
                    (down, -1)
                }
            } else if s < first_nz && (coeffs[pos] < 0) != first_negative {
                (f64::MAX, 1)
            } else {
                (up_cost(s, pos, 0), 1)
            };
            if candidate.0 < best.map_or(f64::MAX, |b| b.0) {
                best = Some((candidate.0, pos, candidate.1));
            }
        }

        if let Some((_, pos, mut change)) = best {
            if levels[pos] == ENTROPY_LEVEL_MAX || levels[pos] == ENTROPY_LEVEL_MIN {
                change = -1;
            }
            if coeffs[pos] >= 0 {
                levels[pos] += change;
            } else {
                levels[pos] -= change;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::config::SliceType;
    use crate::codec::h265::residual::sign_hidden;
    use crate::codec::h265::scan::ScanTables;

    fn tools(sign_hiding: bool, rdoq: bool) -> CodingTools {
        CodingTools {
            sign_data_hiding: sign_hiding,
            rdoq,
            ..CodingTools::default()
        }
    }

    fn block(qp: i32, log2_size: u8) -> QuantBlock {
        QuantBlock {
            qp: QpParam::new(qp).unwrap(),
            log2_size,
            is_luma: true,
            intra: true,
            scan: ScanPattern::Diagonal,
            bypass: false,
        }
    }

    /// Every CG eligible for hiding has parity matching its first sign
    fn assert_parity(order: &ScanOrder, levels: &[i32]) {
        let params = ResidualParams {
            log2_size: order.log2_size(),
            is_luma: true,
            scan: ScanPattern::Diagonal,
            sign_hiding: true,
        };
        for cg in 0..order.num_cgs() {
            let nz: Vec<usize> = (cg * 16..cg * 16 + 16)
                .filter(|&s| levels[order.position(s)] != 0)
                .collect();
            if let (Some(&first), Some(&last)) = (nz.first(), nz.last()) {
                if sign_hidden(&params, first, last) {
                    let sum: u32 = nz.iter().map(|&s| levels[order.position(s)].unsigned_abs()).sum();
                    assert_eq!(levels[order.position(first)] < 0, sum % 2 == 1);
                }
            }
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Quantizer::new(9, &CodingTools::default()).is_err());
        assert!(QpParam::new(-1).is_err());
        let config = CodecConfig::hevc_main();
        assert!(QpParam::for_component(&config, 52, 0).is_err());
        assert!(QpParam::for_component(&config, 30, 3).is_err());
    }

    #[test]
    fn test_chroma_qp_mapping() {
        assert_eq!(chroma_qp(25, 0, ChromaFormat::Yuv420, 0), 25);
        assert_eq!(chroma_qp(30, 0, ChromaFormat::Yuv420, 0), 29);
        assert_eq!(chroma_qp(37, 0, ChromaFormat::Yuv420, 0), 34);
        assert_eq!(chroma_qp(51, 0, ChromaFormat::Yuv420, 0), 45);
        assert_eq!(chroma_qp(51, 6, ChromaFormat::Yuv420, 0), 51);
        assert_eq!(chroma_qp(40, 0, ChromaFormat::Yuv444, 0), 40);
        assert_eq!(chroma_qp(51, 6, ChromaFormat::Yuv422, 12), 63);
        assert_eq!(chroma_qp(-20, 0, ChromaFormat::Yuv420, 12), 0);
    }

    #[test]
    fn test_component_qp() {
        let mut config = CodecConfig::hevc_main();
        config.cb_qp_offset = 2;
        assert_eq!(QpParam::for_component(&config, 32, 0).unwrap().qp(), 32);
        assert_eq!(QpParam::for_component(&config, 32, 1).unwrap().qp(), 33);
        // 4:2:0 maps QPi 32 to 31
        assert_eq!(QpParam::for_component(&config, 32, 2).unwrap().qp(), 31);

        config.chroma_format = ChromaFormat::Yuv444;
        assert_eq!(QpParam::for_component(&config, 32, 1).unwrap().qp(), 34);
        assert_eq!(QpParam::for_component(&config, 32, 2).unwrap().qp(), 32);
    }

    #[test]
    fn test_zero_block_has_no_cbf() {
        for qp in [0, 22, 37, 51] {
            let q = Quantizer::new(8, &tools(true, true)).unwrap();
            let coeffs = [0i32; 16];
            let mut levels = [7i32; 16];
            assert!(!q.quantize(&block(qp, 2), &coeffs, &mut levels, None));
            assert!(levels.iter().all(|&l| l == 0));

            let ctx = ContextSet::new(SliceType::I, qp);
            let input = RdoqInput {
                lambda: 50.0,
                contexts: &ctx,
                cbf_model: None,
            };
            assert!(!q.quantize(&block(qp, 2), &coeffs, &mut levels, Some(&input)));
        }
    }

    #[test]
    fn test_quantization_is_monotonic() {
        let q = Quantizer::new(8, &tools(false, false)).unwrap();
        let b = block(27, 3);
        let mut prev = 0;
        for magnitude in (0..4000).step_by(7) {
            let mut coeffs = [0i32; 64];
            coeffs[9] = magnitude;
            let mut levels = [0i32; 64];
            q.quantize(&b, &coeffs, &mut levels, None);
            assert!(levels[9] >= prev);
            prev = levels[9];
        }
        assert!(prev > 0);
    }

    #[test]
    fn test_quantize_negative_coeffs() {
        let q = Quantizer::new(8, &tools(false, false)).unwrap();
        let coeffs = [-1000i32; 16];
        let mut levels = [0i32; 16];
        assert!(q.quantize(&block(26, 2), &coeffs, &mut levels, None));
        assert!(levels.iter().all(|&l| l < 0));
    }

    #[test]
    fn test_dequantize_inverts_scale() {
        let q = Quantizer::new(8, &tools(false, false)).unwrap();
        let b = block(22, 3);
        let mut coeffs = [0i32; 64];
        coeffs[0] = 900;
        coeffs[10] = -333;
        let mut levels = [0i32; 64];
        q.quantize(&b, &coeffs, &mut levels, None);
        let mut recon = [0i32; 64];
        q.dequantize(&b, &levels, &mut recon);
        // One level is 128 coefficient units for an 8x8 block at QP 22
        assert_eq!(levels[0], 7);
        assert_eq!(levels[10], -2);
        assert_eq!(recon[0], 896);
        assert_eq!(recon[10], -256);
    }

    #[test]
    fn test_dequantize_clips() {
        let q = Quantizer::new(8, &tools(false, false)).unwrap();
        let b = block(51, 5);
        let levels = vec![32767i32; 1024];
        let mut out = vec![0i32; 1024];
        q.dequantize(&b, &levels, &mut out);
        assert!(out.iter().all(|&c| c == i16::MAX as i32));
    }

    #[test]
    fn test_bypass_passes_through() {
        let q = Quantizer::new(8, &tools(true, true)).unwrap();
        let b = QuantBlock {
            bypass: true,
            ..block(30, 2)
        };
        let coeffs: Vec<i32> = (0..16).map(|i| i - 8).collect();
        let mut levels = vec![0i32; 16];
        assert!(q.quantize(&b, &coeffs, &mut levels, None));
        assert_eq!(levels, coeffs);
        let mut back = vec![0i32; 16];
        q.dequantize(&b, &levels, &mut back);
        assert_eq!(back, coeffs);
    }

    fn textured(n: usize) -> Vec<i32> {
        (0..n * n)
            .map(|i| {
                let (x, y) = (i % n, i / n);
                let magnitude = 2400 / (1 + x + y) as i32;
                if (x * 3 + y) % 2 == 0 {
                    magnitude
                } else {
                    -magnitude
                }
            })
            .collect()
    }

    #[test]
    fn test_sign_hiding_parity_plain() {
        let q = Quantizer::new(8, &tools(true, false)).unwrap();
        for log2 in 2..=5u8 {
            let n = 1usize << log2;
            let coeffs = textured(n);
            let mut levels = vec![0i32; n * n];
            q.quantize(&block(22, log2), &coeffs, &mut levels, None);
            assert_parity(ScanTables::get().order(log2, ScanPattern::Diagonal), &levels);
        }
    }

    #[test]
    fn test_rdoq_parity_and_rate_savings() {
        let q = Quantizer::new(8, &tools(true, true)).unwrap();
        let plain = Quantizer::new(8, &tools(false, false)).unwrap();
        let ctx = ContextSet::new(SliceType::I, 32);
        for log2 in 2..=5u8 {
            let n = 1usize << log2;
            let coeffs = textured(n);
            let b = block(32, log2);
            let input = RdoqInput {
                lambda: crate::codec::h265::rdo::lambda_from_qp(32, true),
                contexts: &ctx,
                cbf_model: Some(ctx.cbf_luma[1]),
            };
            let mut levels = vec![0i32; n * n];
            q.quantize(&b, &coeffs, &mut levels, Some(&input));
            assert_parity(ScanTables::get().order(log2, ScanPattern::Diagonal), &levels);

            let mut plain_levels = vec![0i32; n * n];
            plain.quantize(&b, &coeffs, &mut plain_levels, None);
            // Levels never exceed round-to-nearest by more than the hiding step
            for (&l, &p) in levels.iter().zip(&plain_levels) {
                assert!(l.unsigned_abs() <= p.unsigned_abs() + 2);
            }
            for (&l, &c) in levels.iter().zip(&coeffs) {
                assert!(l == 0 || (l < 0) == (c < 0));
            }
        }
    }

    #[test]
    fn test_rdoq_drops_isolated_small_level() {
        let q = Quantizer::new(8, &tools(false, true)).unwrap();
        let ctx = ContextSet::new(SliceType::I, 37);
        let n = 16;
        let mut coeffs = vec![0i32; n * n];
        coeffs[0] = 3000;
        // 0.8 of a step, far from the DC
        coeffs[15 * n + 15] = 288;
        let b = block(37, 4);

        let mut plain_levels = vec![0i32; n * n];
        let plain = Quantizer::new(8, &tools(false, false)).unwrap();
        plain.quantize(&b, &coeffs, &mut plain_levels, None);
        assert_eq!(plain_levels[15 * n + 15], 1);

        let input = RdoqInput {
            lambda: crate::codec::h265::rdo::lambda_from_qp(37, true),
            contexts: &ctx,
            cbf_model: None,
        };
        let mut levels = vec![0i32; n * n];
        assert!(q.quantize(&b, &coeffs, &mut levels, Some(&input)));
        assert!(levels[0] > 0);
        assert_eq!(levels[15 * n + 15], 0);
    }

    #[test]
    fn test_step_size_doubles_every_six() {
        assert!((step_size(4) - 1.0).abs() < 1e-9);
        assert!((step_size(28) / step_size(22) - 2.0).abs() < 1e-9);
    }
}
