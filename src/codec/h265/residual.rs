//! Residual (transform coefficient) syntax
//!
//! A coded transform block is serialized as:
//!
//! 1. Last significant position, prefix (context coded, truncated unary)
//!    then suffix (bypass) for x and y
//! 2. Per 4x4 coefficient group (CG), in reverse scan order:
//!    coded_sub_block_flag, sig_coeff_flag per position,
//!    greater1 flags for the first 8 significant levels, one greater2 flag,
//!    sign bits (one may be hidden in the level parity), then remainders
//!    with an adaptive Rice parameter
//!
//! Context selection helpers are shared with the rate estimation in
//! [`super::quant`].

use super::cabac::{BinDecoder, BinEncoder};
use super::contexts::{
    ContextSet, NUM_GT1_CTX_LUMA, NUM_GT2_CTX_LUMA, NUM_LAST_CTX_LUMA, NUM_SIG_CTX_LUMA,
};
use super::scan::{ScanOrder, ScanPattern, ScanTables};
use crate::error::{Error, Result};

/// Greater1 flags coded per coefficient group
pub const GT1_FLAGS_PER_CG: usize = 8;

/// Minimum scan distance between first and last level for sign hiding
pub const SBH_THRESHOLD: usize = 4;

/// Remainder prefix length where the escape code starts
const COEF_REMAIN_BIN_REDUCTION: u32 = 3;

/// Longest remainder prefix accepted by the parser
const MAX_REMAIN_PREFIX: u32 = 32;

/// Largest coded level magnitude
pub const MAX_LEVEL: i32 = 32768;

/// Last position prefix per coordinate
pub(crate) const GROUP_IDX: [u8; 64] = [
    0, 1, 2, 3, 4, 4, 5, 5, 6, 6, 6, 6, 7, 7, 7, 7, 8, 8, 8, 8, 8, 8, 8, 8, 9, 9, 9, 9, 9, 9, 9,
    9, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11, 11, 11, 11, 11, 11, 11,
    11, 11, 11, 11, 11, 11, 11, 11, 11,
];

/// Smallest coordinate of each prefix group
pub(crate) const MIN_IN_GROUP: [u8; 12] = [0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48];

/// sig_coeff_flag context per raster position of a 4x4 block
const CTX_IDX_MAP_4X4: [u8; 16] = [0, 1, 4, 5, 2, 3, 4, 5, 6, 6, 8, 8, 7, 7, 8, 8];

/// Per-block coding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidualParams {
    /// log2 of the (square) block size
    pub log2_size: u8,
    /// Luma or chroma context sets
    pub is_luma: bool,
    /// Coefficient scan
    pub scan: ScanPattern,
    /// Sign data hiding is active for this block
    pub sign_hiding: bool,
}

impl ResidualParams {
    /// Block width in coefficients
    pub fn size(&self) -> usize {
        1 << self.log2_size
    }

    pub(crate) fn order(&self) -> &'static ScanOrder {
        ScanTables::get().order(self.log2_size, self.scan)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context selection
// ─────────────────────────────────────────────────────────────────────────────

/// (context offset, shift) for last position prefix bins
pub(crate) fn last_prefix_ctx(log2_size: u8, is_luma: bool) -> (usize, u8) {
    if is_luma {
        let offset = 3 * (log2_size as usize - 2) + ((log2_size as usize - 1) >> 2);
        (offset, (log2_size + 1) >> 2)
    } else {
        (NUM_LAST_CTX_LUMA, log2_size - 2)
    }
}

/// Coded sub-block flags of the CGs right of and below a CG (bit 0 right)
pub(crate) fn csbf_neighbors(csbf: &[bool], cg_x: usize, cg_y: usize, cgs_w: usize) -> u8 {
    let right = cg_x + 1 < cgs_w && csbf[cg_y * cgs_w + cg_x + 1];
    let below = cg_y + 1 < cgs_w && csbf[(cg_y + 1) * cgs_w + cg_x];
    right as u8 | ((below as u8) << 1)
}

/// coded_sub_block_flag context index
pub(crate) fn csbf_ctx(neighbors: u8, is_luma: bool) -> usize {
    let inc = ((neighbors & 1) | (neighbors >> 1)) as usize;
    if is_luma {
        inc
    } else {
        inc + 2
    }
}

/// sig_coeff_flag context index for the coefficient at (x, y)
pub(crate) fn sig_ctx(params: &ResidualParams, neighbors: u8, x: usize, y: usize) -> usize {
    let log2 = params.log2_size;
    let sig = if log2 == 2 {
        CTX_IDX_MAP_4X4[(y << 2) + x] as usize
    } else if x + y == 0 {
        0
    } else {
        let (xp, yp) = (x & 3, y & 3);
        let mut sig = match neighbors {
            0 => match xp + yp {
                0 => 2,
                1 | 2 => 1,
                _ => 0,
            },
            1 => 2usize.saturating_sub(yp),
            2 => 2usize.saturating_sub(xp),
            _ => 2,
        };
        if params.is_luma {
            if (x >> 2) + (y >> 2) > 0 {
                sig += 3;
            }
            if log2 == 3 {
                sig += if params.scan == ScanPattern::Diagonal { 9 } else { 15 };
            } else {
                sig += 21;
            }
        } else if log2 == 3 {
            sig += 9;
        } else {
            sig += 12;
        }
        sig
    };
    if params.is_luma {
        sig
    } else {
        NUM_SIG_CTX_LUMA + sig
    }
}

/// Greater1 context set for a CG
pub(crate) fn gt1_ctx_set(cg_idx: usize, is_luma: bool, prev_c1: u8) -> usize {
    let mut set = if cg_idx > 0 && is_luma { 2 } else { 0 };
    if prev_c1 == 0 {
        set += 1;
    }
    set
}

/// gt1 context index
pub(crate) fn gt1_ctx(ctx_set: usize, c1: u8, is_luma: bool) -> usize {
    let idx = ctx_set * 4 + c1 as usize;
    if is_luma {
        idx
    } else {
        idx + NUM_GT1_CTX_LUMA
    }
}

/// gt2 context index
pub(crate) fn gt2_ctx(ctx_set: usize, is_luma: bool) -> usize {
    if is_luma {
        ctx_set
    } else {
        ctx_set + NUM_GT2_CTX_LUMA
    }
}

/// c1 state after coding a greater1 flag
#[inline]
pub(crate) fn next_c1(c1: u8, gt1: bool) -> u8 {
    if gt1 {
        0
    } else if c1 > 0 && c1 < 3 {
        c1 + 1
    } else {
        c1
    }
}

/// Rice parameter after coding a level
#[inline]
pub(crate) fn next_rice(rice: u32, abs_level: u32) -> u32 {
    if abs_level > 3 * (1 << rice) {
        (rice + 1).min(4)
    } else {
        rice
    }
}

/// Prefix, suffix and suffix length of a last position coordinate
pub(crate) fn last_pos_binarization(pos: usize) -> (u32, u32, u32) {
    let group = GROUP_IDX[pos] as u32;
    if group > 3 {
        let suffix = pos as u32 - MIN_IN_GROUP[group as usize] as u32;
        (group, suffix, (group >> 1) - 1)
    } else {
        (group, 0, 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remainder binarization
// ─────────────────────────────────────────────────────────────────────────────

/// Number of bypass bins used by a remainder
pub(crate) fn remain_bins(value: u32, rice: u32) -> u32 {
    if value < (COEF_REMAIN_BIN_REDUCTION << rice) {
        (value >> rice) + 1 + rice
    } else {
        let mut length = rice;
        let mut rest = value - (COEF_REMAIN_BIN_REDUCTION << rice);
        while rest >= (1 << length) {
            rest -= 1 << length;
            length += 1;
        }
        COEF_REMAIN_BIN_REDUCTION + length + 1 - rice + length
    }
}

/// Encode coeff_abs_level_remaining
pub fn encode_coeff_remain<E: BinEncoder>(enc: &mut E, value: u32, rice: u32) {
    if value < (COEF_REMAIN_BIN_REDUCTION << rice) {
        let prefix = value >> rice;
        for _ in 0..prefix {
            enc.encode_bin_ep(1);
        }
        enc.encode_bin_ep(0);
        enc.encode_bins_ep(value & ((1 << rice) - 1), rice);
    } else {
        let mut length = rice;
        let mut rest = value - (COEF_REMAIN_BIN_REDUCTION << rice);
        while rest >= (1 << length) {
            rest -= 1 << length;
            length += 1;
        }
        for _ in 0..(COEF_REMAIN_BIN_REDUCTION + length - rice) {
            enc.encode_bin_ep(1);
        }
        enc.encode_bin_ep(0);
        enc.encode_bins_ep(rest, length);
    }
}

/// Decode coeff_abs_level_remaining
pub fn decode_coeff_remain<D: BinDecoder>(dec: &mut D, rice: u32) -> Result<u32> {
    let mut prefix = 0u32;
    while dec.decode_bin_ep()? == 1 {
        prefix += 1;
        if prefix > MAX_REMAIN_PREFIX {
            tracing::warn!(prefix, "Remainder prefix exceeds limit");
            return Err(Error::conformance("coeff_abs_level_remaining prefix too long"));
        }
    }
    if prefix < COEF_REMAIN_BIN_REDUCTION {
        let suffix = dec.decode_bins_ep(rice)?;
        Ok((prefix << rice) + suffix)
    } else {
        let length = prefix - COEF_REMAIN_BIN_REDUCTION + rice;
        if length > 31 {
            tracing::warn!(length, "Remainder suffix exceeds 31 bits");
            return Err(Error::conformance("coeff_abs_level_remaining out of range"));
        }
        let suffix = dec.decode_bins_ep(length)? as u64;
        let value = ((((1u64 << (prefix - COEF_REMAIN_BIN_REDUCTION)) + 2) << rice) + suffix)
            .min(u32::MAX as u64);
        Ok(value as u32)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Scan position of the last nonzero level, if any
pub fn last_significant(order: &ScanOrder, coeffs: &[i32]) -> Option<usize> {
    (0..order.len()).rev().find(|&s| coeffs[order.position(s)] != 0)
}

/// True when the sign of the CG's first level is hidden
#[inline]
pub(crate) fn sign_hidden(params: &ResidualParams, first_nz: usize, last_nz: usize) -> bool {
    params.sign_hiding && last_nz - first_nz >= SBH_THRESHOLD
}

/// Serialize the levels of a block with at least one nonzero level
///
/// `coeffs` is in raster order. When sign hiding applies to a CG, the
/// level parity must already encode the hidden sign.
pub fn encode_residual<E: BinEncoder>(
    enc: &mut E,
    ctx: &mut ContextSet,
    params: &ResidualParams,
    coeffs: &[i32],
) {
    let size = params.size();
    assert!(coeffs.len() >= size * size);
    let order = params.order();
    let last_scan = match last_significant(order, coeffs) {
        Some(pos) => pos,
        None => {
            debug_assert!(false, "encode_residual called for an all-zero block");
            return;
        }
    };

    encode_last_position(enc, ctx, params, order.position(last_scan));

    let is_luma = params.is_luma;
    let cgs_w = size >> 2;
    let last_cg = last_scan >> 4;
    let mut csbf = vec![false; cgs_w * cgs_w];
    let mut prev_c1 = 1u8;

    for cg in (0..=last_cg).rev() {
        let cg_raster = order.cg_position(cg);
        let (cg_x, cg_y) = (cg_raster % cgs_w, cg_raster / cgs_w);
        let base = cg << 4;
        let neighbors = csbf_neighbors(&csbf, cg_x, cg_y, cgs_w);

        if cg < last_cg && cg > 0 {
            let coded = (base..base + 16).any(|s| coeffs[order.position(s)] != 0);
            enc.encode_bin(
                coded as u32,
                &mut ctx.coded_sub_block_flag[csbf_ctx(neighbors, is_luma)],
            );
            csbf[cg_raster] = coded;
            if !coded {
                continue;
            }
        } else {
            csbf[cg_raster] = true;
        }

        // Significance map
        let mut levels: Vec<(usize, i32)> = Vec::with_capacity(16);
        let top = if cg == last_cg {
            levels.push((last_scan, coeffs[order.position(last_scan)]));
            last_scan
        } else {
            base + 16
        };
        for scan_pos in (base..top).rev() {
            let pos = order.position(scan_pos);
            let value = coeffs[pos];
            let infer_dc = scan_pos == base && cg > 0 && cg < last_cg && levels.is_empty();
            if !infer_dc {
                let (x, y) = (pos & (size - 1), pos >> params.log2_size);
                enc.encode_bin(
                    (value != 0) as u32,
                    &mut ctx.sig_coeff_flag[sig_ctx(params, neighbors, x, y)],
                );
            }
            if value != 0 {
                levels.push((scan_pos, value));
            }
        }

        encode_levels(enc, ctx, params, cg, &levels, &mut prev_c1);
    }
}

fn encode_last_position<E: BinEncoder>(
    enc: &mut E,
    ctx: &mut ContextSet,
    params: &ResidualParams,
    raster: usize,
) {
    let size = params.size();
    let (mut x, mut y) = (raster & (size - 1), raster >> params.log2_size);
    if params.scan == ScanPattern::Vertical {
        std::mem::swap(&mut x, &mut y);
    }
    let (offset, shift) = last_prefix_ctx(params.log2_size, params.is_luma);
    let c_max = ((params.log2_size as u32) << 1) - 1;
    let (px, sx, lx) = last_pos_binarization(x);
    let (py, sy, ly) = last_pos_binarization(y);

    for (prefix, models) in [(px, &mut ctx.last_x_prefix), (py, &mut ctx.last_y_prefix)] {
        for bin in 0..prefix {
            enc.encode_bin(1, &mut models[offset + (bin as usize >> shift)]);
        }
        if prefix < c_max {
            enc.encode_bin(0, &mut models[offset + (prefix as usize >> shift)]);
        }
    }
    if lx > 0 {
        enc.encode_bins_ep(sx, lx);
    }
    if ly > 0 {
        enc.encode_bins_ep(sy, ly);
    }
}

/// Greater1/greater2 flags, signs and remainders of one CG
fn encode_levels<E: BinEncoder>(
    enc: &mut E,
    ctx: &mut ContextSet,
    params: &ResidualParams,
    cg: usize,
    levels: &[(usize, i32)],
    prev_c1: &mut u8,
) {
    let is_luma = params.is_luma;
    let ctx_set = gt1_ctx_set(cg, is_luma, *prev_c1);
    let mut c1 = 1u8;
    let mut first_gt1: Option<usize> = None;

    for (idx, &(_, value)) in levels.iter().enumerate().take(GT1_FLAGS_PER_CG) {
        let gt1 = value.abs() > 1;
        enc.encode_bin(gt1 as u32, &mut ctx.gt1_flag[gt1_ctx(ctx_set, c1, is_luma)]);
        c1 = next_c1(c1, gt1);
        if gt1 && first_gt1.is_none() {
            first_gt1 = Some(idx);
        }
    }
    *prev_c1 = c1;

    if let Some(idx) = first_gt1 {
        let gt2 = levels[idx].1.abs() > 2;
        enc.encode_bin(gt2 as u32, &mut ctx.gt2_flag[gt2_ctx(ctx_set, is_luma)]);
    }

    let hidden = match (levels.first(), levels.last()) {
        (Some(&(last_nz, _)), Some(&(first_nz, _))) => sign_hidden(params, first_nz, last_nz),
        _ => false,
    };
    let num_signs = if hidden { levels.len() - 1 } else { levels.len() };
    for &(_, value) in &levels[..num_signs] {
        enc.encode_bin_ep((value < 0) as u32);
    }

    let mut rice = 0u32;
    let mut first_coeff2 = 1u32;
    for (idx, &(_, value)) in levels.iter().enumerate() {
        let abs = value.unsigned_abs();
        let base_level = if idx < GT1_FLAGS_PER_CG { 2 + first_coeff2 } else { 1 };
        if abs >= base_level {
            encode_coeff_remain(enc, abs - base_level, rice);
            rice = next_rice(rice, abs);
        }
        if abs >= 2 {
            first_coeff2 = 0;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Parse the levels of a coded block into `coeffs` (raster order)
pub fn decode_residual<D: BinDecoder>(
    dec: &mut D,
    ctx: &mut ContextSet,
    params: &ResidualParams,
    coeffs: &mut [i32],
) -> Result<()> {
    let size = params.size();
    assert!(coeffs.len() >= size * size);
    coeffs[..size * size].fill(0);
    let order = params.order();
    let is_luma = params.is_luma;

    let last_raster = decode_last_position(dec, ctx, params)?;
    let last_scan = order.scan_index(last_raster);

    let cgs_w = size >> 2;
    let last_cg = last_scan >> 4;
    let mut csbf = vec![false; cgs_w * cgs_w];
    let mut prev_c1 = 1u8;

    for cg in (0..=last_cg).rev() {
        let cg_raster = order.cg_position(cg);
        let (cg_x, cg_y) = (cg_raster % cgs_w, cg_raster / cgs_w);
        let base = cg << 4;
        let neighbors = csbf_neighbors(&csbf, cg_x, cg_y, cgs_w);

        if cg < last_cg && cg > 0 {
            let coded = dec.decode_bin(&mut ctx.coded_sub_block_flag[csbf_ctx(neighbors, is_luma)])?;
            csbf[cg_raster] = coded == 1;
            if coded == 0 {
                continue;
            }
        } else {
            csbf[cg_raster] = true;
        }

        let mut sig_positions: Vec<usize> = Vec::with_capacity(16);
        let top = if cg == last_cg {
            sig_positions.push(last_scan);
            last_scan
        } else {
            base + 16
        };
        for scan_pos in (base..top).rev() {
            let infer_dc = scan_pos == base && cg > 0 && cg < last_cg && sig_positions.is_empty();
            let significant = if infer_dc {
                true
            } else {
                let pos = order.position(scan_pos);
                let (x, y) = (pos & (size - 1), pos >> params.log2_size);
                dec.decode_bin(&mut ctx.sig_coeff_flag[sig_ctx(params, neighbors, x, y)])? == 1
            };
            if significant {
                sig_positions.push(scan_pos);
            }
        }

        let levels = decode_levels(dec, ctx, params, cg, &sig_positions, &mut prev_c1)?;
        for (&scan_pos, &level) in sig_positions.iter().zip(&levels) {
            coeffs[order.position(scan_pos)] = level;
        }
    }
    Ok(())
}

fn decode_last_position<D: BinDecoder>(
    dec: &mut D,
    ctx: &mut ContextSet,
    params: &ResidualParams,
) -> Result<usize> {
    let (offset, shift) = last_prefix_ctx(params.log2_size, params.is_luma);
    let c_max = ((params.log2_size as u32) << 1) - 1;

    let mut prefixes = [0u32; 2];
    for (prefix, models) in prefixes
        .iter_mut()
        .zip([&mut ctx.last_x_prefix, &mut ctx.last_y_prefix])
    {
        while *prefix < c_max
            && dec.decode_bin(&mut models[offset + (*prefix as usize >> shift)])? == 1
        {
            *prefix += 1;
        }
    }

    let mut coords = [0usize; 2];
    for (coord, &prefix) in coords.iter_mut().zip(&prefixes) {
        *coord = if prefix > 3 {
            let len = (prefix >> 1) - 1;
            let suffix = dec.decode_bins_ep(len)?;
            ((1 << len) * (2 + (prefix & 1)) + suffix) as usize
        } else {
            prefix as usize
        };
    }
    let (mut x, mut y) = (coords[0], coords[1]);
    if params.scan == ScanPattern::Vertical {
        std::mem::swap(&mut x, &mut y);
    }
    let size = params.size();
    if x >= size || y >= size {
        tracing::warn!(x, y, size, "Last significant position outside block");
        return Err(Error::conformance("last significant coefficient outside block"));
    }
    Ok(y * size + x)
}

fn decode_levels<D: BinDecoder>(
    dec: &mut D,
    ctx: &mut ContextSet,
    params: &ResidualParams,
    cg: usize,
    sig_positions: &[usize],
    prev_c1: &mut u8,
) -> Result<Vec<i32>> {
    let is_luma = params.is_luma;
    let ctx_set = gt1_ctx_set(cg, is_luma, *prev_c1);
    let mut abs: Vec<u32> = vec![1; sig_positions.len()];
    let mut c1 = 1u8;
    let mut first_gt1: Option<usize> = None;

    for idx in 0..sig_positions.len().min(GT1_FLAGS_PER_CG) {
        let gt1 = dec.decode_bin(&mut ctx.gt1_flag[gt1_ctx(ctx_set, c1, is_luma)])? == 1;
        c1 = next_c1(c1, gt1);
        if gt1 {
            abs[idx] = 2;
            if first_gt1.is_none() {
                first_gt1 = Some(idx);
            }
        }
    }
    *prev_c1 = c1;

    if let Some(idx) = first_gt1 {
        abs[idx] += dec.decode_bin(&mut ctx.gt2_flag[gt2_ctx(ctx_set, is_luma)])?;
    }

    let hidden = match (sig_positions.first(), sig_positions.last()) {
        (Some(&last_nz), Some(&first_nz)) => sign_hidden(params, first_nz, last_nz),
        _ => false,
    };
    let num_signs = if hidden { abs.len() - 1 } else { abs.len() };
    let mut negative = vec![false; abs.len()];
    for flag in negative.iter_mut().take(num_signs) {
        *flag = dec.decode_bin_ep()? == 1;
    }

    let mut rice = 0u32;
    let mut first_coeff2 = 1u32;
    for (idx, level) in abs.iter_mut().enumerate() {
        let base_level = if idx < GT1_FLAGS_PER_CG { 2 + first_coeff2 } else { 1 };
        if *level == base_level {
            let remain = decode_coeff_remain(dec, rice)?;
            *level = level.saturating_add(remain);
            rice = next_rice(rice, *level);
        }
        if *level > MAX_LEVEL as u32 {
            tracing::warn!(level = *level, "Coefficient level outside 16-bit range");
            return Err(Error::conformance("coefficient level out of range"));
        }
        if *level >= 2 {
            first_coeff2 = 0;
        }
    }

    if hidden {
        let sum: u32 = abs.iter().sum();
        if let Some(flag) = negative.last_mut() {
            *flag = sum % 2 == 1;
        }
    }

    Ok(abs
        .iter()
        .zip(&negative)
        .map(|(&a, &neg)| if neg { -(a as i32) } else { a as i32 })
        .collect())
}
