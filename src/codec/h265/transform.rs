//! Forward and inverse integer transforms
//!
//! Kernels are N x N integer matrices with basis vectors in rows and a norm
//! of 64·√N, so every size and kernel family shares the same stage shifts:
//!
//! | Stage            | Shift                     |
//! |------------------|---------------------------|
//! | forward, rows    | log2N + bitDepth − 9      |
//! | forward, columns | log2N + 6                 |
//! | inverse, columns | 7 (clipped to 16 bits)    |
//! | inverse, rows    | 20 − bitDepth             |
//!
//! DCT-II matrices are the exact integer tables of the standard for 4..32,
//! extended with the 64-point odd basis rows. The alternate families
//! (DCT-V, DCT-VIII, DST-I, DST-VII) exist for 4..32 and are generated
//! from their orthonormal definitions. The generated 4-point DST-VII
//! equals the standard's intra 4x4 DST.

use super::config::CodingTools;
use crate::error::{Error, Result};
use std::f64::consts::PI;
use std::sync::OnceLock;

/// Transform block size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransformSize {
    /// 4x4
    Size4 = 4,
    /// 8x8
    Size8 = 8,
    /// 16x16
    Size16 = 16,
    /// 32x32
    Size32 = 32,
    /// 64x64
    Size64 = 64,
}

impl TransformSize {
    /// Transform size from a log2 value
    pub fn from_log2(log2_size: u8) -> Option<Self> {
        match log2_size {
            2 => Some(TransformSize::Size4),
            3 => Some(TransformSize::Size8),
            4 => Some(TransformSize::Size16),
            5 => Some(TransformSize::Size32),
            6 => Some(TransformSize::Size64),
            _ => None,
        }
    }

    /// Size in samples
    pub fn size(&self) -> usize {
        *self as usize
    }

    /// log2 of the size
    pub fn log2(&self) -> u8 {
        self.size().trailing_zeros() as u8
    }

    /// Number of samples in the block
    pub fn area(&self) -> usize {
        self.size() * self.size()
    }
}

/// 1-D kernel family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKernel {
    /// DCT-II (primary)
    DctII,
    /// DCT-V
    DctV,
    /// DCT-VIII
    DctVIII,
    /// DST-I
    DstI,
    /// DST-VII
    DstVII,
}

impl TransformKernel {
    const ALL: [TransformKernel; 5] = [
        TransformKernel::DctII,
        TransformKernel::DctV,
        TransformKernel::DctVIII,
        TransformKernel::DstI,
        TransformKernel::DstVII,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Kernel actually used for a size; alternates fall back to DCT-II at 64
    pub fn effective(self, size: TransformSize) -> TransformKernel {
        if size == TransformSize::Size64 {
            TransformKernel::DctII
        } else {
            self
        }
    }
}

/// Separable kernel choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelPair {
    /// Kernel applied along rows
    pub horizontal: TransformKernel,
    /// Kernel applied along columns
    pub vertical: TransformKernel,
}

impl KernelPair {
    /// Same kernel in both directions
    pub const fn uniform(kernel: TransformKernel) -> Self {
        Self {
            horizontal: kernel,
            vertical: kernel,
        }
    }

    /// DCT-II in both directions
    pub const DCT2: KernelPair = KernelPair::uniform(TransformKernel::DctII);
}

impl Default for KernelPair {
    fn default() -> Self {
        KernelPair::DCT2
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Explicit multiple transform selection
// ─────────────────────────────────────────────────────────────────────────────

const INTRA_TRANSFORM_SETS: [[TransformKernel; 2]; 3] = [
    [TransformKernel::DstVII, TransformKernel::DctVIII],
    [TransformKernel::DstVII, TransformKernel::DstI],
    [TransformKernel::DstVII, TransformKernel::DctV],
];

const INTER_TRANSFORM_SET: [TransformKernel; 2] = [TransformKernel::DctVIII, TransformKernel::DstVII];

/// Vertical transform set per 35-mode intra direction
const TRANSFORM_SET_VERTICAL: [u8; 35] = [
    2, 1, 0, 1, 0, 1, 0, 1, 0, 0, 0, 0, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0,
    1, 0, 1, 0,
];

/// Horizontal transform set per 35-mode intra direction
const TRANSFORM_SET_HORIZONTAL: [u8; 35] = [
    2, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 0, 0, 0, 0, 1, 0, 1, 0,
    1, 0, 1, 0,
];

/// Inputs that determine the transform of one transform block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSelection {
    /// Intra prediction mode of the component, `None` for inter blocks
    pub intra_mode: Option<u8>,
    /// True for the luma component
    pub is_luma: bool,
    /// cu_emt_flag of the CU
    pub emt_flag: bool,
    /// TU index: bit 0 selects the horizontal, bit 1 the vertical candidate
    pub emt_idx: u8,
}

/// Kernel pair for a transform block
///
/// With the multiple-transform flag set, luma blocks use a mode-dependent
/// transform set (intra) or the inter set. Without it, intra 4x4 luma uses
/// DST-VII and everything else DCT-II.
pub fn select_kernels(
    selection: KernelSelection,
    size: TransformSize,
    tools: &CodingTools,
) -> KernelPair {
    let KernelSelection {
        intra_mode,
        is_luma,
        emt_flag,
        emt_idx,
    } = selection;

    if is_luma && emt_flag && size <= TransformSize::Size32 {
        let h_bit = (emt_idx & 1) as usize;
        let v_bit = ((emt_idx >> 1) & 1) as usize;
        return match intra_mode {
            Some(mode) => {
                let mode35 = to_35_mode(mode, tools.extended_intra_modes);
                let h_set = TRANSFORM_SET_HORIZONTAL[mode35 as usize] as usize;
                let v_set = TRANSFORM_SET_VERTICAL[mode35 as usize] as usize;
                KernelPair {
                    horizontal: INTRA_TRANSFORM_SETS[h_set][h_bit],
                    vertical: INTRA_TRANSFORM_SETS[v_set][v_bit],
                }
            }
            None => KernelPair {
                horizontal: INTER_TRANSFORM_SET[h_bit],
                vertical: INTER_TRANSFORM_SET[v_bit],
            },
        };
    }

    if is_luma && intra_mode.is_some() && size == TransformSize::Size4 {
        return KernelPair::uniform(TransformKernel::DstVII);
    }
    KernelPair::DCT2
}

/// Map a 67-mode direction onto the 35-mode grid
fn to_35_mode(mode: u8, extended: bool) -> u8 {
    if !extended || mode < 2 {
        mode.min(34)
    } else {
        ((mode + 2) >> 1).min(34)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel tables
// ─────────────────────────────────────────────────────────────────────────────

/// cos(j·π/64) values of the 32-point table, j = 0..=32
const DCT_EVEN: [i16; 33] = [
    64, 90, 90, 90, 89, 88, 87, 85, 83, 82, 80, 78, 75, 73, 70, 67, 64, 61, 57, 54, 50, 46, 43,
    38, 36, 31, 25, 22, 18, 13, 9, 4, 0,
];

/// cos(j·π/128) values for odd j = 1, 3, .., 63 of the 64-point table
const DCT_ODD_64: [i16; 32] = [
    91, 90, 90, 90, 88, 87, 86, 84, 83, 81, 79, 77, 73, 71, 69, 65, 62, 59, 56, 52, 48, 44, 41,
    37, 33, 28, 24, 20, 15, 11, 7, 2,
];

/// Integer cos(j·π/128)·64√2 with j reduced modulo 256
fn dct_cos_64(j: usize) -> i32 {
    let mut j = j % 256;
    if j > 128 {
        j = 256 - j;
    }
    let (j, sign) = if j > 64 { (128 - j, -1) } else { (j, 1) };
    let magnitude = if j % 2 == 0 {
        DCT_EVEN[j / 2]
    } else {
        DCT_ODD_64[(j - 1) / 2]
    } as i32;
    sign * magnitude
}

fn dct2_matrix(size: usize) -> Vec<i16> {
    let step = 64 / size;
    let mut m = vec![0i16; size * size];
    for k in 0..size {
        for n in 0..size {
            m[k * size + n] = if k == 0 {
                64
            } else {
                dct_cos_64(k * step * (2 * n + 1)) as i16
            };
        }
    }
    m
}

fn generated_matrix(kernel: TransformKernel, size: usize) -> Vec<i16> {
    let nf = size as f64;
    let scale = 64.0 * nf.sqrt();
    let mut m = vec![0i16; size * size];
    for k in 0..size {
        for n in 0..size {
            let (kf, xf) = (k as f64, n as f64);
            let v = match kernel {
                TransformKernel::DctV => {
                    let w0 = if k == 0 { 0.5f64.sqrt() } else { 1.0 };
                    let w1 = if n == 0 { 0.5f64.sqrt() } else { 1.0 };
                    w0 * w1
                        * (2.0 / (2.0 * nf - 1.0).sqrt())
                        * (2.0 * PI * kf * xf / (2.0 * nf - 1.0)).cos()
                }
                TransformKernel::DctVIII => {
                    (4.0 / (2.0 * nf + 1.0)).sqrt()
                        * (PI * (2.0 * kf + 1.0) * (2.0 * xf + 1.0) / (4.0 * nf + 2.0)).cos()
                }
                TransformKernel::DstI => {
                    (2.0 / (nf + 1.0)).sqrt() * (PI * (kf + 1.0) * (xf + 1.0) / (nf + 1.0)).sin()
                }
                TransformKernel::DstVII => {
                    (4.0 / (2.0 * nf + 1.0)).sqrt()
                        * (PI * (2.0 * kf + 1.0) * (xf + 1.0) / (2.0 * nf + 1.0)).sin()
                }
                TransformKernel::DctII => {
                    let c = if k == 0 { 0.5f64.sqrt() } else { 1.0 };
                    c * (2.0 / nf).sqrt() * (PI * kf * (2.0 * xf + 1.0) / (2.0 * nf)).cos()
                }
            };
            m[k * size + n] = (v * scale).round() as i16;
        }
    }
    m
}

/// Immutable kernel matrices for every family and size
#[derive(Debug)]
pub struct KernelTables {
    /// Indexed by [kernel][log2 - 2]; row-major, basis functions in rows
    matrices: Vec<Vec<Vec<i16>>>,
}

impl KernelTables {
    fn build() -> Self {
        let matrices = TransformKernel::ALL
            .iter()
            .map(|&kernel| {
                (2u8..=6)
                    .map(|log2| {
                        let size = 1usize << log2;
                        match kernel.effective(TransformSize::from_log2(log2).unwrap_or(TransformSize::Size64)) {
                            TransformKernel::DctII => dct2_matrix(size),
                            other => generated_matrix(other, size),
                        }
                    })
                    .collect()
            })
            .collect();
        Self { matrices }
    }

    /// Process-wide tables, built on first use
    pub fn get() -> &'static KernelTables {
        static TABLES: OnceLock<KernelTables> = OnceLock::new();
        TABLES.get_or_init(KernelTables::build)
    }

    /// Matrix of `kernel` at `size`
    pub fn matrix(&self, kernel: TransformKernel, size: TransformSize) -> &[i16] {
        &self.matrices[kernel.effective(size).index()][(size.log2() - 2) as usize]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transform engine
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
fn clip16(v: i64) -> i32 {
    v.clamp(i16::MIN as i64, i16::MAX as i64) as i32
}

/// Integer transform processor for one component bit depth
#[derive(Debug, Clone, Copy)]
pub struct TransformEngine {
    bit_depth: u8,
    skip_zero_rows: bool,
    tables: &'static KernelTables,
}

impl TransformEngine {
    /// Create an engine for a bit depth of 8, 10 or 12
    pub fn new(bit_depth: u8) -> Result<Self> {
        if !matches!(bit_depth, 8 | 10 | 12) {
            return Err(Error::invalid_input(format!(
                "Unsupported transform bit depth: {}",
                bit_depth
            )));
        }
        Ok(Self {
            bit_depth,
            skip_zero_rows: false,
            tables: KernelTables::get(),
        })
    }

    /// Enable the zero-row/column skipping inverse path
    pub fn with_skip_zero_rows(mut self, enabled: bool) -> Self {
        self.skip_zero_rows = enabled;
        self
    }

    /// Bit depth of the residual samples
    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// Forward 2-D transform of a strided residual block into `coeffs`
    pub fn forward(
        &self,
        kernels: KernelPair,
        size: TransformSize,
        residual: &[i16],
        stride: usize,
        coeffs: &mut [i32],
    ) {
        let n = size.size();
        assert!(stride >= n && residual.len() >= (n - 1) * stride + n);
        assert!(coeffs.len() >= n * n);

        let log2 = size.log2() as i32;
        let shift1 = log2 + self.bit_depth as i32 - 9;
        let shift2 = log2 + 6;
        let mh = self.tables.matrix(kernels.horizontal, size);
        let mv = self.tables.matrix(kernels.vertical, size);

        // Rows: tmp[row][k] = sum_x mh[k][x] * r[row][x]
        let mut tmp = vec![0i32; n * n];
        let add1 = 1i64 << (shift1 - 1);
        for row in 0..n {
            let src = &residual[row * stride..row * stride + n];
            for k in 0..n {
                let basis = &mh[k * n..k * n + n];
                let sum: i64 = basis
                    .iter()
                    .zip(src)
                    .map(|(&b, &r)| b as i64 * r as i64)
                    .sum();
                tmp[row * n + k] = ((sum + add1) >> shift1) as i32;
            }
        }

        // Columns: c[k][col] = sum_y mv[k][y] * tmp[y][col]
        let add2 = 1i64 << (shift2 - 1);
        for k in 0..n {
            let basis = &mv[k * n..k * n + n];
            for col in 0..n {
                let mut sum = 0i64;
                for (y, &b) in basis.iter().enumerate() {
                    sum += b as i64 * tmp[y * n + col] as i64;
                }
                coeffs[k * n + col] = ((sum + add2) >> shift2) as i32;
            }
        }
    }

    /// Inverse 2-D transform of `coeffs` into a strided residual block
    pub fn inverse(
        &self,
        kernels: KernelPair,
        size: TransformSize,
        coeffs: &[i32],
        residual: &mut [i16],
        stride: usize,
    ) {
        let n = size.size();
        assert!(coeffs.len() >= n * n);
        assert!(stride >= n && residual.len() >= (n - 1) * stride + n);

        // Bounding box of the nonzero coefficients
        let (rows, cols) = if self.skip_zero_rows {
            let mut rows = 0;
            let mut cols = 0;
            for k in 0..n {
                for col in 0..n {
                    if coeffs[k * n + col] != 0 {
                        rows = rows.max(k + 1);
                        cols = cols.max(col + 1);
                    }
                }
            }
            (rows, cols)
        } else {
            (n, n)
        };

        if rows == 0 {
            for y in 0..n {
                residual[y * stride..y * stride + n].fill(0);
            }
            return;
        }

        let shift2 = 20 - self.bit_depth as i32;
        let mh = self.tables.matrix(kernels.horizontal, size);
        let mv = self.tables.matrix(kernels.vertical, size);

        // Columns: tmp[y][col] = sum_k mv[k][y] * c[k][col]
        let mut tmp = vec![0i32; n * n];
        for y in 0..n {
            for col in 0..cols {
                let mut sum = 0i64;
                for k in 0..rows {
                    sum += mv[k * n + y] as i64 * coeffs[k * n + col] as i64;
                }
                tmp[y * n + col] = clip16((sum + 64) >> 7);
            }
        }

        // Rows: r[y][x] = sum_k mh[k][x] * tmp[y][k]
        let add2 = 1i64 << (shift2 - 1);
        for y in 0..n {
            let line = &tmp[y * n..y * n + n];
            let dst = &mut residual[y * stride..y * stride + n];
            for (x, out) in dst.iter_mut().enumerate() {
                let mut sum = 0i64;
                for (k, &t) in line.iter().enumerate().take(cols) {
                    sum += mh[k * n + x] as i64 * t as i64;
                }
                *out = clip16((sum + add2) >> shift2) as i16;
            }
        }
    }

    /// Forward transform skip: residual scaled into the coefficient domain
    pub fn forward_skip(&self, size: TransformSize, residual: &[i16], stride: usize, coeffs: &mut [i32]) {
        let n = size.size();
        let shift = 15 - self.bit_depth as i32 - size.log2() as i32;
        for y in 0..n {
            for x in 0..n {
                let r = residual[y * stride + x] as i32;
                coeffs[y * n + x] = if shift >= 0 {
                    r << shift
                } else {
                    (r + (1 << (-shift - 1))) >> -shift
                };
            }
        }
    }

    /// Inverse transform skip
    pub fn inverse_skip(&self, size: TransformSize, coeffs: &[i32], residual: &mut [i16], stride: usize) {
        let n = size.size();
        let ts_shift = 5 + size.log2() as i32;
        let bd_shift = 20 - self.bit_depth as i32;
        let add = 1i64 << (bd_shift - 1);
        for y in 0..n {
            for x in 0..n {
                let c = (coeffs[y * n + x] as i64) << ts_shift;
                residual[y * stride + x] = clip16((c + add) >> bd_shift) as i16;
            }
        }
    }

    /// Transquant bypass: levels are the residual
    pub fn bypass(&self, size: TransformSize, coeffs: &[i32], residual: &mut [i16], stride: usize) {
        let n = size.size();
        for y in 0..n {
            for x in 0..n {
                residual[y * stride + x] = clip16(coeffs[y * n + x] as i64) as i16;
            }
        }
    }
}

/// Add a residual to a prediction and clip to the sample range
pub fn reconstruct(pred: &[u16], residual: &[i16], dst: &mut [u16], bit_depth: u8) {
    let max_val = (1i32 << bit_depth) - 1;
    for ((out, &p), &r) in dst.iter_mut().zip(pred).zip(residual) {
        *out = (p as i32 + r as i32).clamp(0, max_val) as u16;
    }
}
