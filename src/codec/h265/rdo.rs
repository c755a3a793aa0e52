//! Distortion metrics and rate-distortion cost
//!
//! The encoder minimizes **Cost = Distortion + λ × Rate**.
//!
//! - **Distortion**: SAD, SSE or Hadamard SATD between an original and a
//!   candidate block, scaled down for bit depths above 8 so costs stay
//!   comparable across bit depths
//! - **Rate**: bits, usually estimated with a [`BinCounter`](super::cabac::BinCounter)
//! - **λ**: Lagrange multiplier derived from QP
//!
//! λ is also kept in 16-bit fixed point for the SAD and SSE cost paths so
//! per-call costs need no floating-point multiply of the distortion.

use crate::error::{Error, Result};

/// Distortion function selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistFunc {
    /// Sum of absolute differences
    Sad,
    /// Sum of squared errors
    Sse,
    /// Sum of absolute Hadamard-transformed differences
    Satd,
}

/// One distortion query over two strided sample buffers
#[derive(Debug, Clone, Copy)]
pub struct DistParam<'a> {
    /// Original samples
    pub org: &'a [u16],
    /// Stride of `org`
    pub org_stride: usize,
    /// Candidate (prediction or reconstruction) samples
    pub cur: &'a [u16],
    /// Stride of `cur`
    pub cur_stride: usize,
    /// Block width
    pub width: usize,
    /// Block height
    pub height: usize,
    /// Sample bit depth
    pub bit_depth: u8,
    /// Distortion function
    pub func: DistFunc,
    /// SAD over every other row, doubled
    pub sub_sample: bool,
    /// Component weight applied to the result
    pub weight: f64,
}

impl<'a> DistParam<'a> {
    /// Query with unit weight and full sampling
    pub fn new(
        org: &'a [u16],
        org_stride: usize,
        cur: &'a [u16],
        cur_stride: usize,
        width: usize,
        height: usize,
        bit_depth: u8,
        func: DistFunc,
    ) -> Self {
        Self {
            org,
            org_stride,
            cur,
            cur_stride,
            width,
            height,
            bit_depth,
            func,
            sub_sample: false,
            weight: 1.0,
        }
    }

    /// Evaluate the distortion
    pub fn distortion(&self) -> u64 {
        DistortionCalc::distortion(self)
    }
}

/// Distortion kernels
pub struct DistortionCalc;

impl DistortionCalc {
    /// Distortion of a [`DistParam`] query
    pub fn distortion(param: &DistParam) -> u64 {
        assert!(param.bit_depth >= 8);
        assert!(param.org_stride >= param.width && param.cur_stride >= param.width);
        assert!(param.height > 0 && param.width > 0);
        assert!(param.org.len() >= (param.height - 1) * param.org_stride + param.width);
        assert!(param.cur.len() >= (param.height - 1) * param.cur_stride + param.width);

        let raw = match param.func {
            DistFunc::Sad => Self::sad(param),
            DistFunc::Sse => Self::sse(param),
            DistFunc::Satd => Self::satd(param),
        };
        if param.weight == 1.0 {
            raw
        } else {
            (raw as f64 * param.weight).floor() as u64
        }
    }

    fn sad(param: &DistParam) -> u64 {
        let row_step = if param.sub_sample && param.height > 1 { 2 } else { 1 };
        let sum = match param.width {
            4 => Self::sad_fixed::<4>(param, row_step),
            8 => Self::sad_fixed::<8>(param, row_step),
            16 => Self::sad_fixed::<16>(param, row_step),
            32 => Self::sad_fixed::<32>(param, row_step),
            64 => Self::sad_fixed::<64>(param, row_step),
            _ => Self::sad_generic(param, row_step),
        };
        let sum = if row_step == 2 { sum << 1 } else { sum };
        sum >> (param.bit_depth - 8)
    }

    fn sad_fixed<const W: usize>(param: &DistParam, row_step: usize) -> u64 {
        let mut sum = 0u64;
        for y in (0..param.height).step_by(row_step) {
            let org: &[u16; W] = match param.org[y * param.org_stride..][..W].try_into() {
                Ok(row) => row,
                Err(_) => continue,
            };
            let cur: &[u16; W] = match param.cur[y * param.cur_stride..][..W].try_into() {
                Ok(row) => row,
                Err(_) => continue,
            };
            for x in 0..W {
                sum += (org[x] as i32 - cur[x] as i32).unsigned_abs() as u64;
            }
        }
        sum
    }

    fn sad_generic(param: &DistParam, row_step: usize) -> u64 {
        let mut sum = 0u64;
        for y in (0..param.height).step_by(row_step) {
            let org = &param.org[y * param.org_stride..y * param.org_stride + param.width];
            let cur = &param.cur[y * param.cur_stride..y * param.cur_stride + param.width];
            sum += org
                .iter()
                .zip(cur)
                .map(|(&o, &c)| (o as i32 - c as i32).unsigned_abs() as u64)
                .sum::<u64>();
        }
        sum
    }

    fn sse(param: &DistParam) -> u64 {
        let shift = 2 * (param.bit_depth as u32 - 8);
        let mut sum = 0u64;
        for y in 0..param.height {
            let org = &param.org[y * param.org_stride..y * param.org_stride + param.width];
            let cur = &param.cur[y * param.cur_stride..y * param.cur_stride + param.width];
            for (&o, &c) in org.iter().zip(cur) {
                let diff = (o as i64 - c as i64).unsigned_abs();
                sum += (diff * diff) >> shift;
            }
        }
        sum
    }

    fn satd(param: &DistParam) -> u64 {
        let (w, h) = (param.width, param.height);
        assert!(w % 4 == 0 && h % 4 == 0, "SATD needs 4-aligned blocks, got {}x{}", w, h);

        let mut sum = 0u64;
        if w % 8 == 0 && h % 8 == 0 {
            for y in (0..h).step_by(8) {
                for x in (0..w).step_by(8) {
                    let mut diff = [0i32; 64];
                    Self::load_diff::<8>(param, x, y, &mut diff);
                    sum += Self::satd_8x8(&mut diff);
                }
            }
        } else {
            for y in (0..h).step_by(4) {
                for x in (0..w).step_by(4) {
                    let mut diff = [0i32; 16];
                    Self::load_diff::<4>(param, x, y, &mut diff);
                    sum += Self::satd_4x4(&mut diff);
                }
            }
        }
        sum >> (param.bit_depth - 8)
    }

    fn load_diff<const N: usize>(param: &DistParam, x0: usize, y0: usize, diff: &mut [i32]) {
        for y in 0..N {
            let org = (y0 + y) * param.org_stride + x0;
            let cur = (y0 + y) * param.cur_stride + x0;
            for x in 0..N {
                diff[y * N + x] = param.org[org + x] as i32 - param.cur[cur + x] as i32;
            }
        }
    }

    /// SATD of a 4x4 difference block
    pub fn satd_4x4(diff: &mut [i32; 16]) -> u64 {
        Self::hadamard_4x4(diff);
        let sum: u64 = diff.iter().map(|&d| d.unsigned_abs() as u64).sum();
        (sum + 1) >> 1
    }

    /// SATD of an 8x8 difference block
    pub fn satd_8x8(diff: &mut [i32; 64]) -> u64 {
        Self::hadamard_8x8(diff);
        let sum: u64 = diff.iter().map(|&d| d.unsigned_abs() as u64).sum();
        (sum + 2) >> 2
    }

    /// 4×4 Hadamard transform (in-place)
    fn hadamard_4x4(block: &mut [i32; 16]) {
        // Horizontal
        for y in 0..4 {
            let i = y * 4;
            let a0 = block[i] + block[i + 2];
            let a1 = block[i + 1] + block[i + 3];
            let a2 = block[i] - block[i + 2];
            let a3 = block[i + 1] - block[i + 3];

            block[i] = a0 + a1;
            block[i + 1] = a2 + a3;
            block[i + 2] = a0 - a1;
            block[i + 3] = a2 - a3;
        }

        // Vertical
        for x in 0..4 {
            let a0 = block[x] + block[x + 8];
            let a1 = block[x + 4] + block[x + 12];
            let a2 = block[x] - block[x + 8];
            let a3 = block[x + 4] - block[x + 12];

            block[x] = a0 + a1;
            block[x + 4] = a2 + a3;
            block[x + 8] = a0 - a1;
            block[x + 12] = a2 - a3;
        }
    }

    /// 8×8 Hadamard transform (in-place), three butterfly stages per pass
    fn hadamard_8x8(block: &mut [i32; 64]) {
        fn butterfly8(v: &mut [i32; 8]) {
            for half in [4usize, 2, 1] {
                let mut out = [0i32; 8];
                for base in (0..8).step_by(2 * half) {
                    for i in base..base + half {
                        out[i] = v[i] + v[i + half];
                        out[i + half] = v[i] - v[i + half];
                    }
                }
                *v = out;
            }
        }

        for y in 0..8 {
            let mut row = [0i32; 8];
            row.copy_from_slice(&block[y * 8..y * 8 + 8]);
            butterfly8(&mut row);
            block[y * 8..y * 8 + 8].copy_from_slice(&row);
        }
        for x in 0..8 {
            let mut col = [0i32; 8];
            for y in 0..8 {
                col[y] = block[y * 8 + x];
            }
            butterfly8(&mut col);
            for y in 0..8 {
                block[y * 8 + x] = col[y];
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate-distortion cost
// ─────────────────────────────────────────────────────────────────────────────

/// How bits are weighed against distortion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostFunction {
    /// `D + bits · λ` in floating point
    Flag,
    /// `D + (bits · λ_SAD + 2^15) >> 16` for SAD/SATD distortion
    Sad,
    /// `D + (bits · λ_SSE + 2^15) >> 16` for SSE distortion
    Sse,
}

/// Rate-distortion cost of one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RdCost {
    /// Distortion value
    pub distortion: u64,
    /// Rate in bits
    pub bits: u64,
    /// Total RD cost
    pub cost: f64,
}

impl RdCost {
    /// Create maximum cost (for initialization)
    pub fn max() -> Self {
        Self {
            distortion: u64::MAX,
            bits: u64::MAX,
            cost: f64::MAX,
        }
    }

    /// Check if this cost is better (lower) than another
    pub fn is_better_than(&self, other: &RdCost) -> bool {
        self.cost < other.cost
    }
}

/// Lagrangian multiplier state of a coding session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RdCostState {
    lambda: f64,
    lambda_sad: u64,
    lambda_sse: u64,
    sequence_lossless: bool,
}

impl RdCostState {
    /// State for a λ value
    pub fn new(lambda: f64, sequence_lossless: bool) -> Result<Self> {
        let mut state = Self {
            lambda: 0.0,
            lambda_sad: 0,
            lambda_sse: 0,
            sequence_lossless,
        };
        state.set_lambda(lambda)?;
        Ok(state)
    }

    /// Replace λ and its fixed-point forms
    pub fn set_lambda(&mut self, lambda: f64) -> Result<()> {
        if lambda.is_nan() || lambda < 0.0 || lambda.is_infinite() {
            return Err(Error::invalid_input(format!("Invalid lambda: {}", lambda)));
        }
        self.lambda = lambda;
        self.lambda_sad = (65536.0 * lambda.sqrt()).floor() as u64;
        self.lambda_sse = (65536.0 * lambda).floor() as u64;
        Ok(())
    }

    /// Current λ
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// floor(2^16 · √λ)
    pub fn lambda_sad_fixed(&self) -> u64 {
        self.lambda_sad
    }

    /// floor(2^16 · λ)
    pub fn lambda_sse_fixed(&self) -> u64 {
        self.lambda_sse
    }

    /// Cost of `bits` at `distortion`; bits alone under sequence-level lossless
    pub fn calc_rd_cost(&self, bits: u64, distortion: u64, func: CostFunction) -> f64 {
        if self.sequence_lossless {
            return bits as f64;
        }
        match func {
            CostFunction::Flag => distortion as f64 + bits as f64 * self.lambda,
            CostFunction::Sad => (distortion + ((bits * self.lambda_sad + 32768) >> 16)) as f64,
            CostFunction::Sse => (distortion + ((bits * self.lambda_sse + 32768) >> 16)) as f64,
        }
    }

    /// [`RdCost`] record for a candidate
    pub fn rd_cost(&self, bits: u64, distortion: u64, func: CostFunction) -> RdCost {
        RdCost {
            distortion,
            bits,
            cost: self.calc_rd_cost(bits, distortion, func),
        }
    }
}

/// λ for a QP
///
/// λ = α · 2^((QP − 12) / 3) with α = 0.57 for intra and 0.68 for inter.
pub fn lambda_from_qp(qp: i32, intra: bool) -> f64 {
    let alpha = if intra { 0.57 } else { 0.68 };
    alpha * 2.0_f64.powf((qp.clamp(0, 51) - 12) as f64 / 3.0)
}

/// Index of the cheapest candidate; the earliest one wins ties
pub fn select_best<I>(costs: I) -> Option<usize>
where
    I: IntoIterator<Item = f64>,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, cost) in costs.into_iter().enumerate() {
        match best {
            Some((_, best_cost)) if cost >= best_cost => {}
            _ => best = Some((idx, cost)),
        }
    }
    best.map(|(idx, _)| idx)
}
