//! Transform and Quantization Decision for the encoder
//!
//! For each residual block the encoder can choose among:
//! - **Transform**: the default kernel pair → quantize
//! - **Transform Skip**: quantize the scaled residual directly (4×4)
//! - **EMT candidates**: the four kernel pairs of the CU's transform set,
//!   when the CU uses explicit multiple transforms (luma only)
//!
//! # Process
//!
//! 1. Compute residual (orig - prediction)
//! 2. Forward transform and quantize (RDOQ when enabled) per candidate
//! 3. Estimate the rate with a [`BinCounter`] on a copy of the live contexts
//! 4. Inverse quantize + inverse transform, reconstruct and measure SSE
//! 5. Select the candidate with the lowest RD cost

use super::cabac::BinCounter;
use super::config::CodecConfig;
use super::contexts::ContextSet;
use super::ctu::CodingUnit;
use super::entropy::emt_cu_flag_present;
use super::quant::RdoqInput;
use super::rdo::{lambda_from_qp, select_best, CostFunction, DistFunc, DistParam, RdCost, RdCostState};
use super::recon::Reconstructor;
use super::sbac::{Sbac, SymbolEncoder};
use super::transform::reconstruct;
use super::tu::{count_nonzero, residual_params, transform_skip_allowed, EMT_SIG_THRESHOLD};
use crate::error::{Error, Result};

/// Position of a block in the residual tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSite {
    /// 0 luma, 1 Cb, 2 Cr
    pub c_idx: usize,
    pub log2_size: u8,
    /// Transform depth, selects the CBF context
    pub depth: u8,
    /// Intra direction of the component, `None` for inter blocks
    pub intra_mode: Option<u8>,
}

/// Transform options of one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformChoice {
    pub transform_skip: bool,
    pub emt_idx: u8,
}

/// Transform decision result
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub choice: TransformChoice,
    /// Quantized levels (raster order)
    pub levels: Vec<i32>,
    /// Coded block flag
    pub cbf: bool,
    /// Reconstructed samples
    pub recon: Vec<u16>,
    /// RD cost
    pub cost: RdCost,
    /// Number of non-zero levels
    pub num_nonzero: usize,
}

/// Transform decision engine
pub struct TransformDecision<'a> {
    recon: &'a Reconstructor,
    rd: RdCostState,
}

impl<'a> TransformDecision<'a> {
    pub fn new(recon: &'a Reconstructor, rd: RdCostState) -> Self {
        Self { recon, rd }
    }

    /// Engine with λ derived from a QP
    pub fn for_qp(recon: &'a Reconstructor, qp: i32, intra: bool) -> Result<Self> {
        let lossless = recon.config().tools.sequence_lossless;
        let rd = RdCostState::new(lambda_from_qp(qp, intra), lossless)?;
        Ok(Self { recon, rd })
    }

    pub fn rd_state(&self) -> &RdCostState {
        &self.rd
    }

    fn config(&self) -> &CodecConfig {
        self.recon.config()
    }

    fn emt_active(&self, cu: &CodingUnit, site: &BlockSite) -> bool {
        site.c_idx == 0 && cu.emt_flag && emt_cu_flag_present(self.config(), cu)
    }

    /// Options worth testing for a block
    pub fn candidates(&self, cu: &CodingUnit, site: &BlockSite) -> Vec<TransformChoice> {
        if self.emt_active(cu, site) {
            return (0..4)
                .map(|emt_idx| TransformChoice {
                    transform_skip: false,
                    emt_idx,
                })
                .collect();
        }
        let mut out = vec![TransformChoice::default()];
        if transform_skip_allowed(self.config(), cu, site.log2_size) {
            out.push(TransformChoice {
                transform_skip: true,
                emt_idx: 0,
            });
        }
        out
    }

    /// Code one candidate; `None` when the result could not be signaled
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        cu: &CodingUnit,
        site: &BlockSite,
        choice: TransformChoice,
        org: &[u16],
        pred: &[u16],
        stride: usize,
        contexts: &ContextSet,
    ) -> Result<Option<TransformResult>> {
        let n = 1usize << site.log2_size;
        if stride < n || org.len() < (n - 1) * stride + n || pred.len() < (n - 1) * stride + n {
            return Err(Error::invalid_input(format!(
                "{}x{} block does not fit stride {}",
                n, n, stride
            )));
        }
        let is_luma = site.c_idx == 0;
        let intra = cu.is_intra();
        let emt = self.emt_active(cu, site);

        let mut org_block = Vec::with_capacity(n * n);
        let mut pred_block = Vec::with_capacity(n * n);
        for y in 0..n {
            org_block.extend_from_slice(&org[y * stride..y * stride + n]);
            pred_block.extend_from_slice(&pred[y * stride..y * stride + n]);
        }
        let residual: Vec<i16> = org_block
            .iter()
            .zip(&pred_block)
            .map(|(&o, &p)| (o as i32 - p as i32) as i16)
            .collect();

        let coding = self.recon.block_coding(
            cu,
            site.c_idx,
            site.log2_size,
            site.intra_mode,
            choice.transform_skip,
            choice.emt_idx,
        )?;
        let cbf_model = if is_luma {
            contexts.cbf_luma[if site.depth == 0 { 1 } else { 0 }]
        } else {
            contexts.cbf_chroma[(site.depth as usize).min(4)]
        };
        let rdoq = RdoqInput {
            lambda: self.rd.lambda(),
            contexts,
            cbf_model: Some(cbf_model),
        };
        let mut levels = vec![0i32; n * n];
        let cbf = self
            .recon
            .forward(site.c_idx, &coding, &residual, n, &mut levels, Some(&rdoq))?;
        let num_nonzero = count_nonzero(&levels);

        let idx_coded = emt && (!intra || num_nonzero > EMT_SIG_THRESHOLD);
        if (choice.emt_idx != 0 && !(cbf && idx_coded)) || (choice.transform_skip && !cbf) {
            return Ok(None);
        }

        let mut est = Sbac::with_contexts(BinCounter::new(), contexts.clone());
        est.encode_cbf(cbf, is_luma, site.depth);
        if cbf {
            if transform_skip_allowed(self.config(), cu, site.log2_size) && !emt {
                est.encode_transform_skip_flag(choice.transform_skip, is_luma);
            }
            let params = residual_params(self.config(), cu, site.log2_size, is_luma, site.intra_mode);
            est.encode_residual(&params, &levels);
            if idx_coded {
                est.encode_emt_tu_idx(choice.emt_idx, intra);
            }
        }
        let bits = est.bins().bits();

        let mut recon_residual = vec![0i16; n * n];
        if cbf {
            self.recon
                .inverse(site.c_idx, &coding, &levels, &mut recon_residual, n)?;
        }
        let bit_depth = self.config().bit_depth(site.c_idx);
        let mut recon = vec![0u16; n * n];
        reconstruct(&pred_block, &recon_residual, &mut recon, bit_depth);

        let mut dist = DistParam::new(&org_block, n, &recon, n, n, n, bit_depth, DistFunc::Sse);
        if !is_luma {
            dist.weight = self.config().chroma_distortion_weight;
        }
        let cost = self.rd.rd_cost(bits, dist.distortion(), CostFunction::Sse);

        Ok(Some(TransformResult {
            choice,
            levels,
            cbf,
            recon,
            cost,
            num_nonzero,
        }))
    }

    /// Test every candidate and keep the cheapest
    pub fn decide(
        &self,
        cu: &CodingUnit,
        site: &BlockSite,
        org: &[u16],
        pred: &[u16],
        stride: usize,
        contexts: &ContextSet,
    ) -> Result<TransformResult> {
        let mut results = Vec::new();
        for choice in self.candidates(cu, site) {
            if let Some(result) = self.evaluate(cu, site, choice, org, pred, stride, contexts)? {
                results.push(result);
            }
        }
        let best = select_best(results.iter().map(|r| r.cost.cost))
            .ok_or_else(|| Error::codec("no transform candidate could be coded"))?;
        let result = results.swap_remove(best);
        tracing::trace!(
            c_idx = site.c_idx,
            size = 1u32 << site.log2_size,
            transform_skip = result.choice.transform_skip,
            emt_idx = result.choice.emt_idx,
            bits = result.cost.bits,
            distortion = result.cost.distortion,
            "transform decision"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::config::SliceType;
    use crate::codec::h265::ctu::PartMode;

    fn site(log2_size: u8) -> BlockSite {
        BlockSite {
            c_idx: 0,
            log2_size,
            depth: 0,
            intra_mode: Some(1),
        }
    }

    #[test]
    fn test_candidates() {
        let config = CodecConfig::hevc_main();
        let recon = Reconstructor::new(&config).unwrap();
        let td = TransformDecision::for_qp(&recon, 32, true).unwrap();
        let cu = CodingUnit::new(0, 0, 3, 0);
        assert_eq!(td.candidates(&cu, &site(2)).len(), 2);
        assert_eq!(td.candidates(&cu, &site(3)).len(), 1);

        let config = CodecConfig::extended();
        let recon = Reconstructor::new(&config).unwrap();
        let td = TransformDecision::for_qp(&recon, 32, true).unwrap();
        let mut cu = CodingUnit::new(0, 0, 3, 0);
        cu.emt_flag = true;
        let choices = td.candidates(&cu, &site(3));
        assert_eq!(choices.len(), 4);
        assert!(choices.iter().all(|c| !c.transform_skip));
    }

    #[test]
    fn test_perfect_prediction_costs_one_flag() {
        let config = CodecConfig::hevc_main();
        let recon = Reconstructor::new(&config).unwrap();
        let td = TransformDecision::for_qp(&recon, 32, true).unwrap();
        let cu = CodingUnit::new(0, 0, 3, 0);
        let contexts = ContextSet::new(SliceType::I, 32);
        let org = vec![128u16; 64];

        let result = td.decide(&cu, &site(3), &org, &org, 8, &contexts).unwrap();
        assert!(!result.cbf);
        assert_eq!(result.cost.distortion, 0);
        assert!(result.cost.bits <= 2);
        assert_eq!(result.recon, org);
    }

    #[test]
    fn test_decision_reduces_distortion() {
        let config = CodecConfig::hevc_main();
        let recon = Reconstructor::new(&config).unwrap();
        let td = TransformDecision::for_qp(&recon, 22, false).unwrap();
        let cu = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2Nx2N);
        let contexts = ContextSet::new(SliceType::P, 22);
        let pred = vec![100u16; 256];
        let org: Vec<u16> = (0..256).map(|i| 100 + ((i % 16) * 2) as u16).collect();
        let site = BlockSite {
            c_idx: 0,
            log2_size: 4,
            depth: 0,
            intra_mode: None,
        };

        let zero_sse: u64 = org.iter().map(|&o| ((o - 100) as u64).pow(2)).sum();
        let result = td.decide(&cu, &site, &org, &pred, 16, &contexts).unwrap();
        assert!(result.cbf);
        assert!(result.cost.distortion < zero_sse);
        assert_eq!(result.num_nonzero, count_nonzero(&result.levels));
    }

    #[test]
    fn test_stride_is_checked() {
        let config = CodecConfig::hevc_main();
        let recon = Reconstructor::new(&config).unwrap();
        let td = TransformDecision::for_qp(&recon, 32, true).unwrap();
        let cu = CodingUnit::new(0, 0, 3, 0);
        let contexts = ContextSet::new(SliceType::I, 32);
        let buf = vec![0u16; 16];
        assert!(td
            .evaluate(&cu, &site(3), TransformChoice::default(), &buf, &buf, 8, &contexts)
            .is_err());
    }
}
