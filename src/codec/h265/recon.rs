//! Residual reconstruction
//!
//! Turns the levels of a transform tree back into residual samples:
//! dequantization followed by the inverse transform, transform skip or
//! transquant bypass. The [`Reconstructor`] also owns the forward path used
//! by the encoder so both directions share one set of engines.

use super::config::{ChromaFormat, CodecConfig};
use super::ctu::CodingUnit;
use super::quant::{QpParam, QuantBlock, Quantizer, RdoqInput};
use super::tu::{chroma_intra_mode, luma_intra_mode, residual_params, TransformTree, TuId};
use super::transform::{select_kernels, KernelPair, KernelSelection, TransformEngine, TransformSize};
use crate::error::{Error, Result};

/// Residual of one square block in component sample coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualBlock {
    /// 0 luma, 1 Cb, 2 Cr
    pub c_idx: usize,
    pub x: usize,
    pub y: usize,
    /// Width and height
    pub size: usize,
    pub samples: Vec<i16>,
}

/// How the levels of a block map back to residual samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCoding {
    pub quant: QuantBlock,
    pub kernels: KernelPair,
    pub transform_skip: bool,
}

/// Transform and quantization engines for luma and chroma
#[derive(Debug, Clone)]
pub struct Reconstructor {
    config: CodecConfig,
    engines: [TransformEngine; 2],
    quantizers: [Quantizer; 2],
}

impl Reconstructor {
    pub fn new(config: &CodecConfig) -> Result<Self> {
        config.validate()?;
        let engine = |bd| -> Result<TransformEngine> {
            Ok(TransformEngine::new(bd)?.with_skip_zero_rows(config.tools.skip_zero_rows))
        };
        Ok(Self {
            config: config.clone(),
            engines: [engine(config.bit_depth_luma)?, engine(config.bit_depth_chroma)?],
            quantizers: [
                Quantizer::new(config.bit_depth_luma, &config.tools)?,
                Quantizer::new(config.bit_depth_chroma, &config.tools)?,
            ],
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn engine(&self, c_idx: usize) -> &TransformEngine {
        &self.engines[(c_idx > 0) as usize]
    }

    pub fn quantizer(&self, c_idx: usize) -> &Quantizer {
        &self.quantizers[(c_idx > 0) as usize]
    }

    /// Coding parameters of a block of `cu`
    ///
    /// `intra_mode` is the direction of the block's component as returned by
    /// [`luma_intra_mode`] or [`chroma_intra_mode`].
    pub fn block_coding(
        &self,
        cu: &CodingUnit,
        c_idx: usize,
        log2_size: u8,
        intra_mode: Option<u8>,
        transform_skip: bool,
        emt_idx: u8,
    ) -> Result<BlockCoding> {
        let size = transform_size(log2_size)?;
        let is_luma = c_idx == 0;
        let params = residual_params(&self.config, cu, log2_size, is_luma, intra_mode);
        let quant = QuantBlock {
            qp: QpParam::for_component(&self.config, cu.qp, c_idx)?,
            log2_size,
            is_luma,
            intra: cu.is_intra(),
            scan: params.scan,
            bypass: cu.transquant_bypass,
        };
        let kernels = select_kernels(
            KernelSelection {
                intra_mode,
                is_luma,
                emt_flag: cu.emt_flag,
                emt_idx,
            },
            size,
            &self.config.tools,
        );
        Ok(BlockCoding {
            quant,
            kernels,
            transform_skip,
        })
    }

    /// Residual to levels; returns the CBF
    pub fn forward(
        &self,
        c_idx: usize,
        coding: &BlockCoding,
        residual: &[i16],
        stride: usize,
        levels: &mut [i32],
        rdoq: Option<&RdoqInput>,
    ) -> Result<bool> {
        let size = transform_size(coding.quant.log2_size)?;
        let n = size.size();
        let engine = self.engine(c_idx);
        let mut coeffs = vec![0i32; n * n];
        if coding.quant.bypass {
            for y in 0..n {
                for x in 0..n {
                    coeffs[y * n + x] = residual[y * stride + x] as i32;
                }
            }
        } else if coding.transform_skip {
            engine.forward_skip(size, residual, stride, &mut coeffs);
        } else {
            engine.forward(coding.kernels, size, residual, stride, &mut coeffs);
        }
        Ok(self
            .quantizer(c_idx)
            .quantize(&coding.quant, &coeffs, levels, rdoq))
    }

    /// Levels to residual
    pub fn inverse(
        &self,
        c_idx: usize,
        coding: &BlockCoding,
        levels: &[i32],
        residual: &mut [i16],
        stride: usize,
    ) -> Result<()> {
        let size = transform_size(coding.quant.log2_size)?;
        let engine = self.engine(c_idx);
        if coding.quant.bypass {
            engine.bypass(size, levels, residual, stride);
            return Ok(());
        }
        let mut coeffs = vec![0i32; size.area()];
        self.quantizer(c_idx)
            .dequantize(&coding.quant, levels, &mut coeffs);
        if coding.transform_skip {
            engine.inverse_skip(size, &coeffs, residual, stride);
        } else {
            engine.inverse(coding.kernels, size, &coeffs, residual, stride);
        }
        Ok(())
    }

    /// Residual blocks of every coded block in `tree`, in coding order
    ///
    /// Blocks without a CBF have an all-zero residual and are not returned.
    pub fn reconstruct_tree(&self, cu: &CodingUnit, tree: &TransformTree) -> Result<Vec<ResidualBlock>> {
        let mut out = Vec::new();
        for id in tree.leaves() {
            let node = tree.node(id);
            if node.cbf[0][0] {
                let coding = self.block_coding(
                    cu,
                    0,
                    node.log2_size,
                    luma_intra_mode(cu, node.x, node.y),
                    node.transform_skip[0][0],
                    node.emt_idx,
                )?;
                let size = node.size();
                let mut samples = vec![0i16; size * size];
                self.inverse(0, &coding, &node.coeffs[0], &mut samples, size)?;
                out.push(ResidualBlock {
                    c_idx: 0,
                    x: node.x,
                    y: node.y,
                    size,
                    samples,
                });
            }
            if tree.codes_chroma_in(id) {
                if let Some(owner) = tree.chroma_owner(id) {
                    self.reconstruct_chroma(cu, tree, owner, &mut out)?;
                }
            }
        }
        tracing::trace!(blocks = out.len(), x = cu.x, y = cu.y, "residual reconstructed");
        Ok(out)
    }

    fn reconstruct_chroma(
        &self,
        cu: &CodingUnit,
        tree: &TransformTree,
        owner: TuId,
        out: &mut Vec<ResidualBlock>,
    ) -> Result<()> {
        let node = tree.node(owner);
        let format = self.config.chroma_format;
        let log2 = tree.chroma_log2(owner);
        let side = 1usize << log2;
        let area = side * side;
        let (x, y) = chroma_position(format, node.x, node.y);
        let mode = chroma_intra_mode(&self.config, cu);

        for c_idx in 1..3 {
            for sub in 0..tree.chroma_sub_blocks() {
                if !node.cbf[c_idx][sub] {
                    continue;
                }
                let levels = node.coeffs[c_idx]
                    .get(sub * area..(sub + 1) * area)
                    .ok_or_else(|| Error::invalid_input("chroma levels missing for a coded block"))?;
                let coding = self.block_coding(cu, c_idx, log2, mode, node.transform_skip[c_idx][sub], 0)?;
                let mut samples = vec![0i16; area];
                self.inverse(c_idx, &coding, levels, &mut samples, side)?;
                out.push(ResidualBlock {
                    c_idx,
                    x,
                    y: y + sub * side,
                    size: side,
                    samples,
                });
            }
        }
        Ok(())
    }
}

fn transform_size(log2_size: u8) -> Result<TransformSize> {
    TransformSize::from_log2(log2_size)
        .ok_or_else(|| Error::invalid_input(format!("no transform of log2 size {}", log2_size)))
}

/// Chroma block position of a luma position
pub fn chroma_position(format: ChromaFormat, x: usize, y: usize) -> (usize, usize) {
    (x >> format.shift_x(), y >> format.shift_y())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::ctu::PartMode;

    #[test]
    fn test_bypass_is_lossless() {
        let mut config = CodecConfig::hevc_main();
        config.tools.transquant_bypass = true;
        let recon = Reconstructor::new(&config).unwrap();
        let mut cu = CodingUnit::new_inter(0, 0, 3, 0, PartMode::Part2Nx2N);
        cu.transquant_bypass = true;

        let residual: Vec<i16> = (0..16).map(|i| (i * 7 % 23) as i16 - 11).collect();
        let coding = recon.block_coding(&cu, 0, 2, None, false, 0).unwrap();
        let mut levels = vec![0; 16];
        assert!(recon.forward(0, &coding, &residual, 4, &mut levels, None).unwrap());
        let mut out = vec![0i16; 16];
        recon.inverse(0, &coding, &levels, &mut out, 4).unwrap();
        assert_eq!(out, residual);
    }

    #[test]
    fn test_transform_roundtrip_is_close() {
        let config = CodecConfig::hevc_main();
        let recon = Reconstructor::new(&config).unwrap();
        let mut cu = CodingUnit::new(0, 0, 3, 0);
        cu.qp = 4;
        let residual: Vec<i16> = (0..64).map(|i| ((i % 8) * 3) as i16 - 10).collect();
        let coding = recon.block_coding(&cu, 0, 3, Some(1), false, 0).unwrap();
        let mut levels = vec![0; 64];
        recon.forward(0, &coding, &residual, 8, &mut levels, None).unwrap();
        let mut out = vec![0i16; 64];
        recon.inverse(0, &coding, &levels, &mut out, 8).unwrap();
        for (a, b) in out.iter().zip(&residual) {
            assert!((a - b).abs() <= 2, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_tree_blocks_and_positions() {
        let mut config = CodecConfig::hevc_main();
        config.chroma_format = ChromaFormat::Yuv422;
        let recon = Reconstructor::new(&config).unwrap();
        let cu = CodingUnit::new(32, 16, 4, 1);
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        let mut luma = vec![0; 256];
        luma[0] = 4;
        tree.set_luma(tree.root(), luma).unwrap();
        let mut cr = vec![0; 128];
        cr[64] = -3;
        tree.set_chroma(tree.root(), 2, cr).unwrap();
        tree.update_cbfs();

        let blocks = recon.reconstruct_tree(&cu, &tree).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].c_idx, blocks[0].x, blocks[0].y, blocks[0].size), (0, 32, 16, 16));
        assert_eq!((blocks[1].c_idx, blocks[1].x, blocks[1].y, blocks[1].size), (2, 16, 24, 8));
        assert!(blocks[1].samples.iter().all(|&s| s < 0));
        assert_eq!(chroma_position(config.chroma_format, 32, 16), (16, 16));
    }
}
