//! Integration tests for the transform / quantization path
//!
//! Reconstruction accuracy against a floating point reference, zero-block
//! behavior and quantizer monotonicity, all through the public API.

use zvd_tq::codec::h265::cabac::BinCounter;
use zvd_tq::codec::h265::config::{CodecConfig, CodingTools, SliceType};
use zvd_tq::codec::h265::contexts::ContextSet;
use zvd_tq::codec::h265::ctu::{CodingUnit, PartMode};
use zvd_tq::codec::h265::encoder_transform::{BlockSite, TransformDecision};
use zvd_tq::codec::h265::quant::{QpParam, QuantBlock, Quantizer};
use zvd_tq::codec::h265::rdo::{select_best, CostFunction, RdCostState};
use zvd_tq::codec::h265::recon::Reconstructor;
use zvd_tq::codec::h265::sbac::{Sbac, SymbolEncoder};
use zvd_tq::codec::h265::scan::ScanPattern;

/// Integer DCT basis approximated by 64 * sqrt(N) * orthonormal DCT-II
fn float_basis(n: usize, k: usize, x: usize) -> f64 {
    let scale = if k == 0 { (1.0 / n as f64).sqrt() } else { (2.0 / n as f64).sqrt() };
    let angle = std::f64::consts::PI * (2 * x + 1) as f64 * k as f64 / (2 * n) as f64;
    64.0 * (n as f64).sqrt() * scale * angle.cos()
}

/// Floating point 2D inverse DCT with the integer path's normalization
fn float_idct(coeffs: &[i32], n: usize, bit_depth: u8) -> Vec<f64> {
    let norm = 2f64.powi(7 + 20 - bit_depth as i32);
    let mut out = vec![0.0; n * n];
    for y in 0..n {
        for x in 0..n {
            let mut sum = 0.0;
            for v in 0..n {
                for u in 0..n {
                    let c = coeffs[v * n + u];
                    if c != 0 {
                        sum += c as f64 * float_basis(n, u, x) * float_basis(n, v, y);
                    }
                }
            }
            out[y * n + x] = sum / norm;
        }
    }
    out
}

#[test]
fn test_dc_level_matches_float_idct() {
    let config = CodecConfig::hevc_main();
    let recon = Reconstructor::new(&config).expect("valid config");
    let mut cu = CodingUnit::new(0, 0, 3, 0);
    cu.qp = 32;
    let coding = recon
        .block_coding(&cu, 0, 3, Some(1), false, 0)
        .expect("8x8 luma coding");

    let mut levels = vec![0i32; 64];
    levels[0] = 5;

    let mut coeffs = vec![0i32; 64];
    recon.quantizer(0).dequantize(&coding.quant, &levels, &mut coeffs);
    assert!(coeffs[0] > 0);
    assert!(coeffs[1..].iter().all(|&c| c == 0));

    let mut residual = vec![0i16; 64];
    recon
        .inverse(0, &coding, &levels, &mut residual, 8)
        .expect("inverse transform");

    let reference = float_idct(&coeffs, 8, 8);
    for (i, (&got, &want)) in residual.iter().zip(&reference).enumerate() {
        assert!(
            (got as f64 - want).abs() <= 1.0,
            "sample {}: integer {} vs float {:.3}",
            i,
            got,
            want
        );
    }
    // A DC-only block reconstructs flat
    assert!(residual.iter().all(|&r| r == residual[0]));
}

#[test]
fn test_zero_4x4_block_has_no_cbf_at_any_qp() {
    let config = CodecConfig::hevc_main();
    let recon = Reconstructor::new(&config).expect("valid config");
    let site = BlockSite {
        c_idx: 0,
        log2_size: 2,
        depth: 1,
        intra_mode: Some(1),
    };
    let org = vec![77u16; 16];

    for qp in [0, 12, 22, 32, 37, 51] {
        let mut cu = CodingUnit::new(0, 0, 3, 0);
        cu.part_mode = PartMode::PartNxN;
        cu.qp = qp;
        let contexts = ContextSet::new(SliceType::I, qp);
        let td = TransformDecision::for_qp(&recon, qp, true).expect("lambda");
        let result = td
            .decide(&cu, &site, &org, &org, 4, &contexts)
            .expect("decision");

        assert!(!result.cbf, "qp {}", qp);
        assert!(result.levels.iter().all(|&l| l == 0));
        assert_eq!(result.recon, org);

        let mut cbf_only = Sbac::with_contexts(BinCounter::new(), contexts.clone());
        cbf_only.encode_cbf(false, true, site.depth);
        assert_eq!(result.cost.bits, cbf_only.bins().bits(), "qp {}", qp);
    }
}

#[test]
fn test_quantization_is_monotonic() {
    let tools = CodingTools {
        sign_data_hiding: false,
        rdoq: false,
        ..CodingTools::default()
    };
    let quantizer = Quantizer::new(8, &tools).expect("8-bit quantizer");

    for qp in [4, 22, 32, 45] {
        for (intra, pos) in [(true, 0usize), (false, 9)] {
            let block = QuantBlock {
                qp: QpParam::new(qp).expect("qp in range"),
                log2_size: 3,
                is_luma: true,
                intra,
                scan: ScanPattern::Diagonal,
                bypass: false,
            };
            let mut previous = 0;
            for magnitude in (0..4000).step_by(7) {
                let mut coeffs = vec![0i32; 64];
                let mut levels = vec![0i32; 64];
                coeffs[pos] = magnitude;
                quantizer.quantize(&block, &coeffs, &mut levels, None);
                let level = levels[pos];
                assert!(level >= previous, "qp {} magnitude {}", qp, magnitude);
                previous = level;

                coeffs[pos] = -magnitude;
                quantizer.quantize(&block, &coeffs, &mut levels, None);
                assert_eq!(levels[pos], -level);
            }
        }
    }
}

#[test]
fn test_lower_distortion_wins_at_equal_bits() {
    let rd = RdCostState::new(57.0, false).expect("lambda");
    let a = rd.rd_cost(40, 1200, CostFunction::Sse);
    let b = rd.rd_cost(40, 1100, CostFunction::Sse);
    assert!(b.is_better_than(&a));
    assert_eq!(select_best([a.cost, b.cost]), Some(1));
    assert_eq!(select_best([b.cost, a.cost]), Some(0));
}

#[test]
fn test_transquant_bypass_is_lossless() {
    let mut config = CodecConfig::hevc_main();
    config.tools.transquant_bypass = true;
    let recon = Reconstructor::new(&config).expect("valid config");
    let mut cu = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2Nx2N);
    cu.transquant_bypass = true;

    let residual: Vec<i16> = (0..256).map(|i| ((i * 37) % 101) as i16 - 50).collect();
    let coding = recon
        .block_coding(&cu, 0, 4, None, false, 0)
        .expect("bypass coding");
    let mut levels = vec![0i32; 256];
    assert!(recon
        .forward(0, &coding, &residual, 16, &mut levels, None)
        .expect("forward"));
    let mut out = vec![0i16; 256];
    recon
        .inverse(0, &coding, &levels, &mut out, 16)
        .expect("inverse");
    assert_eq!(out, residual);
}
