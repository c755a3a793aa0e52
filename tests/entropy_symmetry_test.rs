//! Encode/decode symmetry of complete coding units
//!
//! Every test writes a sequence of CUs with [`EntropyEncoder`], parses the
//! bytes back with [`EntropyDecoder`] and checks both the recovered values
//! and that the parser ends exactly on the end_of_slice_segment_flag.

use zvd_tq::codec::h265::alf::{AlfChromaIdc, AlfFilterSet, AlfParams, AlfShape, AlfStore};
use zvd_tq::codec::h265::cabac::{CabacReader, CabacWriter};
use zvd_tq::codec::h265::config::{CodecConfig, SliceType};
use zvd_tq::codec::h265::ctu::{CodingUnit, CuNeighbors, InterDir, Mv, NeighborCu, PartMode, PredictionUnit};
use zvd_tq::codec::h265::entropy::{EntropyDecoder, EntropyEncoder, SliceParams};
use zvd_tq::codec::h265::sbac::{Sbac, SymbolDecoder, SymbolEncoder};
use zvd_tq::codec::h265::tu::TransformTree;
use zvd_tq::{Error, Result};

fn encode<F>(config: &CodecConfig, slice: SliceParams, body: F) -> Vec<u8>
where
    F: FnOnce(&mut EntropyEncoder<'_, Sbac<CabacWriter>>) -> Result<()>,
{
    let mut sbac = Sbac::new(CabacWriter::new(), slice.slice_type, slice.qp);
    let mut enc = EntropyEncoder::new(&mut sbac, config, slice);
    body(&mut enc).expect("encoding succeeds");
    enc.encode_end_of_slice_segment_flag(true);
    sbac.into_inner().finish()
}

fn decode<T, F>(config: &CodecConfig, slice: SliceParams, data: &[u8], body: F) -> T
where
    F: FnOnce(&mut EntropyDecoder<'_, Sbac<CabacReader<'_>>>) -> Result<T>,
{
    let reader = CabacReader::new(data).expect("reader");
    let mut sbac = Sbac::new(reader, slice.slice_type, slice.qp);
    let mut dec = EntropyDecoder::new(&mut sbac, config, slice);
    let out = body(&mut dec).expect("decoding succeeds");
    assert!(
        dec.decode_end_of_slice_segment_flag().expect("terminating bin"),
        "parser is out of step with the writer"
    );
    out
}

/// Residual with two nonzero levels close together in scan order
fn sparse_levels(log2_size: u8, a: i32, b: i32) -> Vec<i32> {
    let mut levels = vec![0; 1 << (2 * log2_size)];
    levels[0] = a;
    levels[1] = b;
    levels
}

#[test]
fn test_intra_cu_with_luma_and_chroma_residual() {
    let config = CodecConfig::hevc_main();
    let slice = SliceParams::new(SliceType::I, 27);
    let neighbors = CuNeighbors {
        left: Some(NeighborCu {
            depth: 2,
            intra_mode: Some(26),
            ..Default::default()
        }),
        above: None,
        above_in_ctu: false,
    };

    let mut cu = CodingUnit::new(16, 0, 4, 2);
    cu.intra_luma_modes = [26; 4];
    cu.intra_chroma_mode = 10;
    let mut tree = TransformTree::new(&cu, config.chroma_format);
    let root = tree.root();
    tree.set_luma(root, sparse_levels(4, 7, -2)).expect("luma");
    tree.set_chroma(root, 1, sparse_levels(3, -3, 1)).expect("cb");
    tree.update_cbfs();

    let data = encode(&config, slice, |enc| {
        enc.encode_split_cu_flag(4, 2, false, &neighbors);
        enc.encode_coding_unit(&cu, &neighbors, Some(&tree), 27)
    });
    let (decoded, decoded_tree) = decode(&config, slice, &data, |dec| {
        assert!(!dec.decode_split_cu_flag(4, 2, &neighbors)?);
        dec.decode_coding_unit(16, 0, 4, 2, &neighbors, 27)
    });

    assert!(decoded.is_intra());
    assert_eq!(decoded.intra_luma_modes[0], 26);
    assert_eq!(decoded.intra_chroma_mode, 10);
    let decoded_tree = decoded_tree.expect("intra CU has a transform tree");
    let node = decoded_tree.node(decoded_tree.root());
    assert!(node.is_leaf());
    assert!(node.cbf[0][0]);
    assert!(node.cbf[1][0]);
    assert!(!node.cbf[2][0]);
    assert_eq!(node.coeffs[0], sparse_levels(4, 7, -2));
    assert_eq!(node.coeffs[1], sparse_levels(3, -3, 1));
}

#[test]
fn test_skip_and_amp_cus_in_p_slice() {
    let config = CodecConfig::hevc_main();
    let slice = SliceParams::new(SliceType::P, 32);
    let neighbors = CuNeighbors::default();

    let mut skip = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2Nx2N);
    skip.skip = true;
    skip.root_cbf = false;
    skip.pus[0] = PredictionUnit {
        merge_flag: true,
        merge_idx: 3,
        ..Default::default()
    };

    let mut amp = CodingUnit::new_inter(16, 0, 4, 2, PartMode::Part2NxnU);
    amp.pus[0] = PredictionUnit {
        merge_flag: true,
        merge_idx: 1,
        ..Default::default()
    };
    amp.pus[1] = PredictionUnit {
        inter_dir: InterDir::L0,
        mvd: [Mv::new(3, -5), Mv::default()],
        mvp_idx: [1, 0],
        ..Default::default()
    };
    // Root TU with luma residual only: luma CBF is inferred
    let mut tree = TransformTree::new(&amp, config.chroma_format);
    let root = tree.root();
    tree.set_luma(root, sparse_levels(4, -4, 0)).expect("luma");
    tree.update_cbfs();

    let after_skip = CuNeighbors {
        left: Some(skip.as_neighbor()),
        above: None,
        above_in_ctu: false,
    };
    let data = encode(&config, slice, |enc| {
        enc.encode_coding_unit(&skip, &neighbors, None, 32)?;
        enc.encode_coding_unit(&amp, &after_skip, Some(&tree), 32)
    });
    let (first, second) = decode(&config, slice, &data, |dec| {
        let first = dec.decode_coding_unit(0, 0, 4, 2, &neighbors, 32)?;
        let second = dec.decode_coding_unit(16, 0, 4, 2, &after_skip, 32)?;
        Ok((first, second))
    });

    let (first, first_tree) = first;
    assert!(first.skip);
    assert!(first_tree.is_none());
    assert_eq!(first.pus[0].merge_idx, 3);

    let (second, second_tree) = second;
    assert_eq!(second.part_mode, PartMode::Part2NxnU);
    assert_eq!(second.pus, amp.pus);
    assert!(second.root_cbf);
    let second_tree = second_tree.expect("residual");
    let node = second_tree.node(second_tree.root());
    assert!(node.cbf[0][0]);
    assert_eq!(node.coeffs[0], sparse_levels(4, -4, 0));
}

#[test]
fn test_single_candidate_indices_are_omitted() {
    let mut config = CodecConfig::hevc_main();
    config.max_num_merge_cand = 1;
    config.num_mvp_cand = 1;
    let mut slice = SliceParams::new(SliceType::B, 30);
    slice.num_ref_idx = [2, 1];
    let neighbors = CuNeighbors::default();

    let mut skip = CodingUnit::new_inter(0, 0, 3, 3, PartMode::Part2Nx2N);
    skip.skip = true;
    skip.root_cbf = false;
    skip.pus[0].merge_flag = true;

    let mut bi = CodingUnit::new_inter(8, 0, 3, 3, PartMode::Part2Nx2N);
    bi.root_cbf = false;
    bi.pus[0] = PredictionUnit {
        inter_dir: InterDir::Bi,
        ref_idx: [1, 0],
        mvd: [Mv::new(-12, 0), Mv::new(1, 1)],
        ..Default::default()
    };

    let data = encode(&config, slice, |enc| {
        enc.encode_coding_unit(&skip, &neighbors, None, 30)?;
        enc.encode_coding_unit(&bi, &neighbors, None, 30)
    });
    let (first, second) = decode(&config, slice, &data, |dec| {
        let (first, _) = dec.decode_coding_unit(0, 0, 3, 3, &neighbors, 30)?;
        let (second, _) = dec.decode_coding_unit(8, 0, 3, 3, &neighbors, 30)?;
        Ok((first, second))
    });

    assert!(first.skip);
    assert_eq!(first.pus[0].merge_idx, 0);
    assert!(!second.root_cbf);
    assert_eq!(second.pus[0].inter_dir, InterDir::Bi);
    assert_eq!(second.pus[0].ref_idx, [1, 0]);
    assert_eq!(second.pus[0].mvd, bi.pus[0].mvd);
    assert_eq!(second.pus[0].mvp_idx, [0, 0]);
}

#[test]
fn test_extended_intra_cu_with_emt() {
    let config = CodecConfig::extended();
    let slice = SliceParams::new(SliceType::I, 32);
    let neighbors = CuNeighbors::default();

    let mut cu = CodingUnit::new(0, 0, 4, 3);
    cu.intra_luma_modes = [50; 4];
    cu.intra_chroma_mode = 50;
    cu.emt_flag = true;
    let mut tree = TransformTree::new(&cu, config.chroma_format);
    let root = tree.root();
    let mut luma = vec![0; 256];
    luma[0] = 9;
    luma[1] = -3;
    luma[16] = 2;
    tree.set_luma(root, luma.clone()).expect("luma");
    tree.node_mut(root).emt_idx = 3;
    tree.update_cbfs();

    let data = encode(&config, slice, |enc| {
        enc.encode_coding_unit(&cu, &neighbors, Some(&tree), 32)
    });
    let (decoded, decoded_tree) = decode(&config, slice, &data, |dec| {
        dec.decode_coding_unit(0, 0, 4, 3, &neighbors, 32)
    });

    assert_eq!(decoded.intra_luma_modes[0], 50);
    assert_eq!(decoded.intra_chroma_mode, 50);
    assert!(decoded.emt_flag);
    let decoded_tree = decoded_tree.expect("tree");
    let node = decoded_tree.node(decoded_tree.root());
    assert_eq!(node.emt_idx, 3);
    assert_eq!(node.coeffs[0], luma);
}

#[test]
fn test_alf_params_and_cu_control_flags() {
    let config = CodecConfig::extended();
    let mut filters = Vec::new();
    for i in 0..3 {
        let mut filter = vec![0; AlfShape::Diamond7x7.num_coeffs()];
        filter[0] = i - 1;
        filter[12] = 60 + i * 4;
        filters.push(filter);
    }
    let mut class_to_filter = [0u8; 25];
    for (class, slot) in class_to_filter.iter_mut().enumerate() {
        *slot = if class < 8 { 0 } else if class < 20 { 1 } else { 2 };
    }
    let params = AlfParams {
        enabled: true,
        luma: Some(AlfFilterSet {
            shape: AlfShape::Diamond7x7,
            filters,
            class_to_filter,
        }),
        predict_filters: true,
        chroma_idc: AlfChromaIdc { cb: false, cr: true },
        chroma: vec![2, 0, -1, 3, 1, 0, 50],
        cu_control_depth: Some(1),
        ..Default::default()
    };

    let mut slice = SliceParams::new(SliceType::I, 32);
    slice.alf_cu_control_depth = params.cu_control_depth;
    let mut cu = CodingUnit::new(0, 0, 5, 2);
    cu.alf_flag = true;
    cu.root_cbf = true;
    let tree = TransformTree::new(&cu, config.chroma_format);
    let neighbors = CuNeighbors::default();

    let mut enc_store = AlfStore::new();
    let data = encode(&config, slice, |enc| {
        enc.encode_alf_params(&params, &mut enc_store)?;
        enc.encode_coding_unit(&cu, &neighbors, Some(&tree), 32)
    });
    assert_eq!(enc_store.len(), 1);

    let mut dec_store = AlfStore::new();
    let (decoded_params, decoded_cu) = decode(&config, slice, &data, |dec| {
        let decoded_params = dec.decode_alf_params(&mut dec_store)?;
        let (decoded_cu, _) = dec.decode_coding_unit(0, 0, 5, 2, &neighbors, 32)?;
        Ok((decoded_params, decoded_cu))
    });

    assert_eq!(decoded_params, params);
    assert_eq!(dec_store, enc_store);
    assert!(decoded_cu.alf_flag);
}

#[test]
fn test_alf_flag_is_shared_within_control_block() {
    let config = CodecConfig::extended();
    let mut slice = SliceParams::new(SliceType::I, 32);
    // 64x64 control blocks in a 128x128 CTB; the 32x32 CUs sit one level deeper
    slice.alf_cu_control_depth = Some(1);
    let neighbors = CuNeighbors::default();
    let flags = [(0, true), (32, true), (64, false), (96, false)];
    let cus: Vec<CodingUnit> = flags
        .iter()
        .map(|&(x, flag)| {
            let mut cu = CodingUnit::new(x, 0, 5, 2);
            cu.alf_flag = flag;
            cu.root_cbf = true;
            cu
        })
        .collect();
    let tree = TransformTree::new(&cus[0], config.chroma_format);

    let data = encode(&config, slice, |enc| {
        for cu in &cus {
            enc.encode_coding_unit(cu, &neighbors, Some(&tree), 32)?;
        }
        Ok(())
    });

    let decoded = decode(&config, slice, &data, |dec| {
        flags
            .iter()
            .map(|&(x, _)| {
                dec.decode_coding_unit(x, 0, 5, 2, &neighbors, 32)
                    .map(|(cu, _)| cu.alf_flag)
            })
            .collect::<Result<Vec<bool>>>()
    });
    assert_eq!(decoded, vec![true, true, false, false]);

    // A CU cannot disagree with the flag of its control block
    let mut sbac = Sbac::new(CabacWriter::new(), slice.slice_type, slice.qp);
    let mut enc = EntropyEncoder::new(&mut sbac, &config, slice);
    enc.encode_coding_unit(&cus[0], &neighbors, Some(&tree), 32)
        .expect("first CU");
    let mut stray = cus[1].clone();
    stray.alf_flag = false;
    let err = enc
        .encode_coding_unit(&stray, &neighbors, Some(&tree), 32)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
}

#[test]
fn test_skip_cu_rejected_in_intra_slice() {
    let config = CodecConfig::hevc_main();
    let slice = SliceParams::new(SliceType::I, 32);
    let mut cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2Nx2N);
    cu.skip = true;
    cu.root_cbf = false;
    cu.pus = vec![PredictionUnit {
        merge_flag: true,
        merge_idx: 1,
        ..Default::default()
    }];

    let mut sbac = Sbac::new(CabacWriter::new(), slice.slice_type, slice.qp);
    let mut enc = EntropyEncoder::new(&mut sbac, &config, slice);
    let err = enc
        .encode_coding_unit(&cu, &CuNeighbors::default(), None, 32)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
}

#[test]
fn test_bypass_golomb_codes_roundtrip() {
    let values = [0, 1, -1, 7, -8, 63, -200, 1000];
    let mut sbac = Sbac::new(CabacWriter::new(), SliceType::B, 37);
    for k in 0..4 {
        for &v in &values {
            sbac.encode_golomb_ep(v, k);
            sbac.encode_exp_golomb_ep(v.unsigned_abs(), k);
        }
    }
    sbac.encode_end_of_slice_segment_flag(true);
    let data = sbac.into_inner().finish();

    let reader = CabacReader::new(&data).expect("reader");
    let mut sbac = Sbac::new(reader, SliceType::B, 37);
    for k in 0..4 {
        for &v in &values {
            assert_eq!(sbac.decode_golomb_ep(k).expect("golomb"), v);
            assert_eq!(sbac.decode_exp_golomb_ep(k).expect("exp-golomb"), v.unsigned_abs());
        }
    }
    assert!(sbac.decode_end_of_slice_segment_flag().expect("terminating bin"));
}
