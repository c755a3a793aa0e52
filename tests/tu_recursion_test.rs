//! Transform tree recursion against hand-written symbol sequences
//!
//! The encoder walk is compared bin for bin with the syntax elements written
//! manually, and the parser is fed streams that exercise inference rules and
//! conformance checks.

use zvd_tq::codec::h265::cabac::{CabacReader, CabacWriter};
use zvd_tq::codec::h265::config::{ChromaFormat, CodecConfig, SliceType};
use zvd_tq::codec::h265::ctu::{CodingUnit, PartMode};
use zvd_tq::codec::h265::sbac::{Sbac, SymbolDecoder, SymbolEncoder};
use zvd_tq::codec::h265::tu::{self, residual_params, TransformTree};
use zvd_tq::Error;

fn writer(slice_type: SliceType, qp: i32) -> Sbac<CabacWriter> {
    Sbac::new(CabacWriter::new(), slice_type, qp)
}

fn finish(mut sbac: Sbac<CabacWriter>) -> Vec<u8> {
    sbac.encode_end_of_slice_segment_flag(true);
    sbac.into_inner().finish()
}

fn single_level(len: usize, pos: usize, value: i32) -> Vec<i32> {
    let mut levels = vec![0; len];
    levels[pos] = value;
    levels
}

#[test]
fn test_inter_root_luma_cbf_is_inferred() {
    let config = CodecConfig::hevc_main();
    let cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2Nx2N);
    let levels = single_level(256, 0, 6);

    let mut tree = TransformTree::new(&cu, config.chroma_format);
    tree.set_luma(tree.root(), levels.clone()).expect("luma");
    tree.update_cbfs();

    let mut sbac = writer(SliceType::P, 32);
    tu::encode_transform_tree(&mut sbac, &config, &cu, &tree, 32).expect("encode");
    let walked = finish(sbac);

    // split_transform_flag, cbf_cb, cbf_cr, then residual_coding; no cbf_luma
    let mut sbac = writer(SliceType::P, 32);
    sbac.encode_split_transform_flag(false, 4);
    sbac.encode_cbf(false, false, 0);
    sbac.encode_cbf(false, false, 0);
    sbac.encode_residual(&residual_params(&config, &cu, 4, true, None), &levels);
    let manual = finish(sbac);
    assert_eq!(walked, manual);

    let reader = CabacReader::new(&manual).expect("reader");
    let mut sbac = Sbac::new(reader, SliceType::P, 32);
    let mut decoded_cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2Nx2N);
    let decoded = tu::decode_transform_tree(&mut sbac, &config, &mut decoded_cu, 32).expect("decode");
    let root = decoded.node(decoded.root());
    assert!(root.is_leaf());
    assert!(root.cbf[0][0]);
    assert_eq!(root.coeffs[0], levels);
    assert!(sbac.decode_end_of_slice_segment_flag().expect("terminating bin"));
}

#[test]
fn test_inter_split_without_coded_blocks_is_rejected() {
    let config = CodecConfig::hevc_main();

    let mut sbac = writer(SliceType::B, 30);
    sbac.encode_split_transform_flag(true, 4);
    sbac.encode_cbf(false, false, 0);
    sbac.encode_cbf(false, false, 0);
    for _ in 0..4 {
        sbac.encode_split_transform_flag(false, 3);
        sbac.encode_cbf(false, true, 1);
    }
    let data = finish(sbac);

    let reader = CabacReader::new(&data).expect("reader");
    let mut sbac = Sbac::new(reader, SliceType::B, 30);
    let mut cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2Nx2N);
    let err = tu::decode_transform_tree(&mut sbac, &config, &mut cu, 30).unwrap_err();
    assert!(matches!(err, Error::Conformance(_)), "{:?}", err);

    // The encoder refuses to produce the same tree
    let mut tree = TransformTree::new(&cu, config.chroma_format);
    tree.split(tree.root()).expect("split");
    tree.update_cbfs();
    let mut sbac = writer(SliceType::B, 30);
    let err = tu::encode_transform_tree(&mut sbac, &config, &cu, &tree, 30).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
}

#[test]
fn test_422_split_tree_roundtrip() {
    let mut config = CodecConfig::hevc_main();
    config.chroma_format = ChromaFormat::Yuv422;
    let mut cu = CodingUnit::new(0, 0, 4, 2);
    cu.intra_luma_modes = [18; 4];
    cu.intra_chroma_mode = 18;

    let mut tree = TransformTree::new(&cu, config.chroma_format);
    let children = tree.split(tree.root()).expect("split");
    tree.set_luma(children[0], single_level(64, 0, -2)).expect("luma");
    // Lower 4x4 Cr block of the third child
    tree.set_chroma(children[2], 2, single_level(32, 16, 5)).expect("cr");
    tree.update_cbfs();
    assert!(tree.chroma_cbf(tree.root(), 2));
    assert!(!tree.chroma_cbf(tree.root(), 1));

    let mut sbac = writer(SliceType::I, 32);
    tu::encode_transform_tree(&mut sbac, &config, &cu, &tree, 32).expect("encode");
    let data = finish(sbac);

    let reader = CabacReader::new(&data).expect("reader");
    let mut sbac = Sbac::new(reader, SliceType::I, 32);
    let mut decoded_cu = CodingUnit::new(0, 0, 4, 2);
    decoded_cu.intra_luma_modes = [18; 4];
    decoded_cu.intra_chroma_mode = 18;
    let decoded = tu::decode_transform_tree(&mut sbac, &config, &mut decoded_cu, 32).expect("decode");
    assert!(sbac.decode_end_of_slice_segment_flag().expect("terminating bin"));

    assert_eq!(decoded.len(), tree.len());
    for (a, b) in decoded.leaves().into_iter().zip(tree.leaves()) {
        assert_eq!(decoded.node(a).cbf, tree.node(b).cbf);
    }
    let third = decoded.node(decoded.leaves()[2]);
    assert_eq!(third.cbf[2], [false, true]);
    assert_eq!(third.coeffs[2], single_level(32, 16, 5));
    assert_eq!(decoded.node(decoded.leaves()[0]).coeffs[0], single_level(64, 0, -2));
}

#[test]
fn test_qp_delta_applies_to_whole_cu() {
    let mut config = CodecConfig::hevc_main();
    config.tools.cu_qp_delta = true;
    let mut cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2NxN);
    cu.qp = 40;

    let mut tree = TransformTree::new(&cu, config.chroma_format);
    let children = tree.split(tree.root()).expect("split");
    tree.set_luma(children[1], single_level(64, 0, 1)).expect("luma");
    tree.set_luma(children[3], single_level(64, 0, -1)).expect("luma");
    tree.update_cbfs();

    let mut sbac = writer(SliceType::P, 34);
    tu::encode_transform_tree(&mut sbac, &config, &cu, &tree, 34).expect("encode");
    let data = finish(sbac);

    let reader = CabacReader::new(&data).expect("reader");
    let mut sbac = Sbac::new(reader, SliceType::P, 34);
    let mut decoded_cu = CodingUnit::new_inter(0, 0, 4, 2, PartMode::Part2NxN);
    let decoded = tu::decode_transform_tree(&mut sbac, &config, &mut decoded_cu, 34).expect("decode");
    assert!(sbac.decode_end_of_slice_segment_flag().expect("terminating bin"));
    assert_eq!(decoded_cu.qp, 40);
    let leaves = decoded.leaves();
    assert!(!decoded.node(leaves[0]).cbf[0][0]);
    assert!(decoded.node(leaves[1]).cbf[0][0]);
    assert!(decoded.node(leaves[3]).cbf[0][0]);
}
