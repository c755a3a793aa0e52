//! Entropy coding benchmarks
//!
//! Residual coding through the arithmetic coder, the bit-estimation backend
//! used during RD search, and parsing of the produced slices.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use zvd_tq::codec::h265::cabac::{BinCounter, CabacReader, CabacWriter};
use zvd_tq::codec::h265::config::SliceType;
use zvd_tq::codec::h265::residual::ResidualParams;
use zvd_tq::codec::h265::sbac::{Sbac, SymbolDecoder, SymbolEncoder};
use zvd_tq::codec::h265::scan::ScanPattern;

const BLOCKS_PER_ITER: usize = 64;

/// Quantized block with decaying levels toward high frequencies
fn test_levels(n: usize, density: usize) -> Vec<i32> {
    (0..n * n)
        .map(|i| {
            let x = i % n;
            let y = i / n;
            if (x + y) * density >= n * 2 {
                return 0;
            }
            let magnitude = (n * 2 / (x + y + 1)) as i32 % 9;
            if (x ^ y) & 1 == 1 {
                -magnitude
            } else {
                magnitude
            }
        })
        .collect()
}

fn params(log2_size: u8) -> ResidualParams {
    ResidualParams {
        log2_size,
        is_luma: true,
        scan: ScanPattern::Diagonal,
        // Levels are not parity-adjusted here
        sign_hiding: false,
    }
}

fn encode_blocks(levels: &[i32], params: &ResidualParams) -> Vec<u8> {
    let mut sbac = Sbac::new(CabacWriter::new(), SliceType::P, 32);
    for _ in 0..BLOCKS_PER_ITER {
        sbac.encode_residual(params, levels);
    }
    sbac.encode_end_of_slice_segment_flag(true);
    sbac.into_inner().finish()
}

fn bench_residual_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("residual_encode");

    for log2_size in [2u8, 3, 4, 5] {
        let n = 1usize << log2_size;
        let levels = test_levels(n, 2);
        let params = params(log2_size);
        group.throughput(Throughput::Elements((n * n * BLOCKS_PER_ITER) as u64));

        group.bench_with_input(BenchmarkId::new("cabac", n), &n, |b, _| {
            b.iter(|| black_box(encode_blocks(black_box(&levels), &params)));
        });
        group.bench_with_input(BenchmarkId::new("bit_estimate", n), &n, |b, _| {
            b.iter(|| {
                let mut sbac = Sbac::new(BinCounter::new(), SliceType::P, 32);
                for _ in 0..BLOCKS_PER_ITER {
                    sbac.encode_residual(&params, black_box(&levels));
                }
                black_box(sbac.bins().bits())
            });
        });
    }
    group.finish();
}

fn bench_residual_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("residual_decode");

    for log2_size in [2u8, 3, 4, 5] {
        let n = 1usize << log2_size;
        let levels = test_levels(n, 2);
        let params = params(log2_size);
        let data = encode_blocks(&levels, &params);
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut out = vec![0i32; n * n];
            b.iter(|| {
                let reader = CabacReader::new(black_box(&data)).expect("reader");
                let mut sbac = Sbac::new(reader, SliceType::P, 32);
                for _ in 0..BLOCKS_PER_ITER {
                    sbac.decode_residual(&params, &mut out).expect("decode");
                }
                black_box(&out);
            });
        });
    }
    group.finish();
}

fn bench_bypass_bins(c: &mut Criterion) {
    let mut group = c.benchmark_group("bypass_bins");
    let values: Vec<i32> = (0..1024).map(|i| (i * 37 % 301) - 150).collect();
    group.throughput(Throughput::Elements(values.len() as u64));

    group.bench_function("golomb_k2", |b| {
        b.iter(|| {
            let mut sbac = Sbac::new(CabacWriter::new(), SliceType::I, 32);
            for &v in &values {
                sbac.encode_golomb_ep(black_box(v), 2);
            }
            black_box(sbac.into_inner().finish())
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_residual_encode,
    bench_residual_decode,
    bench_bypass_bins
);
criterion_main!(benches);
