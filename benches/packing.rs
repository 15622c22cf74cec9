use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array4;

use he_infer::layout::{FlattenOrder, PackingFactor};
use he_infer::packing::BatchPacker;
use he_infer::unpacking::ResultUnpacker;

fn mnist_batch(batch: usize) -> Array4<f64> {
    Array4::from_shape_fn((batch, 28, 28, 1), |(b, i, j, _)| ((b + i * 28 + j) % 255) as f64 / 255.0)
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");

    let configs = [
        ("row_major_real", FlattenOrder::RowMajor, PackingFactor::One),
        ("column_major_real", FlattenOrder::ColumnMajor, PackingFactor::One),
        ("row_major_complex", FlattenOrder::RowMajor, PackingFactor::Two),
        ("column_major_complex", FlattenOrder::ColumnMajor, PackingFactor::Two),
    ];

    for batch in [64, 1024] {
        let data = mnist_batch(batch);
        for (name, order, factor) in configs {
            let packer = BatchPacker::new(order, factor);
            group.bench_with_input(BenchmarkId::new(name, batch), &data, |bench, data| {
                bench.iter(|| packer.pack(black_box(data)))
            });
        }
    }
    group.finish();
}

fn bench_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("unpack");

    for factor in [PackingFactor::One, PackingFactor::Two] {
        let packed = match BatchPacker::new(FlattenOrder::ColumnMajor, factor).pack(&mnist_batch(1024)) {
            Ok(packed) => packed,
            Err(e) => panic!("pack failed: {e}"),
        };
        group.bench_with_input(
            BenchmarkId::new("column_major", factor.value()),
            &packed,
            |bench, packed| bench.iter(|| ResultUnpacker::unpack_packed(black_box(packed))),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pack, bench_unpack);
criterion_main!(benches);
