use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{Array3, Array4};
use voxfit::addressing;

fn bench_addressing(c: &mut Criterion) {
    let mask = Array3::from_shape_fn((64, 64, 32), |(x, y, z)| (x + y + z) % 3 != 0);
    let dense = Array4::from_shape_fn((64, 64, 32, 2), |(x, y, z, k)| {
        (x + y * 2 + z * 3 + k) as f64
    });
    let roi = addressing::extract(dense.view().into_dyn(), &mask).unwrap();

    c.bench_function("extract_64x64x32", |b| {
        b.iter(|| addressing::extract(black_box(dense.view().into_dyn()), black_box(&mask)).unwrap())
    });

    c.bench_function("restore_64x64x32", |b| {
        b.iter(|| addressing::restore4(black_box(roi.view()), black_box(&mask)).unwrap())
    });

    c.bench_function("roi_indices_64x64x32", |b| {
        b.iter(|| addressing::roi_indices(black_box(&mask)))
    });
}

criterion_group!(benches, bench_addressing);
criterion_main!(benches);
