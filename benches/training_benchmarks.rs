/**
 * @file benches/training_benchmarks.rs
 * @brief Training throughput benchmarks
 *
 * Measures the hot paths of a training step: the slice kernels, single
 * sample inference and one optimizer step over a mini-batch, for a few
 * network widths.
 */

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use zen_dense::{kernels, Activation, Loss, Optimizer, Sequential};

// === HELPERS ===

fn random_rows(rng: &mut ChaCha8Rng, rows: usize, cols: usize) -> Vec<Vec<f64>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn network(width: usize, optimizer: Optimizer) -> Sequential {
    Sequential::builder()
        .input(width)
        .dense(width, Activation::relu())
        .dense(width / 2, Activation::Tanh)
        .dense(1, Activation::Linear)
        .optimizer(optimizer)
        .loss(Loss::mse())
        .seed(42)
        .build()
        .unwrap()
}

// === KERNELS ===

fn benchmark_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernels");
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    for size in [64, 256, 1024] {
        let rows = random_rows(&mut rng, size, size);
        let v: Vec<f64> = (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut dst = vec![0.0; size];

        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("mat_vec", size), &size, |b, _| {
            b.iter(|| {
                kernels::mat_vec_into(&mut dst, black_box(&rows), black_box(&v)).unwrap();
                black_box(&dst);
            })
        });

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("dot", size), &size, |b, _| {
            b.iter(|| black_box(kernels::dot(black_box(&v), black_box(&rows[0])).unwrap()))
        });
    }

    group.finish();
}

// === MODEL ===

fn benchmark_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute");
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    for width in [16, 64, 256] {
        let mut model = network(width, Optimizer::sgd(0.01));
        let input: Vec<f64> = (0..width).map(|_| rng.gen_range(-1.0..1.0)).collect();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("sequential", width), &width, |b, _| {
            b.iter(|| black_box(model.compute(black_box(&input)).unwrap()))
        });
    }

    group.finish();
}

fn benchmark_train_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_batch");
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let batch = 32;

    for width in [16, 64, 256] {
        let inputs = random_rows(&mut rng, batch, width);
        let expected = random_rows(&mut rng, batch, 1);

        group.throughput(Throughput::Elements(batch as u64));
        for (name, optimizer) in [("sgd", Optimizer::sgd(0.01)), ("adam", Optimizer::adam(0.001))] {
            let mut model = network(width, optimizer);
            group.bench_with_input(BenchmarkId::new(name, width), &width, |b, _| {
                b.iter(|| black_box(model.train_batch(&inputs, &expected).unwrap()))
            });
        }
    }

    group.finish();
}

criterion_group!(
    name = training_benchmarks;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8))
        .sample_size(50);
    targets =
        benchmark_kernels,
        benchmark_compute,
        benchmark_train_batch
);

criterion_main!(training_benchmarks);
