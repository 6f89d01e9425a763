//! End-to-end epoch throughput across thread counts and model sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use crystalline::{train, TrainingConfig};

fn config_for(n_threads: usize, vocab_size: usize, d_model: usize) -> TrainingConfig {
    let mut cfg = TrainingConfig::default();
    cfg.vocab_size = vocab_size;
    cfg.d_model = d_model;
    cfg.n_heads = 4;
    cfg.d_ff = d_model * 2;
    cfg.n_layers = 2;
    cfg.max_seq_len = 32;
    cfg.batch_size = 8;
    cfg.seq_len = 16;
    cfg.epochs = 1;
    cfg.max_batches_per_epoch = 64;
    cfg.num_threads = n_threads;
    cfg.warmup_steps = 10;
    cfg.total_steps = 1000;
    cfg
}

fn token_stream(len: usize, vocab: usize) -> Vec<u32> {
    (0..len).map(|i| (i % vocab) as u32).collect()
}

fn bench_epoch_by_thread_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch_by_thread_count");
    group.throughput(Throughput::Elements(64));

    for n_threads in [1, 2, 4, 8, 12] {
        group.bench_with_input(
            BenchmarkId::from_parameter(n_threads),
            &n_threads,
            |b, &n_threads| {
                let cfg = config_for(n_threads, 4096, 128);
                let tokens = token_stream(64 * cfg.batch_size * cfg.seq_len + 1, cfg.vocab_size);
                b.iter_batched(
                    || train(cfg.clone(), tokens.clone()).unwrap(),
                    |mut handle| {
                        let report = black_box(handle.step_epoch().unwrap());
                        black_box(report)
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_lattice_table_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("lattice_table_build");

    for vocab_size in [1_000usize, 10_000, 32_000] {
        group.throughput(Throughput::Elements(vocab_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(vocab_size),
            &vocab_size,
            |b, &vocab_size| {
                b.iter(|| black_box(crystalline::lattice::LatticeTable::build(vocab_size).unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_epoch_by_thread_count, bench_lattice_table_build);
criterion_main!(benches);
