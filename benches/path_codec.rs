//! Path codec and sweep benchmarks
//!
//! Resolution runs once per experiment, but sweep dry runs plan every
//! combination up front, so encode/decode cost scales with grid size.
//!
//! Run with: cargo bench --bench path_codec

use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prunelab::config::ExperimentConfig;
use prunelab::path_codec::{decode, infer_from_path, FolderName, PathCodec, PathFragment};
use prunelab::sweep::expand;

fn pruned_config() -> ExperimentConfig {
    ExperimentConfig::builder(0, "CIFAR10", "VGG")
        .prune("GlobalMagWeight", 8)
        .finetune_epochs(40)
        .attack("pgd")
        .build()
        .expect("valid config")
}

/// Benchmark configuration → folder name → path
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let config = pruned_config();
    let codec = PathCodec::new("/srv/prunelab");

    group.bench_function("folder_name", |b| {
        b.iter(|| FolderName::from_config(black_box(&config)).map(|f| f.to_string()));
    });
    group.bench_function("plan", |b| {
        b.iter(|| codec.plan(black_box(&config)));
    });

    group.finish();
}

/// Benchmark path → configuration fields
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let path = PathBuf::from(
        "/srv/prunelab/experiments/experiment_0/VGG/CIFAR10/\
         vgg_GlobalMagWeight_8_compression_40_finetune_iterations/checkpoints/best.pt",
    );
    let known = PathFragment::from(&pruned_config());

    group.bench_function("decode", |b| {
        b.iter(|| decode(black_box(&path)));
    });
    group.bench_function("infer_with_known_fields", |b| {
        b.iter(|| infer_from_path(black_box(&path), black_box(&known)));
    });

    group.finish();
}

/// Benchmark sweep expansion for growing grids
fn bench_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_expand");

    for params in [2usize, 4, 6] {
        let grid: Vec<(String, Vec<u32>)> = (0..params)
            .map(|i| (format!("param_{i}"), (0..4).collect()))
            .collect();
        group.bench_with_input(BenchmarkId::new("4_candidates", params), &grid, |b, grid| {
            b.iter(|| expand(black_box(grid.clone())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_expand);
criterion_main!(benches);
