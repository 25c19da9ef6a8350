//! Micro-benchmarks for sampling and logit processing over the Orpheus vocabulary.
//!
//! Run with: `cargo bench --bench sampling`

use candle_core::{Device, Tensor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use orpheus_tts::generation::{
    apply_repetition_penalty_with_mask, build_seen_mask, sample, suppress_token,
    GenerationConfig, SamplingContext,
};
use std::hint::black_box;

const VOCAB: usize = 156940;

fn patterned_logits(batch: usize, vocab_size: usize, device: &Device) -> Tensor {
    // Deterministic "random" logits via a simple pattern
    let data: Vec<f32> = (0..batch * vocab_size)
        .map(|i| (i as f32 * 0.1).sin() * 5.0)
        .collect();
    Tensor::from_vec(data, (batch, vocab_size), device).unwrap()
}

fn bench_sample_defaults(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("sample_defaults");
    let config = GenerationConfig::default();

    for batch in [1, 3, 8] {
        let logits = patterned_logits(batch, VOCAB, &device);
        group.bench_with_input(BenchmarkId::from_parameter(format!("batch_{batch}")), &batch, |b, _| {
            let mut ctx = SamplingContext::new(Some(42));
            b.iter(|| sample(black_box(&logits), black_box(&config), &mut ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_sample_top_p(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("sample_top_p");
    let logits = patterned_logits(1, VOCAB, &device);

    for p in [0.5, 0.9, 0.95] {
        let config = GenerationConfig {
            top_k: 0, // disable top-k to isolate top-p
            top_p: p,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(format!("p_{p}")), &p, |b, _| {
            let mut ctx = SamplingContext::new(Some(42));
            b.iter(|| sample(black_box(&logits), black_box(&config), &mut ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_repetition_penalty(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("repetition_penalty");

    for (batch, n_prev) in [(1, 100), (1, 1200), (3, 1200)] {
        let logits = patterned_logits(batch, VOCAB, &device);
        let rows: Vec<Vec<u32>> = (0..batch)
            .map(|b| (0..n_prev).map(|i| (128266 + b * 7 + i) as u32).collect())
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("batch_{batch}_prev_{n_prev}")),
            &rows,
            |b, rows| {
                b.iter(|| {
                    let mask = build_seen_mask(black_box(rows), VOCAB, &device).unwrap();
                    apply_repetition_penalty_with_mask(black_box(&logits), &mask, 1.1).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_eos_suppression(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = patterned_logits(3, VOCAB, &device);

    c.bench_function("suppress_eos", |b| {
        b.iter(|| suppress_token(black_box(&logits), black_box(128258)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_sample_defaults,
    bench_sample_top_p,
    bench_repetition_penalty,
    bench_eos_suppression,
);
criterion_main!(benches);
