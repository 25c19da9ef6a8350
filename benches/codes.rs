//! Benchmarks for prompt framing and code redistribution.
//!
//! Run with: `cargo bench --bench codes`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use orpheus_tts::codes::{extract_code_list, redistribute, TrailingPolicy};
use orpheus_tts::framing::{frame_tokens, pad_batch};
use orpheus_tts::SpecialTokens;
use std::hint::black_box;

/// A generated row: prompt, AUDIO_START, `frames` frames, STOP padding.
fn generated_row(frames: usize, special: &SpecialTokens) -> Vec<u32> {
    let mut row: Vec<u32> = (0..40).collect();
    row.push(special.audio_start);
    row.extend((0..frames * 7).map(|i| {
        special.codebook_offset + (i % 7) as u32 * special.codebook_size + (i % 4096) as u32
    }));
    row.extend([special.stop; 3]);
    row
}

fn bench_extract_and_redistribute(c: &mut Criterion) {
    let special = SpecialTokens::default();
    let mut group = c.benchmark_group("extract_redistribute");

    // 1200 new tokens is ~171 frames
    for frames in [20, 171] {
        let row = generated_row(frames, &special);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &row, |b, row| {
            b.iter(|| {
                let codes =
                    extract_code_list(black_box(row), &special, TrailingPolicy::Truncate, 0)
                        .unwrap();
                redistribute(&codes, special.codebook_size)
            });
        });
    }
    group.finish();
}

fn bench_pad_batch(c: &mut Criterion) {
    let special = SpecialTokens::default();
    let mut group = c.benchmark_group("pad_batch");

    for batch in [3, 32] {
        let framed: Vec<Vec<u32>> = (0..batch)
            .map(|i| {
                let tokens: Vec<u32> = (0..(10 + i * 3) as u32).collect();
                frame_tokens(&tokens, &special)
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(batch), &framed, |b, framed| {
            b.iter(|| pad_batch(black_box(framed.clone()), &special).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_extract_and_redistribute, bench_pad_batch);
criterion_main!(benches);
