//! Generation and sampling utilities for Orpheus TTS
//!
//! This module provides:
//! - Sampling strategies (greedy, top-k, top-p, temperature)
//! - Generation configuration
//! - Per-row repetition penalty
//! - Per-session RNG via [`SamplingContext`] for reproducible generation
//! - Batched generation over left-padded prompts ([`generate_batch`])

mod batch;
mod sampling;

pub use batch::{
    generate_batch, generate_batch_with_progress, prefill_positions, OrpheusLm, TokenGenerator,
};
pub use sampling::{
    apply_repetition_penalty, apply_repetition_penalty_with_mask, build_seen_mask, greedy_sample,
    sample, suppress_token, GenerationConfig, SamplingContext,
};
