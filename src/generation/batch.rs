//! Batched autoregressive generation over a left-padded prompt batch
//!
//! Every row keeps its own position counter and attention mask, so a padded
//! row produces the same continuation it would produce alone (given the same
//! random draws). Rows that emit EOS keep being fed EOS until the whole batch
//! is done.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::error::OrpheusError;
use crate::framing::PaddedBatch;
use crate::models::{create_padded_causal_mask, LlamaModel};

use super::sampling::{
    apply_repetition_penalty_with_mask, build_seen_mask, sample, suppress_token,
    GenerationConfig, SamplingContext,
};

/// Anything that turns a framed prompt batch into full token rows.
///
/// Returned rows are the prompt (with its padding) followed by the
/// generated tokens; all rows have the same length.
pub trait TokenGenerator {
    /// Generate, calling `on_step` with the number of tokens produced so far.
    fn generate_with_progress(
        &self,
        batch: &PaddedBatch,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<Vec<u32>>>;

    fn generate(
        &self,
        batch: &PaddedBatch,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<Vec<Vec<u32>>> {
        self.generate_with_progress(batch, config, ctx, &mut |_| {})
    }

    /// Size of the output vocabulary
    fn vocab_size(&self) -> usize;
}

/// The Orpheus language model as a [`TokenGenerator`].
pub struct OrpheusLm {
    model: LlamaModel,
}

impl OrpheusLm {
    pub fn new(model: LlamaModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }
}

impl TokenGenerator for OrpheusLm {
    fn generate_with_progress(
        &self,
        batch: &PaddedBatch,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<Vec<u32>>> {
        generate_batch_with_progress(&self.model, batch, config, ctx, on_step)
    }

    fn vocab_size(&self) -> usize {
        self.model.config().vocab_size
    }
}

/// Prefill position ids: the running count of real tokens minus one, with
/// padding positions pinned to 1.
pub fn prefill_positions(attention_mask: &[Vec<u32>]) -> Vec<Vec<u32>> {
    attention_mask
        .iter()
        .map(|row| {
            let mut seen = 0u32;
            row.iter()
                .map(|&m| {
                    if m != 0 {
                        seen += 1;
                        seen - 1
                    } else {
                        1
                    }
                })
                .collect()
        })
        .collect()
}

/// Generate for every row of `batch` without progress reporting.
pub fn generate_batch(
    model: &LlamaModel,
    batch: &PaddedBatch,
    config: &GenerationConfig,
    ctx: &mut SamplingContext,
) -> Result<Vec<Vec<u32>>> {
    generate_batch_with_progress(model, batch, config, ctx, &mut |_| {})
}

/// Generate for every row of `batch`.
///
/// The whole batch is prefilled at once, then one token per row is sampled
/// per step. Stops when every row has produced EOS or after
/// `max_new_tokens` steps.
pub fn generate_batch_with_progress(
    model: &LlamaModel,
    batch: &PaddedBatch,
    config: &GenerationConfig,
    ctx: &mut SamplingContext,
    on_step: &mut dyn FnMut(usize),
) -> Result<Vec<Vec<u32>>> {
    let batch_size = batch.batch_size();
    if batch_size == 0 {
        return Err(OrpheusError::EmptyBatch.into());
    }
    let device = model.device();
    let vocab_size = model.config().vocab_size;
    let prompt_len = batch.max_length();

    let mut rows = batch.input_ids.clone();
    let mut key_mask = batch.attention_mask.clone();
    let mut next_positions: Vec<u32> = batch.real_lengths().iter().map(|&n| n as u32).collect();
    let mut finished = vec![false; batch_size];

    // seen-token mask for the repetition penalty, covering prompt and padding
    let mut seen = if config.repetition_penalty != 1.0 {
        let mask: Vec<Vec<u8>> = build_seen_mask(&rows, vocab_size, &Device::Cpu)?.to_vec2()?;
        Some(mask)
    } else {
        None
    };

    let mut caches = model.new_caches();

    #[cfg(feature = "profiling")]
    let prefill_span = tracing::info_span!("prefill", rows = batch_size, len = prompt_len).entered();

    let (input_ids, _) = batch.to_tensors(device)?;
    let positions: Vec<u32> = prefill_positions(&batch.attention_mask)
        .into_iter()
        .flatten()
        .collect();
    let positions = Tensor::from_vec(positions, (batch_size, prompt_len), device)?;
    let mask = create_padded_causal_mask(&key_mask, prompt_len, device)?;
    let mut logits = model.forward(&input_ids, &positions, Some(&mask), &mut caches)?;

    #[cfg(feature = "profiling")]
    drop(prefill_span);

    tracing::debug!(rows = batch_size, prompt_len, "Prefill done");

    for step in 0..config.max_new_tokens {
        #[cfg(feature = "profiling")]
        let _step_span = tracing::info_span!("decode_step", step).entered();

        let mut step_logits = logits;
        if let Some(seen) = &seen {
            let flat: Vec<u8> = seen.iter().flatten().copied().collect();
            let mask = Tensor::from_vec(flat, (batch_size, vocab_size), device)?;
            step_logits =
                apply_repetition_penalty_with_mask(&step_logits, &mask, config.repetition_penalty)?;
        }
        if let Some(eos) = config.eos_token_id {
            if step < config.min_new_tokens {
                step_logits = suppress_token(&step_logits, eos)?;
            }
        }

        let sampled: Vec<u32> = sample(&step_logits, config, ctx)?.to_vec1()?;

        let mut next_tokens = Vec::with_capacity(batch_size);
        for (b, &token) in sampled.iter().enumerate() {
            let token = match config.eos_token_id {
                Some(eos) if finished[b] => eos,
                _ => token,
            };
            if config.eos_token_id == Some(token) {
                finished[b] = true;
            }
            rows[b].push(token);
            key_mask[b].push(1);
            if let Some(seen) = seen.as_mut() {
                if (token as usize) < vocab_size {
                    seen[b][token as usize] = 1;
                }
            }
            next_tokens.push(token);
        }
        on_step(step + 1);

        if finished.iter().all(|&f| f) {
            tracing::debug!(steps = step + 1, "All rows reached EOS");
            break;
        }
        if step + 1 == config.max_new_tokens {
            tracing::debug!(steps = step + 1, "Reached max_new_tokens");
            break;
        }

        let input_ids = Tensor::from_vec(next_tokens, (batch_size, 1), device)?;
        let positions = Tensor::from_vec(next_positions.clone(), (batch_size, 1), device)?;
        for p in next_positions.iter_mut() {
            *p += 1;
        }
        let mask = create_padded_causal_mask(&key_mask, 1, device)?;
        logits = model.forward(&input_ids, &positions, Some(&mask), &mut caches)?;
    }

    Ok(rows)
}
