//! Token sampling strategies for autoregressive generation
//!
//! Supports both deterministic (seeded) and non-deterministic random sampling.
//! Create a [`SamplingContext`] with an optional seed for reproducible outputs.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};

use crate::tokens::ids;

/// RNG state for a single generation session.
///
/// # Determinism
///
/// When created with a seed, the same seed produces identical output
/// across runs and threads. Without a seed, the generator is seeded once
/// from the system clock.
pub struct SamplingContext {
    /// PCG state
    state: u64,
}

impl SamplingContext {
    /// Create a new sampling context with an optional seed.
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        });
        let mut ctx = Self { state: 0 };
        ctx.reset(seed);
        ctx
    }

    /// Reset the RNG to the state `SamplingContext::new(Some(seed))` starts in.
    pub fn reset(&mut self, seed: u64) {
        // Mix seed with PCG increment to avoid degenerate states
        self.state = seed
            .wrapping_mul(2685821657736338717)
            .wrapping_add(1442695040888963407);
    }

    /// Generate a random f32 in [0, 1).
    pub(crate) fn rand_f32(&mut self) -> f32 {
        // PCG XSH RR 64/32
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);

        // top 24 bits so the result is exactly representable and below 1.0
        (output >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// Configuration for autoregressive generation
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,
    /// Sampling temperature (1.0 = no change, <1.0 = more focused, >1.0 = more random)
    pub temperature: f64,
    /// Top-k sampling (0 = disabled)
    pub top_k: usize,
    /// Top-p (nucleus) sampling threshold (1.0 = disabled)
    pub top_p: f64,
    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f64,
    /// End-of-sequence token ID (a row finishes when it samples this token)
    pub eos_token_id: Option<u32>,
    /// Minimum number of tokens before EOS is allowed
    pub min_new_tokens: usize,
    /// Sample from the distribution; `false` means greedy decoding
    pub do_sample: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1200,
            temperature: 0.6,
            top_k: 50,
            top_p: 0.95,
            repetition_penalty: 1.1,
            eos_token_id: Some(ids::STOP),
            min_new_tokens: 0,
            do_sample: true,
        }
    }
}

/// Sample next token from logits
///
/// # Arguments
/// * `logits` - Logits tensor of shape [batch, vocab_size]
/// * `config` - Generation configuration
/// * `ctx` - Sampling context (owns RNG state)
///
/// # Returns
/// Token indices of shape `[batch]`
pub fn sample(
    logits: &Tensor,
    config: &GenerationConfig,
    ctx: &mut SamplingContext,
) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;

    if !config.do_sample || config.temperature < 0.01 {
        return greedy_sample(&logits);
    }

    let logits = if config.temperature != 1.0 {
        (logits / config.temperature)?
    } else {
        logits
    };

    let logits = if config.top_k > 0 {
        top_k_filter(&logits, config.top_k)?
    } else {
        logits
    };

    let logits = if config.top_p < 1.0 && config.top_p > 0.0 {
        top_p_filter(&logits, config.top_p)?
    } else {
        logits
    };

    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    multinomial_sample(&probs, ctx)
}

/// Apply top-k filtering: keep only the top k logits, set rest to -inf
///
/// Dispatches between CPU-native Rust sort and GPU tensor sort.
fn top_k_filter(logits: &Tensor, k: usize) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_k").entered();
    let (batch, vocab) = logits.dims2()?;
    let k = k.min(vocab);

    if logits.device().is_cpu() {
        // native partial sort beats candle's sort_last_dim on CPU
        let mut result_data = Vec::with_capacity(batch * vocab);
        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut sorted = row.clone();
            let (_, threshold, _) = sorted.select_nth_unstable_by(k - 1, |a, b| {
                b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal)
            });
            let threshold = *threshold;
            result_data.extend(
                row.iter()
                    .map(|&v| if v >= threshold { v } else { f32::NEG_INFINITY }),
            );
        }
        Ok(Tensor::from_vec(result_data, (batch, vocab), logits.device())?)
    } else {
        let (sorted, _) = logits.sort_last_dim(false)?;
        let threshold = sorted.narrow(1, k - 1, 1)?;
        let mask = logits.ge(&threshold.broadcast_as(logits.shape())?)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(mask.where_cond(logits, &neg_inf)?)
    }
}

/// Apply top-p (nucleus) filtering: keep the smallest set of tokens whose
/// cumulative probability exceeds `p`. The most likely token always survives.
fn top_p_filter(logits: &Tensor, p: f64) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_p").entered();

    if logits.device().is_cpu() {
        let (batch, vocab) = logits.dims2()?;
        let mut result_data = Vec::with_capacity(batch * vocab);

        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut indices: Vec<usize> = (0..vocab).collect();
            indices.sort_unstable_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            // Softmax over sorted values
            let max_val = row[indices[0]];
            let mut exp_sorted: Vec<f32> =
                indices.iter().map(|&i| (row[i] - max_val).exp()).collect();
            let sum: f32 = exp_sorted.iter().sum();
            for v in &mut exp_sorted {
                *v /= sum;
            }

            let mut cumsum = 0.0f32;
            let mut cutoff_idx = vocab;
            for (i, &prob) in exp_sorted.iter().enumerate() {
                cumsum += prob;
                if cumsum > p as f32 {
                    cutoff_idx = i + 1;
                    break;
                }
            }

            let mut filtered = vec![f32::NEG_INFINITY; vocab];
            for &idx in &indices[..cutoff_idx] {
                filtered[idx] = row[idx];
            }
            result_data.extend(filtered);
        }

        Ok(Tensor::from_vec(result_data, (batch, vocab), logits.device())?)
    } else {
        let (sorted_logits, _) = logits.sort_last_dim(false)?;
        let sorted_probs = candle_nn::ops::softmax_last_dim(&sorted_logits)?;
        let cumulative_probs = sorted_probs.cumsum(1)?;

        // probability mass strictly before each sorted position
        let shifted = cumulative_probs.narrow(1, 0, cumulative_probs.dim(1)? - 1)?;
        let zeros = Tensor::zeros((logits.dim(0)?, 1), DType::F32, logits.device())?;
        let shifted_cumsum = Tensor::cat(&[&zeros, &shifted], 1)?;

        let threshold_val =
            Tensor::new(&[p as f32], logits.device())?.broadcast_as(shifted_cumsum.shape())?;
        let remove_mask = shifted_cumsum.gt(&threshold_val)?;

        let pos_inf =
            Tensor::new(&[f32::INFINITY], logits.device())?.broadcast_as(sorted_logits.shape())?;
        let kept_logits = remove_mask.where_cond(&pos_inf, &sorted_logits)?;
        let min_kept = kept_logits.min(D::Minus1)?.unsqueeze(1)?;

        let keep_original = logits.ge(&min_kept.broadcast_as(logits.shape())?)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(keep_original.where_cond(logits, &neg_inf)?)
    }
}

/// Sample from probability distribution using multinomial sampling
fn multinomial_sample(probs: &Tensor, ctx: &mut SamplingContext) -> Result<Tensor> {
    let (batch, vocab) = probs.dims2()?;

    let cumsum = probs.cumsum(1)?;
    // Scale the draw by each row's total so rounding never leaves it past the end
    let totals = cumsum.narrow(1, vocab - 1, 1)?;

    let uniform: Vec<f32> = (0..batch).map(|_| ctx.rand_f32()).collect();
    let uniform = Tensor::from_vec(uniform, (batch, 1), probs.device())?.mul(&totals)?;

    // First index where cumsum > u
    let mask = cumsum.gt(&uniform.broadcast_as(cumsum.shape())?)?;

    let positions: Vec<f32> = (0..vocab).map(|i| i as f32).collect();
    let positions = Tensor::new(positions.as_slice(), probs.device())?
        .unsqueeze(0)?
        .broadcast_as(mask.shape())?;
    let large = Tensor::new(&[vocab as f32], probs.device())?.broadcast_as(mask.shape())?;
    let masked_positions = mask.where_cond(&positions, &large)?;

    // argmin picks the first qualifying position; clamp the all-false case
    let picked = masked_positions.argmin(D::Minus1)?;
    Ok(picked.minimum(&Tensor::new(&[(vocab - 1) as u32], probs.device())?.broadcast_as(batch)?)?)
}

/// Build a `[batch, vocab]` 0/1 mask of the tokens each row has seen.
///
/// Ids outside the vocabulary are ignored.
pub fn build_seen_mask(
    rows: &[Vec<u32>],
    vocab: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let mut data = vec![0u8; rows.len() * vocab];
    for (b, row) in rows.iter().enumerate() {
        for &tid in row {
            let idx = tid as usize;
            if idx < vocab {
                data[b * vocab + idx] = 1;
            }
        }
    }
    Ok(Tensor::from_vec(data, (rows.len(), vocab), device)?)
}

/// Apply repetition penalty to logits
///
/// Every row is penalized by every id in `input_ids` (any shape).
pub fn apply_repetition_penalty(
    logits: &Tensor,
    input_ids: &Tensor,
    penalty: f64,
) -> Result<Tensor> {
    if (penalty - 1.0).abs() < 1e-9 {
        return Ok(logits.clone());
    }
    let (batch, vocab) = logits.dims2()?;
    let ids: Vec<u32> = input_ids.flatten_all()?.to_vec1()?;
    let rows = vec![ids; batch];
    let mask = build_seen_mask(&rows, vocab, logits.device())?;
    apply_repetition_penalty_with_mask(logits, &mask, penalty)
}

/// Apply repetition penalty from a per-row mask of seen tokens.
///
/// `penalty_mask` is `[batch, vocab]` (or broadcastable to it), nonzero where
/// the token already occurs in that row. Positive logits are divided by
/// `penalty`, negative ones multiplied.
pub fn apply_repetition_penalty_with_mask(
    logits: &Tensor,
    penalty_mask: &Tensor,
    penalty: f64,
) -> Result<Tensor> {
    if (penalty - 1.0).abs() < 1e-9 {
        return Ok(logits.clone());
    }

    let penalty_f32 = penalty as f32;
    let logits = logits.to_dtype(DType::F32)?;
    let penalty_mask = penalty_mask.broadcast_as(logits.shape())?;

    let zeros = logits.zeros_like()?;
    let is_positive = logits.gt(&zeros)?;
    let pos_factor =
        Tensor::new(&[1.0 / penalty_f32], logits.device())?.broadcast_as(logits.shape())?;
    let neg_factor = Tensor::new(&[penalty_f32], logits.device())?.broadcast_as(logits.shape())?;
    let penalty_factor = is_positive.where_cond(&pos_factor, &neg_factor)?;

    let ones = logits.ones_like()?;
    let is_penalized = penalty_mask.ne(0u8)?;
    let final_factor = is_penalized.where_cond(&penalty_factor, &ones)?;

    Ok((logits * final_factor)?)
}

/// Set one token's logit to -inf in every row.
pub fn suppress_token(logits: &Tensor, token: u32) -> Result<Tensor> {
    let (batch, vocab) = logits.dims2()?;
    let idx = token as usize;
    if idx >= vocab {
        return Ok(logits.clone());
    }
    let mut mask = vec![0u8; vocab];
    mask[idx] = 1;
    let mask = Tensor::from_vec(mask, (1, vocab), logits.device())?.broadcast_as((batch, vocab))?;
    let neg_inf = Tensor::new(&[f32::NEG_INFINITY], logits.device())?
        .to_dtype(logits.dtype())?
        .broadcast_as((batch, vocab))?;
    Ok(mask.where_cond(&neg_inf, logits)?)
}

/// Greedy sampling (argmax)
pub fn greedy_sample(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax(D::Minus1)?)
}
