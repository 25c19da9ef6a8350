//! Concatenation-based KV cache for autoregressive generation.

use anyhow::Result;
use candle_core::Tensor;

/// Per-layer key/value cache. Tensors are `[batch, kv_heads, seq, head_dim]`
/// and grow along the sequence dimension.
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    pub(crate) k: Option<Tensor>,
    pub(crate) v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self { k: None, v: None }
    }

    /// Append new keys/values and return the full sequences.
    pub fn update(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = Self::append(&self.k, k)?;
        let v = Self::append(&self.v, v)?;
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    fn append(prev: &Option<Tensor>, new: &Tensor) -> Result<Tensor> {
        Ok(match prev {
            Some(prev) => Tensor::cat(&[prev, new], 2)?,
            None => new.clone(),
        })
    }

    /// Number of cached positions
    pub fn seq_len(&self) -> usize {
        self.k.as_ref().map_or(0, |k| k.dims().get(2).copied().unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Fresh caches for a model with `num_layers` layers.
pub fn new_caches(num_layers: usize) -> Vec<KVCache> {
    (0..num_layers).map(|_| KVCache::new()).collect()
}
