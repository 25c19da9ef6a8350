//! Orpheus causal language model (Llama-3 architecture)
//!
//! Token embedding, a stack of [`DecoderLayer`]s, a final RMS norm and an LM
//! head over the extended vocabulary (text tokens, sentinels and the seven
//! 4096-entry audio code blocks).

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};
use std::collections::HashMap;
use std::path::Path;

use super::config::OrpheusConfig;
use super::kv_cache::{new_caches, KVCache};
use super::transformer::{DecoderLayer, RotaryEmbedding};

pub struct LlamaModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    config: OrpheusConfig,
    device: Device,
}

impl LlamaModel {
    /// Build from a VarBuilder rooted at the checkpoint top level
    /// (`model.*` and optionally `lm_head.*`).
    pub fn new(config: OrpheusConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let model = vb.pp("model");

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, model.pp("embed_tokens"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(&config, model.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(config.hidden_size, config.rms_norm_eps, model.pp("norm"))?;

        // Orpheus ties the head to the embeddings; honour an explicit head if shipped
        let lm_head = if !config.tie_word_embeddings || vb.contains_tensor("lm_head.weight") {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        } else {
            Linear::new(embed_tokens.embeddings().clone(), None)
        };

        let rope = RotaryEmbedding::from_config(&config, &device)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            config,
            device,
        })
    }

    /// Load from pre-loaded weight tensors, casting to `dtype`.
    pub fn from_weights(
        config: OrpheusConfig,
        weights: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights, dtype, device);
        Self::new(config, vb)
    }

    /// Load `config.json` and every safetensors shard.
    pub fn load(
        config_path: &Path,
        weight_paths: &[impl AsRef<Path>],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let config = OrpheusConfig::from_file(config_path)?;
        tracing::info!(
            "LM config: {} layers, hidden {}, {} heads ({} kv), vocab {}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.vocab_size
        );

        let mut weights = HashMap::new();
        for path in weight_paths {
            let path = path.as_ref();
            let shard = candle_core::safetensors::load(path, device)
                .with_context(|| format!("Failed to load weights from {}", path.display()))?;
            tracing::debug!("Loaded {} tensors from {}", shard.len(), path.display());
            weights.extend(shard);
        }

        Self::from_weights(config, weights, dtype, device)
    }

    /// Run `input_ids` (`[batch, seq]`) through the model and return the
    /// logits of the last position as `[batch, vocab]` in f32.
    ///
    /// `positions` is `[batch, seq]`; `attention_mask` is the additive
    /// `[batch, 1, seq, cached + seq]` mask. `caches` holds one entry per
    /// layer and is extended in place.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        positions: &Tensor,
        attention_mask: Option<&Tensor>,
        caches: &mut [KVCache],
    ) -> Result<Tensor> {
        anyhow::ensure!(
            caches.len() == self.layers.len(),
            "expected {} KV caches, got {}",
            self.layers.len(),
            caches.len()
        );
        let seq_len = input_ids.dim(1)?;

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
            hidden = layer.forward(&hidden, &self.rope, positions, attention_mask, Some(cache))?;
        }

        let last = hidden.i((.., seq_len - 1..seq_len, ..))?;
        let last = self.norm.forward(&last)?;
        let logits = self.lm_head.forward(&last)?.squeeze(1)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// One empty cache per layer.
    pub fn new_caches(&self) -> Vec<KVCache> {
        new_caches(self.layers.len())
    }

    pub fn config(&self) -> &OrpheusConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transformer::create_padded_causal_mask;
    use candle_nn::VarMap;

    fn tiny_config() -> OrpheusConfig {
        OrpheusConfig {
            vocab_size: 50,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            max_position_embeddings: 128,
            rope_theta: 10000.0,
            rope_scaling: None,
            rms_norm_eps: 1e-6,
            tie_word_embeddings: true,
        }
    }

    #[test]
    fn test_forward_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LlamaModel::new(tiny_config(), vb).unwrap();
        assert_eq!(model.num_layers(), 2);

        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &device).unwrap();
        let pos = Tensor::new(&[[0u32, 1, 2], [0, 1, 2]], &device).unwrap();
        let mask = create_padded_causal_mask(&[vec![1; 3], vec![1; 3]], 3, &device).unwrap();
        let mut caches = model.new_caches();

        let logits = model.forward(&ids, &pos, Some(&mask), &mut caches).unwrap();
        assert_eq!(logits.dims(), &[2, 50]);
        assert_eq!(logits.dtype(), DType::F32);
        assert!(caches.iter().all(|c| c.seq_len() == 3));
    }

    #[test]
    fn test_tied_head_shares_embedding() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = LlamaModel::new(tiny_config(), vb).unwrap();
        // No separate head weight was created
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(!names.iter().any(|n| n.starts_with("lm_head")));
    }

    #[test]
    fn test_untied_head() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = OrpheusConfig {
            tie_word_embeddings: false,
            ..tiny_config()
        };
        let _model = LlamaModel::new(config, vb).unwrap();
        assert!(varmap.data().lock().unwrap().contains_key("lm_head.weight"));
    }

    #[test]
    fn test_cache_count_mismatch() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LlamaModel::new(tiny_config(), vb).unwrap();

        let ids = Tensor::new(&[[1u32]], &device).unwrap();
        let mut caches = vec![KVCache::new()];
        assert!(model.forward(&ids, &ids, None, &mut caches).is_err());
    }
}
