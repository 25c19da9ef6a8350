//! Model configuration for the Orpheus language model
//!
//! Parsed from the checkpoint's `config.json` (HuggingFace `LlamaConfig`
//! layout). Defaults match `canopylabs/orpheus-3b-0.1-ft`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Llama-3 RoPE frequency scaling (`rope_scaling` with `rope_type: "llama3"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    #[serde(default = "default_rope_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default = "default_rope_type", alias = "type")]
    pub rope_type: String,
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self {
            factor: default_rope_factor(),
            low_freq_factor: default_low_freq_factor(),
            high_freq_factor: default_high_freq_factor(),
            original_max_position_embeddings: default_original_max_position_embeddings(),
            rope_type: default_rope_type(),
        }
    }
}

impl RopeScaling {
    /// Whether this is the llama3 scheme (the only one applied)
    pub fn is_llama3(&self) -> bool {
        self.rope_type == "llama3"
    }
}

/// Orpheus language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrpheusConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Intermediate size in MLP
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Explicit head dimension; otherwise hidden_size / num_attention_heads
    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RoPE theta base
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Share the embedding matrix with the LM head
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

fn default_rope_factor() -> f64 {
    32.0
}
fn default_low_freq_factor() -> f64 {
    1.0
}
fn default_high_freq_factor() -> f64 {
    4.0
}
fn default_original_max_position_embeddings() -> usize {
    8192
}
fn default_rope_type() -> String {
    "llama3".to_string()
}
fn default_vocab_size() -> usize {
    156940
}
fn default_hidden_size() -> usize {
    3072
}
fn default_intermediate_size() -> usize {
    8192
}
fn default_num_hidden_layers() -> usize {
    28
}
fn default_num_attention_heads() -> usize {
    24
}
fn default_max_position_embeddings() -> usize {
    131072
}
fn default_rope_theta() -> f64 {
    500000.0
}
fn default_rms_norm_eps() -> f64 {
    1e-5
}
fn default_tie_word_embeddings() -> bool {
    true
}

impl Default for OrpheusConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: Some(8),
            head_dim: Some(128),
            max_position_embeddings: default_max_position_embeddings(),
            rope_theta: default_rope_theta(),
            rope_scaling: Some(RopeScaling::default()),
            rms_norm_eps: default_rms_norm_eps(),
            tie_word_embeddings: default_tie_word_embeddings(),
        }
    }
}

impl OrpheusConfig {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Get number of key-value heads, defaulting to num_attention_heads if not set
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Llama-3 frequency scaling, if configured
    pub fn llama3_scaling(&self) -> Option<&RopeScaling> {
        self.rope_scaling.as_ref().filter(|s| s.is_llama3())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_orpheus_3b() {
        let config = OrpheusConfig::default();
        assert_eq!(config.vocab_size, 156940);
        assert_eq!(config.hidden_size, 3072);
        assert_eq!(config.num_hidden_layers, 28);
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.head_dim(), 128);
        assert!((config.rope_theta - 500000.0).abs() < 1e-6);
        assert!(config.tie_word_embeddings);
        assert!(config.llama3_scaling().is_some());
    }

    #[test]
    fn test_parse_hf_llama_config() {
        let json = r#"{
            "architectures": ["LlamaForCausalLM"],
            "bos_token_id": 128000,
            "eos_token_id": 128009,
            "head_dim": 128,
            "hidden_act": "silu",
            "hidden_size": 3072,
            "intermediate_size": 8192,
            "max_position_embeddings": 131072,
            "model_type": "llama",
            "num_attention_heads": 24,
            "num_hidden_layers": 28,
            "num_key_value_heads": 8,
            "rms_norm_eps": 1e-05,
            "rope_scaling": {
                "factor": 32.0,
                "high_freq_factor": 4.0,
                "low_freq_factor": 1.0,
                "original_max_position_embeddings": 8192,
                "rope_type": "llama3"
            },
            "rope_theta": 500000.0,
            "tie_word_embeddings": true,
            "torch_dtype": "bfloat16",
            "vocab_size": 156940
        }"#;
        let config: OrpheusConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_attention_heads, 24);
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.rope_scaling, Some(RopeScaling::default()));
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let config: OrpheusConfig =
            serde_json::from_str(r#"{"hidden_size": 64, "num_attention_heads": 4}"#).unwrap();
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.num_kv_heads(), 4);
        assert!(config.rope_scaling.is_none());
        assert!(config.llama3_scaling().is_none());
    }

    #[test]
    fn test_non_llama3_scaling_is_ignored() {
        let config: OrpheusConfig = serde_json::from_str(
            r#"{"rope_scaling": {"type": "linear", "factor": 2.0}}"#,
        )
        .unwrap();
        assert!(config.rope_scaling.is_some());
        assert!(config.llama3_scaling().is_none());
    }

    #[test]
    fn test_from_file_nonexistent() {
        assert!(OrpheusConfig::from_file("/nonexistent/config.json").is_err());
    }
}
