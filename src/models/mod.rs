//! Neural network models for Orpheus TTS
//!
//! - `config`: language model configuration (`config.json`)
//! - `transformer`: RoPE, padded causal mask, attention, MLP, decoder layer
//! - `kv_cache`: per-layer key/value cache
//! - `llama`: the Orpheus causal LM
//! - `snac`: SNAC 24 kHz codec decoder

pub mod config;
pub mod kv_cache;
pub mod llama;
pub mod snac;
pub mod transformer;

pub use config::{OrpheusConfig, RopeScaling};
pub use kv_cache::KVCache;
pub use llama::LlamaModel;
pub use snac::{CodecDecoder, SnacCodec};
pub use transformer::{create_padded_causal_mask, RotaryEmbedding};
