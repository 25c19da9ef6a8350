//! SNAC 24 kHz codec decoder
//!
//! Wraps `candle_transformers`' SNAC model. The codec is small and
//! convolutional, so it always runs on the CPU in f32 regardless of where the
//! language model lives.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::snac::{Config as SnacConfig, Model as SnacModel};
use std::path::Path;

use crate::audio::{AudioBuffer, SAMPLE_RATE};
use crate::codes::LayerCodes;

/// Turns three-layer SNAC codes into a waveform.
pub trait CodecDecoder {
    fn decode(&self, codes: &LayerCodes) -> Result<AudioBuffer>;
}

pub struct SnacCodec {
    model: SnacModel,
    codebook_size: u32,
    device: Device,
}

impl SnacCodec {
    /// Load the codec from its `config.json` and safetensors weights.
    pub fn load(config_path: &Path, weights_path: &Path) -> Result<Self> {
        let file = std::fs::File::open(config_path)
            .with_context(|| format!("Failed to open codec config {}", config_path.display()))?;
        let config: SnacConfig = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse codec config {}", config_path.display()))?;

        let device = Device::Cpu;
        let weights = candle_core::safetensors::load(weights_path, &device)
            .with_context(|| format!("Failed to load codec weights {}", weights_path.display()))?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = SnacModel::new(&config, vb)?;

        tracing::info!(
            "Loaded SNAC codec ({} Hz, codebook {})",
            config.sampling_rate,
            config.codebook_size
        );
        Ok(Self {
            model,
            codebook_size: config.codebook_size as u32,
            device,
        })
    }

    pub fn codebook_size(&self) -> u32 {
        self.codebook_size
    }
}

impl CodecDecoder for SnacCodec {
    fn decode(&self, codes: &LayerCodes) -> Result<AudioBuffer> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("snac_decode", frames = codes.num_frames()).entered();

        let [l1, l2, l3] = codes.to_tensors(self.codebook_size, &self.device)?;
        // [1, 1, samples]
        let pcm = self.model.decode(&[&l1, &l2, &l3])?;
        AudioBuffer::from_tensor(pcm, SAMPLE_RATE)
    }
}
