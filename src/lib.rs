//! # Orpheus TTS
//!
//! Pure Rust inference for [Orpheus](https://github.com/canopyai/Orpheus-TTS),
//! a Llama-3 based text-to-speech model that speaks through the
//! [SNAC](https://github.com/hubertsiuzdak/snac) 24 kHz neural codec.
//!
//! ## Features
//!
//! - **CPU inference** with optional MKL/Accelerate for faster BLAS operations
//! - **CUDA** support for NVIDIA GPU acceleration
//! - **Metal** support for Apple Silicon
//! - **Batched generation** over left-padded prompts with per-row positions
//! - **Hub download** of the gated checkpoint with an explicit access token
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orpheus_tts::{auto_device, hub::{HubCredential, HubOptions}, OrpheusTTS, SynthesisOptions};
//!
//! let device = auto_device()?;
//! let options = HubOptions::new(HubCredential::new(token)?);
//! let tts = OrpheusTTS::from_pretrained(&options, device)?;
//!
//! let audio = tts.synthesize_batch("tara", &["Hey there, how are you?"], &SynthesisOptions::default())?;
//! audio[0].save("sample_1.wav")?;
//! ```
//!
//! ## Pipeline
//!
//! 1. **Framing** ([`framing`]): each text becomes
//!    `START "voice: text" END_OF_TEXT END_OF_HUMAN`, left-padded into a batch.
//! 2. **Generation** ([`generation`]): the causal LM samples audio tokens
//!    until every row emits STOP.
//! 3. **Redistribution** ([`codes`]): the audio tokens after the last
//!    AUDIO_START are turned into 7-token frames and split over the three
//!    SNAC codebook layers.
//! 4. **Decoding** ([`models::snac`]): SNAC turns the codes into 24 kHz mono
//!    audio.

pub mod audio;
pub mod codes;
pub mod error;
pub mod framing;
pub mod generation;
pub mod hub;
pub mod models;
pub mod profiling;
pub mod tokenizer;
pub mod tokens;

use anyhow::Result;
use candle_core::{DType, Device};
use std::time::Instant;

use codes::{extract_code_list, redistribute, TrailingPolicy};
use generation::{GenerationConfig, OrpheusLm, SamplingContext, TokenGenerator};
use models::{CodecDecoder, LlamaModel, SnacCodec};
use tokenizer::TextTokenizer;

pub use audio::{AudioBuffer, SAMPLE_RATE};
pub use error::OrpheusError;
pub use hub::ModelPaths;
pub use models::OrpheusConfig;
pub use tokens::SpecialTokens;

/// Voice used when none is given.
pub const DEFAULT_VOICE: &str = "tara";

/// Options for speech synthesis
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Sampling and stopping parameters
    pub generation: GenerationConfig,
    /// Random seed for deterministic generation. `None` = non-deterministic.
    pub seed: Option<u64>,
    /// What to do with a trailing partial frame or a missing AUDIO_START
    pub trailing_policy: TrailingPolicy,
    /// Sentinel ids used for framing and extraction
    pub special_tokens: SpecialTokens,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            seed: None,
            trailing_policy: TrailingPolicy::default(),
            special_tokens: SpecialTokens::default(),
        }
    }
}

/// Run the whole pipeline with explicit components.
///
/// Rows are decoded in prompt order; the i-th buffer belongs to `texts[i]`.
/// A row without a single complete frame fails with
/// [`OrpheusError::NoAudioCodes`].
pub fn synthesize_with<G, D, S>(
    generator: &G,
    decoder: &D,
    tokenizer: &TextTokenizer,
    voice: &str,
    texts: &[S],
    options: &SynthesisOptions,
    on_step: &mut dyn FnMut(usize),
) -> Result<Vec<AudioBuffer>>
where
    G: TokenGenerator + ?Sized,
    D: CodecDecoder + ?Sized,
    S: AsRef<str>,
{
    let special = &options.special_tokens;
    let batch = framing::frame_prompts(tokenizer, voice, texts, special)?;
    tracing::info!(
        "Generating {} prompt(s) for voice '{}' (prompt length {})",
        batch.batch_size(),
        voice,
        batch.max_length()
    );

    let mut ctx = SamplingContext::new(options.seed);
    let start = Instant::now();
    let rows = generator.generate_with_progress(&batch, &options.generation, &mut ctx, on_step)?;
    let gen_elapsed = start.elapsed();
    let new_tokens = rows
        .first()
        .map_or(0, |r| r.len().saturating_sub(batch.max_length()));
    tracing::info!(
        "Generated {} tokens per row in {:.2}s",
        new_tokens,
        gen_elapsed.as_secs_f64()
    );

    let start = Instant::now();
    let mut outputs = Vec::with_capacity(rows.len());
    for (row_idx, row) in rows.iter().enumerate() {
        let code_list = extract_code_list(row, special, options.trailing_policy, row_idx)?;
        if code_list.num_frames() == 0 {
            return Err(OrpheusError::NoAudioCodes { row: row_idx }.into());
        }
        let layers = redistribute(&code_list, special.codebook_size);
        let audio = decoder.decode(&layers)?;
        tracing::debug!(
            row = row_idx,
            frames = code_list.num_frames(),
            samples = audio.len(),
            "Decoded row"
        );
        outputs.push(audio);
    }
    tracing::info!(
        "Decoded {} row(s) in {:.2}s",
        outputs.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(outputs)
}

/// Check every sentinel against the tokenizer's vocabulary.
fn check_tokenizer_sentinels(tokenizer: &TextTokenizer, special: &SpecialTokens) -> Result<()> {
    for (name, id) in special.named() {
        if tokenizer.id_to_token(id).is_none() {
            return Err(OrpheusError::SentinelOutOfVocab {
                name,
                id,
                vocab_size: tokenizer.vocab_size(),
            }
            .into());
        }
    }
    Ok(())
}

/// Main Orpheus TTS pipeline
pub struct OrpheusTTS {
    lm: OrpheusLm,
    codec: SnacCodec,
    tokenizer: TextTokenizer,
    device: Device,
}

impl OrpheusTTS {
    /// Download (or reuse the cached) checkpoint and codec, then load them.
    #[cfg(feature = "hub")]
    pub fn from_pretrained(options: &hub::HubOptions, device: Device) -> Result<Self> {
        let paths = ModelPaths::download(options)?;
        Self::from_paths(&paths, device)
    }

    /// Load from local files.
    ///
    /// The LM runs on `device` (bf16 on GPUs, f32 on CPU); the codec always
    /// runs on the CPU.
    pub fn from_paths(paths: &ModelPaths, device: Device) -> Result<Self> {
        let dtype = compute_dtype_for_device(&device);
        tracing::info!(
            "Loading Orpheus LM on {} ({:?})",
            device_info(&device),
            dtype
        );
        let model = LlamaModel::load(&paths.config, &paths.weights, dtype, &device)?;
        let tokenizer = TextTokenizer::from_file(&paths.tokenizer)?;
        let codec = SnacCodec::load(&paths.codec_config, &paths.codec_weights)?;

        Self::from_components(OrpheusLm::new(model), codec, tokenizer, device)
    }

    /// Assemble from already-loaded components, validating the default
    /// sentinels against both vocabularies.
    pub fn from_components(
        lm: OrpheusLm,
        codec: SnacCodec,
        tokenizer: TextTokenizer,
        device: Device,
    ) -> Result<Self> {
        let special = SpecialTokens::default();
        special.validate(lm.vocab_size())?;
        check_tokenizer_sentinels(&tokenizer, &special)?;
        if codec.codebook_size() != special.codebook_size {
            tracing::warn!(
                "Codec codebook size {} differs from the LM's {}",
                codec.codebook_size(),
                special.codebook_size
            );
        }

        Ok(Self {
            lm,
            codec,
            tokenizer,
            device,
        })
    }

    /// Synthesize one waveform per text, all in `voice`.
    pub fn synthesize_batch<S: AsRef<str>>(
        &self,
        voice: &str,
        texts: &[S],
        options: &SynthesisOptions,
    ) -> Result<Vec<AudioBuffer>> {
        self.synthesize_batch_with_progress(voice, texts, options, &mut |_| {})
    }

    /// Like [`synthesize_batch`](Self::synthesize_batch), reporting each
    /// generation step to `on_step`.
    pub fn synthesize_batch_with_progress<S: AsRef<str>>(
        &self,
        voice: &str,
        texts: &[S],
        options: &SynthesisOptions,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<AudioBuffer>> {
        options.special_tokens.validate(self.lm.vocab_size())?;
        synthesize_with(
            &self.lm,
            &self.codec,
            &self.tokenizer,
            voice,
            texts,
            options,
            on_step,
        )
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &OrpheusConfig {
        self.lm.model().config()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Return the recommended compute dtype for the given device.
///
/// Returns `BF16` for CUDA/Metal (the checkpoint's native dtype) and `F32` for CPU.
pub fn compute_dtype_for_device(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::BF16
    } else {
        DType::F32
    }
}

/// Select the best available compute device for inference.
///
/// Checks for available hardware in order: CUDA, Metal, CPU.
/// Falls back to CPU if no GPU acceleration is available.
///
/// # Feature Flags
///
/// - `cuda`: Enables NVIDIA GPU support
/// - `metal`: Enables Apple Silicon GPU support
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats:
/// - `"auto"`: best available via [`auto_device`]
/// - `"cpu"`: force CPU
/// - `"cuda"` or `"cuda:N"`: CUDA device 0 or N
/// - `"metal"`: Apple Silicon GPU
///
/// # Errors
///
/// Returns an error if the device string is unrecognized, the requested
/// backend wasn't compiled in, or hardware initialization fails.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = if s == "cuda" {
                    0
                } else if let Some(idx) = s.strip_prefix("cuda:") {
                    idx.parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?
                } else {
                    0
                };
                Device::cuda_if_available(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in. Rebuild with: cargo build --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!(
                "Metal support not compiled in. Rebuild with: cargo build --features metal"
            )
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
