//! Command-line speech synthesis with Orpheus
//!
//! Downloads the gated checkpoint (or uses a local directory), generates all
//! prompts as one padded batch and writes `sample_{i}.wav` files.
//!
//! Usage:
//!     HUGGINGFACE_TOKEN=hf_... cargo run --release --bin orpheus
//!     cargo run --release --bin orpheus -- --model-dir ./orpheus --voice leo "Hello there"

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use orpheus_tts::codes::TrailingPolicy;
use orpheus_tts::generation::GenerationConfig;
use orpheus_tts::hub::{model_ids, DownloadConfig, HubCredential, HubOptions};
use orpheus_tts::{
    audio, device_info, parse_device, ModelPaths, OrpheusTTS, SynthesisOptions, DEFAULT_VOICE,
};

const DEMO_PROMPTS: [&str; 3] = [
    "Hey there my name is Christina, <chuckle> and I'm a speech generation model that can sound like a person.",
    "I've also been taught to understand and produce special paralinguistic things like sighing, or chuckling, or yawning!",
    "I live in Bielefeld Germany, and have, uhm let's see, 3 billion 7 hundred ... well, lets just say a lot of parameters.",
];

/// Synthesize speech from text with Orpheus and SNAC
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Texts to speak, one WAV file each (defaults to three demo lines)
    prompts: Vec<String>,

    /// Voice name prefixed to every prompt
    #[arg(long, default_value = DEFAULT_VOICE)]
    voice: String,

    /// HuggingFace model repository
    #[arg(long, default_value = model_ids::ORPHEUS)]
    model_id: String,

    /// Use a local model directory instead of downloading
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Revision of the model repository
    #[arg(long, default_value = "main")]
    revision: String,

    /// HuggingFace access token
    #[arg(long, env = "HUGGINGFACE_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Total download attempts per file
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Directory for the generated WAV files
    #[arg(short, long, default_value = "generated_audio")]
    output_dir: PathBuf,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,

    /// Random seed (omit for a fresh seed every run)
    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(long, default_value_t = 1200)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 0.6)]
    temperature: f64,

    /// Top-p (nucleus) threshold
    #[arg(long, default_value_t = 0.95)]
    top_p: f64,

    /// Top-k (0 disables)
    #[arg(long, default_value_t = 50)]
    top_k: usize,

    #[arg(long, default_value_t = 1.1)]
    repetition_penalty: f64,

    /// Greedy decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    /// Fail on a partial trailing frame or a missing AUDIO_START
    #[arg(long)]
    strict: bool,

    /// Write a Chrome trace to this file (needs the `profiling` feature)
    #[arg(long)]
    trace: Option<PathBuf>,
}

impl Args {
    fn synthesis_options(&self) -> SynthesisOptions {
        SynthesisOptions {
            generation: GenerationConfig {
                max_new_tokens: self.max_new_tokens,
                temperature: self.temperature,
                top_k: self.top_k,
                top_p: self.top_p,
                repetition_penalty: self.repetition_penalty,
                do_sample: !self.greedy,
                ..Default::default()
            },
            seed: self.seed,
            trailing_policy: if self.strict {
                TrailingPolicy::Reject
            } else {
                TrailingPolicy::Truncate
            },
            ..Default::default()
        }
    }

    fn prompts(&self) -> Vec<String> {
        if self.prompts.is_empty() {
            DEMO_PROMPTS.iter().map(|p| p.to_string()).collect()
        } else {
            self.prompts.clone()
        }
    }

    fn model_paths(&self) -> Result<ModelPaths> {
        if let Some(dir) = &self.model_dir {
            tracing::info!("Using local model directory {}", dir.display());
            return Ok(ModelPaths::from_dir(dir)?);
        }

        let credential = HubCredential::from_option(self.hf_token.clone())?;
        let mut options = HubOptions::new(credential);
        options.model_id = self.model_id.clone();
        options.download = DownloadConfig {
            revision: self.revision.clone(),
            max_attempts: self.max_attempts,
            ..Default::default()
        };
        Ok(ModelPaths::download(&options)?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _profiling_guard = args.trace.as_ref().and_then(orpheus_tts::profiling::init);
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
        if args.trace.is_some() {
            tracing::warn!("--trace ignored: built without the `profiling` feature");
        }
    }

    let device = parse_device(&args.device)?;
    tracing::info!("Device: {}", device_info(&device));

    let paths = args.model_paths()?;
    let tts = OrpheusTTS::from_paths(&paths, device)?;

    let prompts = args.prompts();
    let options = args.synthesis_options();
    for (i, prompt) in prompts.iter().enumerate() {
        tracing::info!("Prompt {}: {}: {}", i + 1, args.voice, prompt);
    }

    let progress = ProgressBar::new(options.generation.max_new_tokens as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tokens")?
            .progress_chars("#>-"),
    );
    let audio = tts.synthesize_batch_with_progress(&args.voice, &prompts, &options, &mut |step| {
        progress.set_position(step as u64)
    });
    progress.finish_and_clear();
    let audio = audio?;

    let written = audio::write_samples(&args.output_dir, &audio)?;
    for (path, buffer) in written.iter().zip(&audio) {
        println!("{} ({:.2}s)", path.display(), buffer.duration());
    }

    Ok(())
}
