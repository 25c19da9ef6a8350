//! WAV I/O for synthesized speech.

use anyhow::{Context, Result};
use candle_core::Tensor;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

/// Mono waveform produced by the codec.
///
/// Samples are 32-bit floats, nominally in \[-1.0, 1.0\]; anything outside
/// is clipped when written.
///
/// ```rust,ignore
/// let audio = codec.decode(&layers)?;
/// audio.save("hello.wav")?;
/// println!("{:.2}s", audio.duration());
/// ```
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    /// Sample rate in Hz (24000 for SNAC output)
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Flatten a decoder output such as `[1, 1, samples]` into a buffer.
    pub fn from_tensor(tensor: Tensor, sample_rate: u32) -> Result<Self> {
        let samples: Vec<f32> = tensor
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;
        Ok(Self::new(samples, sample_rate))
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Save to WAV file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    /// Load from WAV file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// File name of the `index`-th (0-based) sample of a batch: `sample_{index+1}.wav`.
pub fn sample_file_name(index: usize) -> String {
    format!("sample_{}.wav", index + 1)
}

/// Write a batch of waveforms into `dir`, one file per prompt.
///
/// The directory is created if needed; existing files are overwritten.
/// Returns the written paths in batch order.
pub fn write_samples<P: AsRef<Path>>(dir: P, audio: &[AudioBuffer]) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let mut paths = Vec::with_capacity(audio.len());
    for (i, buffer) in audio.iter().enumerate() {
        let path = dir.join(sample_file_name(i));
        buffer.save(&path)?;
        tracing::info!(
            "Wrote {} ({:.2}s, {} samples)",
            path.display(),
            buffer.duration(),
            buffer.len()
        );
        paths.push(path);
    }
    Ok(paths)
}

/// Load a WAV file into an AudioBuffer, downmixing to mono.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioBuffer::new(mono, spec.sample_rate))
}

/// Save samples as mono 16-bit PCM.
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(scaled)?;
    }

    writer.finalize()?;
    Ok(())
}
