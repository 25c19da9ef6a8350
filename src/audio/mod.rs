//! Audio output for Orpheus TTS
//!
//! SNAC decodes to 24 kHz mono. This module holds the waveform buffer and the
//! WAV writer that turns a synthesized batch into `sample_{n}.wav` files.

mod io;

pub use io::{load_wav, sample_file_name, save_wav, write_samples, AudioBuffer};

/// Output sample rate of the SNAC 24 kHz codec
pub const SAMPLE_RATE: u32 = 24000;
