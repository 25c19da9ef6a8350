//! Sentinel token ids shared by prompt framing and code extraction.
//!
//! The Orpheus checkpoints extend the Llama-3 vocabulary with a block of
//! custom tokens. Text prompts are wrapped in the "human" sentinels below, and
//! the audio stream is a run of custom tokens starting at
//! [`ids::CODEBOOK_OFFSET`], seven per SNAC frame.

use crate::error::{OrpheusError, Result};

/// Fixed sentinel ids of the pretrained Orpheus vocabulary.
pub mod ids {
    /// Start of human turn
    pub const START: u32 = 128259;
    /// Llama-3 `<|eot_id|>`, closes the text segment
    pub const END_OF_TEXT: u32 = 128009;
    /// End of human turn
    pub const END_OF_HUMAN: u32 = 128260;
    /// Left padding for batched prompts
    pub const PAD: u32 = 128263;
    /// Marks the beginning of the audio payload
    pub const AUDIO_START: u32 = 128257;
    /// End of speech; also the generation EOS id
    pub const STOP: u32 = 128258;
    /// First audio code token
    pub const CODEBOOK_OFFSET: u32 = 128266;
    /// Entries per SNAC codebook; each of the 7 frame slots owns one block
    pub const CODEBOOK_SIZE: u32 = 4096;
}

/// Number of generated tokens per SNAC frame.
pub const TOKENS_PER_FRAME: usize = 7;

/// Named sentinel configuration.
///
/// Defaults to the values baked into the pretrained checkpoints. Tests and
/// smaller experimental vocabularies can construct their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub start: u32,
    pub end_of_text: u32,
    pub end_of_human: u32,
    pub pad: u32,
    pub audio_start: u32,
    pub stop: u32,
    pub codebook_offset: u32,
    pub codebook_size: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            start: ids::START,
            end_of_text: ids::END_OF_TEXT,
            end_of_human: ids::END_OF_HUMAN,
            pad: ids::PAD,
            audio_start: ids::AUDIO_START,
            stop: ids::STOP,
            codebook_offset: ids::CODEBOOK_OFFSET,
            codebook_size: ids::CODEBOOK_SIZE,
        }
    }
}

impl SpecialTokens {
    /// All sentinels with their names, in a stable order.
    pub fn named(&self) -> [(&'static str, u32); 6] {
        [
            ("START", self.start),
            ("END_OF_TEXT", self.end_of_text),
            ("END_OF_HUMAN", self.end_of_human),
            ("PAD", self.pad),
            ("AUDIO_START", self.audio_start),
            ("STOP", self.stop),
        ]
    }

    /// Highest token id an audio code can take, exclusive.
    pub fn audio_token_end(&self) -> u64 {
        self.codebook_offset as u64 + TOKENS_PER_FRAME as u64 * self.codebook_size as u64
    }

    /// Check that every sentinel and the whole audio code block fit in a
    /// vocabulary of `vocab_size` entries.
    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        for (name, id) in self.named() {
            if id as usize >= vocab_size {
                return Err(OrpheusError::SentinelOutOfVocab {
                    name,
                    id,
                    vocab_size,
                });
            }
        }
        if self.audio_token_end() > vocab_size as u64 {
            return Err(OrpheusError::SentinelOutOfVocab {
                name: "CODEBOOK_OFFSET",
                id: self.codebook_offset,
                vocab_size,
            });
        }
        Ok(())
    }
}
