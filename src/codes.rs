//! Audio code extraction and SNAC layer redistribution.
//!
//! The model emits SNAC codes as a flat stream of custom tokens, seven per
//! frame. Slot `s` of a frame lives in its own 4096-wide block of the
//! vocabulary, starting at the codebook offset:
//!
//! | slot | SNAC layer | block offset |
//! |------|------------|--------------|
//! | 0    | 1          | 0            |
//! | 1    | 2          | 1 × 4096     |
//! | 2    | 3          | 2 × 4096     |
//! | 3    | 3          | 3 × 4096     |
//! | 4    | 2          | 4 × 4096     |
//! | 5    | 3          | 5 × 4096     |
//! | 6    | 3          | 6 × 4096     |
//!
//! Layer 1 runs at the frame rate, layer 2 at twice and layer 3 at four
//! times that rate.

use candle_core::{Device, Tensor};

use crate::error::{OrpheusError, Result};
use crate::tokens::{SpecialTokens, TOKENS_PER_FRAME};

/// What to do with generated tokens that do not complete a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingPolicy {
    /// Drop the incomplete tail and keep going
    #[default]
    Truncate,
    /// Fail with [`OrpheusError::MalformedStream`]; also fails when the audio
    /// start marker is missing
    Reject,
}

/// Offset-adjusted codes of one generated row. Length is a multiple of 7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeList(Vec<i64>);

impl CodeList {
    /// Wrap raw codes, dropping any incomplete trailing frame.
    pub fn new(mut codes: Vec<i64>) -> Self {
        let frames = codes.len() / TOKENS_PER_FRAME;
        codes.truncate(frames * TOKENS_PER_FRAME);
        Self(codes)
    }

    /// Number of complete 7-token frames
    pub fn num_frames(&self) -> usize {
        self.0.len() / TOKENS_PER_FRAME
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
}

/// The three SNAC code layers of one utterance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerCodes {
    pub layer_1: Vec<i64>,
    pub layer_2: Vec<i64>,
    pub layer_3: Vec<i64>,
}

impl LayerCodes {
    /// Layers in decoder order.
    pub fn layers(&self) -> [&[i64]; 3] {
        [&self.layer_1, &self.layer_2, &self.layer_3]
    }

    /// Number of SNAC frames (layer 1 length)
    pub fn num_frames(&self) -> usize {
        self.layer_1.len()
    }

    /// Check that every code indexes into a codebook of `codebook_size` entries.
    pub fn validate(&self, codebook_size: u32) -> Result<()> {
        for (layer, codes) in self.layers().iter().enumerate() {
            if let Some((index, &value)) = codes
                .iter()
                .enumerate()
                .find(|(_, &v)| v < 0 || v >= codebook_size as i64)
            {
                return Err(OrpheusError::CodeOutOfRange {
                    layer: layer + 1,
                    index,
                    value,
                });
            }
        }
        Ok(())
    }

    /// Validate and convert to three `[1, n]` u32 tensors for the SNAC decoder.
    pub fn to_tensors(&self, codebook_size: u32, device: &Device) -> Result<[Tensor; 3]> {
        self.validate(codebook_size)?;
        let to_tensor = |codes: &[i64]| -> Result<Tensor> {
            let codes: Vec<u32> = codes.iter().map(|&c| c as u32).collect();
            Ok(Tensor::new(codes, device)?.unsqueeze(0)?)
        };
        Ok([
            to_tensor(&self.layer_1)?,
            to_tensor(&self.layer_2)?,
            to_tensor(&self.layer_3)?,
        ])
    }
}

/// Turn one generated row into a [`CodeList`].
///
/// Keeps what follows the last AUDIO_START (the whole row if there is none),
/// removes every STOP, cuts the tail to whole frames and subtracts the
/// codebook offset. `row` only labels errors and log lines.
pub fn extract_code_list(
    generated: &[u32],
    special: &SpecialTokens,
    policy: TrailingPolicy,
    row: usize,
) -> Result<CodeList> {
    let payload = match generated.iter().rposition(|&t| t == special.audio_start) {
        Some(last) => &generated[last + 1..],
        None => {
            if policy == TrailingPolicy::Reject {
                return Err(OrpheusError::MalformedStream {
                    row,
                    reason: "audio start marker never generated".to_string(),
                });
            }
            tracing::warn!(row, "No audio start marker found; using the whole sequence");
            generated
        }
    };

    let codes: Vec<i64> = payload
        .iter()
        .filter(|&&t| t != special.stop)
        .map(|&t| t as i64 - special.codebook_offset as i64)
        .collect();

    let remainder = codes.len() % TOKENS_PER_FRAME;
    if remainder != 0 {
        match policy {
            TrailingPolicy::Reject => {
                return Err(OrpheusError::MalformedStream {
                    row,
                    reason: format!(
                        "{} audio tokens is not a whole number of {}-token frames",
                        codes.len(),
                        TOKENS_PER_FRAME
                    ),
                });
            }
            TrailingPolicy::Truncate => {
                tracing::warn!(row, dropped = remainder, "Dropping incomplete trailing frame");
            }
        }
    }

    Ok(CodeList::new(codes))
}

/// Demultiplex a code list into the three SNAC layers.
pub fn redistribute(codes: &CodeList, codebook_size: u32) -> LayerCodes {
    let size = codebook_size as i64;
    let frames = codes.num_frames();
    let mut layers = LayerCodes {
        layer_1: Vec::with_capacity(frames),
        layer_2: Vec::with_capacity(2 * frames),
        layer_3: Vec::with_capacity(4 * frames),
    };

    for frame in codes.as_slice().chunks_exact(TOKENS_PER_FRAME) {
        layers.layer_1.push(frame[0]);
        layers.layer_2.push(frame[1] - size);
        layers.layer_3.push(frame[2] - 2 * size);
        layers.layer_3.push(frame[3] - 3 * size);
        layers.layer_2.push(frame[4] - 4 * size);
        layers.layer_3.push(frame[5] - 5 * size);
        layers.layer_3.push(frame[6] - 6 * size);
    }

    layers
}
