//! Prompt framing: voice-tagged text to a left-padded token batch.
//!
//! Each prompt becomes `[START] ++ tokens("voice: text") ++ [END_OF_TEXT,
//! END_OF_HUMAN]`. Rows are left-padded with PAD to the longest row so that
//! every row ends at the same column, which is where generation continues.

use candle_core::{Device, Tensor};

use crate::error::{OrpheusError, Result};
use crate::tokenizer::TextTokenizer;
use crate::tokens::SpecialTokens;

/// Rectangular batch of framed prompts plus its attention mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    /// `[batch][max_length]` token ids, PAD on the left
    pub input_ids: Vec<Vec<u32>>,
    /// `[batch][max_length]`, 0 over padding and 1 over real tokens
    pub attention_mask: Vec<Vec<u32>>,
}

impl PaddedBatch {
    /// Number of rows
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    /// Common row length
    pub fn max_length(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// Number of non-padding tokens per row
    pub fn real_lengths(&self) -> Vec<usize> {
        self.attention_mask
            .iter()
            .map(|row| row.iter().filter(|&&m| m == 1).count())
            .collect()
    }

    /// Row `i` with its padding prefix stripped
    pub fn unpadded_row(&self, i: usize) -> &[u32] {
        let pad_len = self.attention_mask[i]
            .iter()
            .take_while(|&&m| m == 0)
            .count();
        &self.input_ids[i][pad_len..]
    }

    /// True when at least one row carries padding
    pub fn has_padding(&self) -> bool {
        self.attention_mask.iter().flatten().any(|&m| m == 0)
    }

    /// Convert to `(input_ids, attention_mask)` tensors of shape `[batch, max_length]`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.batch_size(), self.max_length());
        let ids: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        let mask: Vec<u32> = self.attention_mask.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(ids, shape, device)?;
        let mask = Tensor::from_vec(mask, shape, device)?;
        Ok((ids, mask))
    }
}

/// Tag a text with its voice: `"voice: text"`.
pub fn format_prompt(voice: &str, text: &str) -> String {
    format!("{voice}: {text}")
}

/// Wrap a tokenized prompt in the human-turn sentinels.
pub fn frame_tokens(tokens: &[u32], special: &SpecialTokens) -> Vec<u32> {
    let mut framed = Vec::with_capacity(tokens.len() + 3);
    framed.push(special.start);
    framed.extend_from_slice(tokens);
    framed.push(special.end_of_text);
    framed.push(special.end_of_human);
    framed
}

/// Left-pad framed rows to a common length and build the attention mask.
pub fn pad_batch(framed: Vec<Vec<u32>>, special: &SpecialTokens) -> Result<PaddedBatch> {
    let max_length = framed
        .iter()
        .map(Vec::len)
        .max()
        .ok_or(OrpheusError::EmptyBatch)?;

    let mut input_ids = Vec::with_capacity(framed.len());
    let mut attention_mask = Vec::with_capacity(framed.len());
    for row in framed {
        let padding = max_length - row.len();
        let mut ids = vec![special.pad; padding];
        ids.extend(row.iter().copied());
        let mut mask = vec![0u32; padding];
        mask.resize(max_length, 1);
        input_ids.push(ids);
        attention_mask.push(mask);
    }

    Ok(PaddedBatch {
        input_ids,
        attention_mask,
    })
}

/// Frame a batch of texts for one voice.
///
/// Fails with [`OrpheusError::EmptyBatch`] before touching the tokenizer when
/// `texts` is empty.
pub fn frame_prompts<S: AsRef<str>>(
    tokenizer: &TextTokenizer,
    voice: &str,
    texts: &[S],
    special: &SpecialTokens,
) -> Result<PaddedBatch> {
    if texts.is_empty() {
        return Err(OrpheusError::EmptyBatch);
    }

    let prompts: Vec<String> = texts
        .iter()
        .map(|text| format_prompt(voice, text.as_ref()))
        .collect();
    let tokenized = tokenizer.encode_batch(&prompts)?;
    let framed: Vec<Vec<u32>> = tokenized
        .iter()
        .map(|tokens| frame_tokens(tokens, special))
        .collect();

    let batch = pad_batch(framed, special)?;
    tracing::debug!(
        rows = batch.batch_size(),
        max_length = batch.max_length(),
        "Framed prompt batch"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::create_mock_tokenizer;

    fn special() -> SpecialTokens {
        SpecialTokens::default()
    }

    #[test]
    fn test_format_prompt() {
        assert_eq!(format_prompt("tara", "Hi there"), "tara: Hi there");
    }

    #[test]
    fn test_frame_tokens_layout() {
        let framed = frame_tokens(&[10, 11, 12], &special());
        assert_eq!(framed, vec![128259, 10, 11, 12, 128009, 128260]);
    }

    #[test]
    fn test_frame_tokens_empty_text() {
        let framed = frame_tokens(&[], &special());
        assert_eq!(framed, vec![128259, 128009, 128260]);
    }

    #[test]
    fn test_pad_batch_left_pads_to_longest() {
        let s = special();
        let batch = pad_batch(
            vec![frame_tokens(&[1], &s), frame_tokens(&[1, 2, 3], &s)],
            &s,
        )
        .unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.max_length(), 6);
        assert_eq!(
            batch.input_ids[0],
            vec![128263, 128263, 128259, 1, 128009, 128260]
        );
        assert_eq!(batch.attention_mask[0], vec![0, 0, 1, 1, 1, 1]);
        assert_eq!(batch.attention_mask[1], vec![1; 6]);
    }

    #[test]
    fn test_pad_batch_empty_is_rejected() {
        let err = pad_batch(vec![], &special()).unwrap_err();
        assert!(matches!(err, OrpheusError::EmptyBatch));
    }

    #[test]
    fn test_mask_counts_match_framed_lengths() {
        let s = special();
        let rows: Vec<Vec<u32>> = [vec![], vec![5], vec![5, 6, 7, 8, 9]]
            .iter()
            .map(|t| frame_tokens(t, &s))
            .collect();
        let lengths: Vec<usize> = rows.iter().map(Vec::len).collect();
        let batch = pad_batch(rows, &s).unwrap();

        assert_eq!(batch.real_lengths(), lengths);
        for (ids, mask) in batch.input_ids.iter().zip(&batch.attention_mask) {
            assert_eq!(ids.len(), batch.max_length());
            assert_eq!(mask.len(), batch.max_length());
            for (&id, &m) in ids.iter().zip(mask) {
                assert_eq!(m == 0, id == s.pad);
            }
        }
    }

    #[test]
    fn test_unpadded_row_recovers_tokens() {
        let s = special();
        let texts = [vec![1u32, 2], vec![3u32, 4, 5, 6]];
        let batch = pad_batch(texts.iter().map(|t| frame_tokens(t, &s)).collect(), &s).unwrap();

        for (i, tokens) in texts.iter().enumerate() {
            let row = batch.unpadded_row(i);
            assert_eq!(row[0], s.start);
            assert_eq!(&row[row.len() - 2..], &[s.end_of_text, s.end_of_human]);
            assert_eq!(&row[1..row.len() - 2], tokens.as_slice());
        }
    }

    #[test]
    fn test_frame_prompts_with_tokenizer() {
        let tokenizer = TextTokenizer::from_tokenizer(create_mock_tokenizer());
        let batch = frame_prompts(&tokenizer, "tara", &["hello world", "hello"], &special()).unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(
            batch.input_ids[0],
            vec![128259, 0, 1, 2, 3, 128009, 128260]
        );
        assert_eq!(
            batch.input_ids[1],
            vec![128263, 128259, 0, 1, 2, 128009, 128260]
        );
        assert!(batch.has_padding());
    }

    #[test]
    fn test_frame_prompts_rejects_empty_input() {
        let tokenizer = TextTokenizer::from_tokenizer(create_mock_tokenizer());
        let texts: [&str; 0] = [];
        let err = frame_prompts(&tokenizer, "tara", &texts, &special()).unwrap_err();
        assert!(matches!(err, OrpheusError::EmptyBatch));
    }

    #[test]
    fn test_to_tensors_shape() {
        let s = special();
        let batch = pad_batch(vec![frame_tokens(&[1], &s), frame_tokens(&[], &s)], &s).unwrap();
        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 4]);
        assert_eq!(mask.dims(), &[2, 4]);
        let mask: Vec<Vec<u32>> = mask.to_vec2().unwrap();
        assert_eq!(mask[1], vec![0, 1, 1, 1]);
    }
}
