//! Text tokenizer wrapper for the Llama-3 vocabulary used by Orpheus

use std::path::Path;
use tokenizers::Tokenizer;

use crate::error::{OrpheusError, Result};

/// Text tokenizer wrapping HuggingFace tokenizers
#[derive(Debug, Clone)]
pub struct TextTokenizer {
    tokenizer: Tokenizer,
}

/// Create a simple mock tokenizer for testing
#[cfg(test)]
pub(crate) fn create_mock_tokenizer() -> Tokenizer {
    use tokenizers::models::bpe::BPE;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    // Whole words map straight to ids; no merges are needed
    let vocab: [(&str, u32); 6] = [
        ("tara", 0),
        (":", 1),
        ("hello", 2),
        ("world", 3),
        ("leo", 4),
        ("[UNK]", 5),
    ];

    let merges: Vec<(String, String)> = vec![];
    let bpe = BPE::builder()
        .vocab_and_merges(vocab.map(|(k, v)| (k.to_string(), v)), merges)
        .unk_token("[UNK]".to_string())
        .ignore_merges(true)
        .build()
        .unwrap();

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(Whitespace));
    tokenizer
}

impl TextTokenizer {
    /// Load tokenizer from a `tokenizer.json` file or a directory containing one.
    pub fn from_pretrained<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            return Self::from_file(path);
        }
        let candidate = path.join("tokenizer.json");
        if candidate.exists() {
            return Self::from_file(candidate);
        }
        Err(OrpheusError::Tokenizer(format!(
            "no tokenizer.json found at '{}'",
            path.display()
        )))
    }

    /// Load tokenizer from a local file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            OrpheusError::Tokenizer(format!(
                "failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(
            "Loaded tokenizer from {} ({} entries)",
            path.display(),
            tokenizer.get_vocab_size(true)
        );
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Create from a tokenizers::Tokenizer instance
    ///
    /// The post-processor's special tokens (BOS) are always added on encode.
    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| OrpheusError::Tokenizer(format!("failed to encode text: {e}")))?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Batch encode multiple texts
    pub fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<u32>>> {
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| OrpheusError::Tokenizer(format!("failed to batch encode: {e}")))?;

        Ok(encodings
            .into_iter()
            .map(|e| e.get_ids().to_vec())
            .collect())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| OrpheusError::Tokenizer(format!("failed to decode tokens: {e}")))
    }

    /// Get vocabulary size, added tokens included
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Convert token to ID
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Convert ID to token
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }
}
