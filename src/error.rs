//! Error types for Orpheus TTS.
//!
//! The framing, code extraction and download paths return [`OrpheusError`]
//! so callers can tell failure kinds apart. Model internals use
//! `anyhow::Result`; an `OrpheusError` raised below them stays reachable via
//! `anyhow::Error::downcast_ref`.

use thiserror::Error;

/// Main error type for the Orpheus TTS library.
#[derive(Error, Debug)]
pub enum OrpheusError {
    /// No access token was supplied for an authenticated download
    #[error("missing HuggingFace access token (pass --hf-token or set HUGGINGFACE_TOKEN)")]
    MissingCredential,

    /// The supplied token is structurally unusable
    #[error("invalid HuggingFace access token: {0}")]
    InvalidCredential(String),

    /// Listing the files of a remote repository failed
    #[error("failed to list files of '{repo}': {reason}")]
    RepoListing { repo: String, reason: String },

    /// A file download failed after all retries
    #[error("failed to download '{file}' from '{repo}' after {attempts} attempt(s)")]
    Download {
        repo: String,
        file: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The prompt list handed to the framer was empty
    #[error("prompt batch is empty; at least one text is required")]
    EmptyBatch,

    /// A generated token stream cannot be turned into codec frames
    #[error("malformed generated token stream in row {row}: {reason}")]
    MalformedStream { row: usize, reason: String },

    /// A redistributed code falls outside the codec's codebook
    #[error("code {value} at layer {layer} index {index} is outside the codebook range")]
    CodeOutOfRange {
        layer: usize,
        index: usize,
        value: i64,
    },

    /// A generated row produced no complete codec frame
    #[error("row {row} produced no audio codes")]
    NoAudioCodes { row: usize },

    /// A sentinel token id does not exist in the loaded vocabulary
    #[error("sentinel {name} ({id}) is outside the vocabulary of size {vocab_size}")]
    SentinelOutOfVocab {
        name: &'static str,
        id: u32,
        vocab_size: usize,
    },

    /// Tokenizer failure
    #[error("tokenization error: {0}")]
    Tokenizer(String),

    /// Tensor backend failure
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Orpheus TTS operations.
pub type Result<T> = std::result::Result<T, OrpheusError>;
