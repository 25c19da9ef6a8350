//! Text tokenization for Orpheus TTS
//!
//! Uses HuggingFace's tokenizers library with the checkpoint's own
//! `tokenizer.json` (Llama-3 BPE plus the Orpheus custom tokens).

mod text;

#[cfg(test)]
pub(crate) use text::create_mock_tokenizer;
pub use text::TextTokenizer;
