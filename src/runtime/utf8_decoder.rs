//! Incremental UTF-8 decoder for byte-level tokenizers
//!
//! A single token may carry only part of a multi-byte character. The decoder
//! keeps every id of the run, re-decodes the whole sequence and returns only
//! the suffix that became printable since the previous call. The handed
//! out fragments always concatenate to a prefix of the latest decode.

use anyhow::Result;
use tracing::debug;

use super::TokenId;

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Clone, Default)]
pub struct IncrementalUtf8Decoder {
    /// All ids pushed so far
    all_tokens: Vec<TokenId>,

    /// Text already handed out
    emitted: String,
}

impl IncrementalUtf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a token batch and return the newly printable text.
    ///
    /// Text ending in U+FFFD is held back until a later batch completes the
    /// character; the next call re-decodes from the start so nothing is lost.
    ///
    /// If the decode no longer starts with the emitted text (the tokenizer
    /// merged across the boundary), nothing is returned until a later decode
    /// extends the emitted text again. Text already handed out is never
    /// repeated.
    pub fn push_tokens<F>(&mut self, tokens: &[TokenId], decode_fn: F) -> Result<String>
    where
        F: FnOnce(&[TokenId]) -> Result<String>,
    {
        self.all_tokens.extend_from_slice(tokens);

        let full_text = decode_fn(&self.all_tokens)?;
        if full_text.ends_with(REPLACEMENT) {
            return Ok(String::new());
        }

        let Some(new_text) = full_text.strip_prefix(self.emitted.as_str()) else {
            debug!(
                emitted = self.emitted.len(),
                decoded = full_text.len(),
                "decode diverged from emitted text, holding back"
            );
            return Ok(String::new());
        };

        let new_text = new_text.to_owned();
        self.emitted.push_str(&new_text);
        Ok(new_text)
    }

    /// Text emitted so far
    pub fn text(&self) -> &str {
        &self.emitted
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.all_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_decoder() {
        let mut decoder = IncrementalUtf8Decoder::new();

        let result = decoder.push_tokens(&[1], |_| Ok("Hello".to_string())).unwrap();
        assert_eq!(result, "Hello");

        let result = decoder.push_tokens(&[2], |_| Ok("Hello world".to_string())).unwrap();
        assert_eq!(result, " world");

        assert_eq!(decoder.text(), "Hello world");
        assert_eq!(decoder.tokens(), &[1, 2]);
    }

    #[test]
    fn test_incomplete_utf8_is_held_back() {
        let mut decoder = IncrementalUtf8Decoder::new();

        let result = decoder.push_tokens(&[1], |_| Ok("\u{FFFD}".to_string())).unwrap();
        assert_eq!(result, "");

        let result = decoder.push_tokens(&[2], |_| Ok("你好".to_string())).unwrap();
        assert_eq!(result, "你好");
    }

    #[test]
    fn test_unstable_prefix_is_never_resent() {
        let mut decoder = IncrementalUtf8Decoder::new();
        let mut streamed = decoder.push_tokens(&[1], |_| Ok("ab".to_string())).unwrap();

        let result = decoder.push_tokens(&[2], |_| Ok("ac d".to_string())).unwrap();
        assert_eq!(result, "");
        streamed.push_str(&result);
        assert_eq!(streamed, "ab");
        assert_eq!(decoder.text(), "ab");

        // Resumes once the decode extends what was handed out
        let result = decoder.push_tokens(&[3], |_| Ok("ab cd".to_string())).unwrap();
        assert_eq!(result, " cd");
        streamed.push_str(&result);
        assert_eq!(streamed, "ab cd");
        assert_eq!(decoder.text(), streamed);
    }

    #[test]
    fn test_decode_error_propagates() {
        let mut decoder = IncrementalUtf8Decoder::new();
        let result = decoder.push_tokens(&[7], |_| Err(anyhow::anyhow!("unknown id")));
        assert!(result.is_err());
    }
}
