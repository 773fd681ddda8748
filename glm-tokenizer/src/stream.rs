//! Streaming detokenization.
//!
//! Ids are decoded in a sliding window rather than one at a time, so
//! characters split across ids and pieces that fold into whitespace (the
//! ChatGLM-6B `<n>`, `<|tab|>`, `<|blank_N|>`) come out as the family's
//! `decode` would render them.

use glm_core::Tokenizer;

/// Ids a window may grow to before it is rebased without a line break.
const MAX_WINDOW: usize = 16;

/// Characters after which the window is rebased early.
const BREAKS: &[char] = &['\n', '。', '！', '？', '，'];

/// Turns a stream of ids into text deltas.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    /// Ids since the last rebase. The first one is context only.
    window: Vec<u32>,
    /// Bytes of the window's decoding already handed out.
    emitted: usize,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one id and return the text it completes, if any.
    pub fn add_token(&mut self, token_id: u32, tokenizer: &dyn Tokenizer) -> Option<String> {
        self.window.push(token_id);
        let text = tokenizer.decode(&self.window, true).ok()?;
        // A trailing replacement char is a partial UTF-8 sequence.
        if text.ends_with('\u{FFFD}') {
            return None;
        }
        let Some(delta) = self.delta(&text) else {
            if self.window.len() >= MAX_WINDOW {
                self.rebase(tokenizer);
            }
            return None;
        };
        if text.ends_with(BREAKS) || self.window.len() >= MAX_WINDOW {
            self.rebase(tokenizer);
        } else {
            self.emitted = text.len();
        }
        Some(delta).filter(|d| !d.is_empty())
    }

    /// Emit whatever the window still holds and start over.
    pub fn flush(&mut self, tokenizer: &dyn Tokenizer) -> Option<String> {
        let text = tokenizer.decode(&self.window, true).ok();
        let delta = text.and_then(|text| self.delta(&text));
        *self = Self::default();
        delta.filter(|d| !d.is_empty())
    }

    /// The part of `text` not yet emitted. `None` while a later id has
    /// rewritten text that was already handed out.
    fn delta(&self, text: &str) -> Option<String> {
        text.get(self.emitted..).map(str::to_owned)
    }

    /// Keep only the last id, so the next decode still sees its left
    /// neighbour when deciding on a leading space.
    fn rebase(&mut self, tokenizer: &dyn Tokenizer) {
        let keep = self.window.len().saturating_sub(1);
        self.window.drain(..keep);
        self.emitted = tokenizer
            .decode(&self.window, true)
            .map_or(0, |text| text.len());
    }
}

#[cfg(test)]
mod tests {
    use glm_core::{ChatMessage, Result};

    use super::*;

    /// Every id is one byte; invalid UTF-8 decodes lossily.
    struct ByteTokenizer;

    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str, _max_length: usize) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn apply_chat_template(&self, _: &[ChatMessage], _: usize) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
    }

    fn stream(text: &str) -> Vec<String> {
        let tokenizer = ByteTokenizer;
        let mut decoder = IncrementalDecoder::new();
        let mut deltas: Vec<String> = text
            .bytes()
            .filter_map(|b| decoder.add_token(u32::from(b), &tokenizer))
            .collect();
        deltas.extend(decoder.flush(&tokenizer));
        deltas
    }

    #[test]
    fn split_characters_are_held_back() {
        assert_eq!(stream("é!"), vec!["é", "!"]);
        assert_eq!(stream("你好"), vec!["你", "好"]);
    }

    #[test]
    fn long_output_survives_rebasing() {
        let text = "first line\nthen a rather long second line without breaks，好。\nend";
        assert_eq!(stream(text).concat(), text);
    }

    #[test]
    fn flush_emits_a_dangling_partial_character() {
        let tokenizer = ByteTokenizer;
        let mut decoder = IncrementalDecoder::new();
        assert_eq!(decoder.add_token(0xE4, &tokenizer), None);
        assert_eq!(decoder.flush(&tokenizer).as_deref(), Some("\u{FFFD}"));
        assert_eq!(decoder.flush(&tokenizer), None);
    }
}
