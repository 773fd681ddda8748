use std::path::Path;

use glm_core::{GlmError, Result};
use tokenizers::Tokenizer as HfInner;

/// Placeholder text for ids the vocabulary does not know.
pub const UNK_PLACEHOLDER: &str = "<unk>";

/// Thin wrapper over a HuggingFace `tokenizer.json` vocabulary. Family
/// tokenizers layer their prompt formats on top of it.
#[derive(Clone)]
pub struct HfTokenizer {
    inner: HfInner,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = HfInner::from_file(path).map_err(|e| GlmError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let inner: HfInner = json
            .parse()
            .map_err(|e: tokenizers::Error| GlmError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn from_inner(inner: HfInner) -> Self {
        Self { inner }
    }

    /// Tokenize without adding the post-processor's special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| GlmError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode ids, substituting `<unk>` for ids outside the vocabulary.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::new();
        let mut run_start = 0;
        for (i, &id) in ids.iter().enumerate() {
            if self.inner.id_to_token(id).is_none() {
                self.decode_run(&ids[run_start..i], skip_special_tokens, &mut out)?;
                out.push_str(UNK_PLACEHOLDER);
                run_start = i + 1;
            }
        }
        self.decode_run(&ids[run_start..], skip_special_tokens, &mut out)?;
        Ok(out)
    }

    fn decode_run(&self, ids: &[u32], skip_special_tokens: bool, out: &mut String) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let text = self
            .inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| GlmError::Tokenizer(e.to_string()))?;
        out.push_str(&text);
        Ok(())
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.token_to_id(token).is_some()
    }

    /// Resolve a special token the prompt format cannot do without.
    pub fn require_token(&self, token: &str) -> Result<u32> {
        self.token_to_id(token)
            .ok_or_else(|| GlmError::Tokenizer(format!("vocabulary lacks special token {token}")))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
