use crate::{ChatMessage, Result};

/// Text ⇄ token conversion plus the chat framing of one model family.
pub trait Tokenizer: Send + Sync {
    /// Encode plain text, truncated to at most `max_length` tokens.
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>>;

    /// Decode ids back to text. Ids outside the vocabulary become `<unk>`.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Render a conversation into prompt ids, keeping the most recent
    /// `max_length` tokens together with the family's mandatory prefix.
    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize)
        -> Result<Vec<u32>>;

    /// Parse generated ids into an assistant turn, including tool calls.
    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        Ok(ChatMessage::assistant(self.decode(ids, true)?))
    }
}
