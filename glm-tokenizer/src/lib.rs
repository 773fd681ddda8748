//! ChatGLM family tokenizers: vocabulary wrapper, chat templates and
//! tool-call grammars.

pub mod chat_template;
pub mod chatglm;
pub mod chatglm2;
pub mod chatglm3;
pub mod chatglm4;
pub mod family;
pub mod hf;
pub mod stream;
pub mod tool_call;

pub use chat_template::ChatTemplate;
pub use chatglm::ChatGLMTokenizer;
pub use chatglm2::ChatGLM2Tokenizer;
pub use chatglm3::ChatGLM3Tokenizer;
pub use chatglm4::ChatGLM4Tokenizer;
pub use family::{build_tokenizer, load_tokenizer, terminator_ids};
pub use hf::{HfTokenizer, UNK_PLACEHOLDER};
pub use stream::IncrementalDecoder;

use glm_core::{ChatMessage, GlmError, Result, Role};

pub(crate) fn check_max_length(max_length: usize) -> Result<()> {
    if max_length == 0 {
        return Err(GlmError::InvalidInput("max_length must be positive".into()));
    }
    Ok(())
}

/// Drop the oldest tokens after the first `prefix_len` until `ids` fits in
/// `max_length`.
pub(crate) fn truncate_keep_prefix(ids: &mut Vec<u32>, prefix_len: usize, max_length: usize) {
    if ids.len() <= max_length {
        return;
    }
    let prefix_len = prefix_len.min(max_length);
    let tail = max_length - prefix_len;
    ids.drain(prefix_len..ids.len() - tail);
}

/// Plain-text families only understand `user, assistant, ..., user`.
pub(crate) fn check_alternating_turns(messages: &[ChatMessage]) -> Result<()> {
    if messages.len() % 2 == 0 {
        return Err(GlmError::InvalidInput(format!(
            "expected an odd number of messages ending with a user turn, got {}",
            messages.len()
        )));
    }
    for (i, msg) in messages.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if msg.role != expected {
            return Err(GlmError::InvalidInput(format!(
                "message {i} has role {}, expected {expected}",
                msg.role
            )));
        }
    }
    Ok(())
}
