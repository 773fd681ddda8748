//! ChatGLM2-6B: numbered question/answer rounds behind a `[gMASK] sop` prefix.

use glm_core::{ChatMessage, Result, Tokenizer};

use crate::chat_template::ChatTemplate;
use crate::hf::HfTokenizer;
use crate::{check_alternating_turns, check_max_length, truncate_keep_prefix};

const TEMPLATE: &str = concat!(
    "{% for m in messages %}",
    "{% if m.role == 'user' %}[Round {{ loop.index0 // 2 + 1 }}]\n\n问：{{ m.content }}\n\n答：",
    "{% else %}{{ m.content }}\n\n{% endif %}",
    "{% endfor %}",
);

/// Number of mandatory leading tokens (`[gMASK]`, `sop`).
pub(crate) const PREFIX_LEN: usize = 2;

pub struct ChatGLM2Tokenizer {
    hf: HfTokenizer,
    template: ChatTemplate,
    gmask_token_id: u32,
    sop_token_id: u32,
}

impl ChatGLM2Tokenizer {
    pub fn new(hf: HfTokenizer) -> Result<Self> {
        Ok(Self {
            gmask_token_id: hf.require_token("[gMASK]")?,
            sop_token_id: hf.require_token("sop")?,
            template: ChatTemplate::new(TEMPLATE)?,
            hf,
        })
    }

    pub fn build_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        check_alternating_turns(messages)?;
        self.template.render(messages)
    }
}

impl Tokenizer for ChatGLM2Tokenizer {
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        check_max_length(max_length)?;
        let mut ids = vec![self.gmask_token_id, self.sop_token_id];
        ids.extend(self.hf.encode(text)?);
        truncate_keep_prefix(&mut ids, PREFIX_LEN, max_length);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.hf.decode(ids, skip_special_tokens)
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>> {
        let prompt = self.build_prompt(messages)?;
        self.encode(&prompt, max_length)
    }
}
