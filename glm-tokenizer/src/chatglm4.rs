//! GLM-4 and GLM-4V: a text chat template over the tiktoken vocabulary, with
//! image placeholders and JSON function calls.

use glm_core::{ChatMessage, Result, ToolCallMessage, Tokenizer};

use crate::chat_template::ChatTemplate;
use crate::hf::HfTokenizer;
use crate::tool_call::parse_function_call;
use crate::{check_max_length, truncate_keep_prefix};

const TEMPLATE: &str = concat!(
    "[gMASK]<sop>",
    "{% for m in messages %}<|{{ m.role }}|>",
    "{% if m.has_image %}<|begin_of_image|><|endoftext|><|end_of_image|>{% endif %}\n",
    "{% if m.tool_calls %}{% for t in m.tool_calls %}",
    "{% if t.type == 'function' %}{{ t.name }}\n{{ t.arguments }}{% else %}{{ t.input }}{% endif %}",
    "{% endfor %}{% else %}{{ m.content }}{% endif %}",
    "{% endfor %}<|assistant|>",
);

const PREFIX_LEN: usize = 2;

pub struct ChatGLM4Tokenizer {
    hf: HfTokenizer,
    template: ChatTemplate,
    gmask_token_id: u32,
    sop_token_id: u32,
    observation_token_id: u32,
}

impl ChatGLM4Tokenizer {
    pub fn new(hf: HfTokenizer) -> Result<Self> {
        Ok(Self {
            gmask_token_id: hf.require_token("[gMASK]")?,
            sop_token_id: hf.require_token("<sop>")?,
            observation_token_id: hf.require_token("<|observation|>")?,
            template: ChatTemplate::new(TEMPLATE)?,
            hf,
        })
    }

    pub fn build_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        self.template.render(messages)
    }
}

impl Tokenizer for ChatGLM4Tokenizer {
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
        check_max_length(max_length)?;
        // The rendered text already carries `[gMASK]<sop>`.
        let mut ids = self.hf.encode(&self.build_prompt(messages)?)?;
        truncate_keep_prefix(&mut ids, PREFIX_LEN, max_length);
        Ok(ids)
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        // Only a turn closed by `<|observation|>` is a function call.
        let body = match ids.split_last() {
            Some((&last, body)) if last == self.observation_token_id => body,
            _ => return Ok(ChatMessage::assistant(self.decode(ids, true)?)),
        };
        let text = self.decode(body, true)?;
        match parse_function_call(&text) {
            Some(call) => Ok(ChatMessage::assistant(text.trim())
                .with_tool_calls(vec![ToolCallMessage::Function(call)])),
            None => Ok(ChatMessage::assistant(text)),
        }
    }
}
