//! ChatGLM-6B: question/answer rounds with whitespace folded into special
//! pieces, and the generation mask appended after the prompt.

use glm_core::{ChatMessage, Result, Tokenizer};

use crate::chat_template::ChatTemplate;
use crate::hf::HfTokenizer;
use crate::{check_alternating_turns, check_max_length, truncate_keep_prefix};

const MAX_BLANK_LENGTH: usize = 80;

const TEMPLATE: &str = concat!(
    "{% if messages|length == 1 %}{{ messages[0].content }}",
    "{% else %}{% for m in messages %}",
    "{% if m.role == 'user' %}[Round {{ loop.index0 // 2 }}]\n问：{{ m.content }}\n答：",
    "{% else %}{{ m.content }}\n{% endif %}",
    "{% endfor %}{% endif %}",
);

pub struct ChatGLMTokenizer {
    hf: HfTokenizer,
    template: ChatTemplate,
    gmask_token_id: u32,
    sop_token_id: u32,
    eop_token_id: u32,
}

impl ChatGLMTokenizer {
    pub fn new(hf: HfTokenizer) -> Result<Self> {
        Ok(Self {
            gmask_token_id: hf.require_token("[gMASK]")?,
            sop_token_id: hf.require_token("<sop>")?,
            eop_token_id: hf.require_token("<eop>")?,
            template: ChatTemplate::new(TEMPLATE)?,
            hf,
        })
    }

    pub fn gmask_token_id(&self) -> u32 {
        self.gmask_token_id
    }

    pub fn sop_token_id(&self) -> u32 {
        self.sop_token_id
    }

    pub fn eop_token_id(&self) -> u32 {
        self.eop_token_id
    }

    /// The prompt text before tokenization.
    pub fn build_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        check_alternating_turns(messages)?;
        self.template.render(messages)
    }
}

/// Fold newlines, tabs and runs of spaces into the vocabulary's special pieces.
pub fn preprocess(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut spaces = 0usize;
    let flush = |out: &mut String, mut run: usize| {
        while run >= 2 {
            let n = run.min(MAX_BLANK_LENGTH);
            out.push_str(&format!("<|blank_{n}|>"));
            run -= n;
        }
        if run == 1 {
            out.push(' ');
        }
    };
    for c in text.chars() {
        if c == ' ' {
            spaces += 1;
            continue;
        }
        flush(&mut out, spaces);
        spaces = 0;
        match c {
            '\n' => out.push_str("<n>"),
            '\t' => out.push_str("<|tab|>"),
            other => out.push(other),
        }
    }
    flush(&mut out, spaces);
    out
}

/// Inverse of [`preprocess`].
pub fn postprocess(text: &str) -> String {
    let mut out = text.replace("<n>", "\n").replace("<|tab|>", "\t");
    while let Some(start) = out.find("<|blank_") {
        let rest = &out[start + "<|blank_".len()..];
        let Some(end) = rest.find("|>") else { break };
        let Ok(n) = rest[..end].parse::<usize>() else { break };
        let piece_len = "<|blank_".len() + end + "|>".len();
        out.replace_range(start..start + piece_len, &" ".repeat(n));
    }
    out
}

impl Tokenizer for ChatGLMTokenizer {
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        check_max_length(max_length)?;
        let mut ids = self.hf.encode(&preprocess(text))?;
        ids.push(self.gmask_token_id);
        ids.push(self.sop_token_id);
        // The mask and sop sit at the end, so keeping the tail keeps them.
        truncate_keep_prefix(&mut ids, 0, max_length);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let text = self.hf.decode(ids, skip_special_tokens)?;
        Ok(postprocess(&text))
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>> {
        let prompt = self.build_prompt(messages)?;
        self.encode(&prompt, max_length)
    }
}
