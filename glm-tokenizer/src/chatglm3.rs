//! ChatGLM3-6B: role tokens assembled at the id level, with a code
//! interpreter and `tool_call(...)` function grammar.

use glm_core::{ChatMessage, Result, Role, ToolCallMessage, Tokenizer};
use tracing::debug;

use crate::chatglm2::PREFIX_LEN;
use crate::hf::HfTokenizer;
use crate::tool_call::{extract_code, parse_tool_call_arguments};
use crate::{check_max_length, truncate_keep_prefix};

/// Metadata line that marks a code interpreter call.
const INTERPRETER: &str = "interpreter";

pub struct ChatGLM3Tokenizer {
    hf: HfTokenizer,
    gmask_token_id: u32,
    sop_token_id: u32,
    system_token_id: u32,
    user_token_id: u32,
    assistant_token_id: u32,
    observation_token_id: u32,
}

impl ChatGLM3Tokenizer {
    pub fn new(hf: HfTokenizer) -> Result<Self> {
        Ok(Self {
            gmask_token_id: hf.require_token("[gMASK]")?,
            sop_token_id: hf.require_token("sop")?,
            system_token_id: hf.require_token("<|system|>")?,
            user_token_id: hf.require_token("<|user|>")?,
            assistant_token_id: hf.require_token("<|assistant|>")?,
            observation_token_id: hf.require_token("<|observation|>")?,
            hf,
        })
    }

    fn role_token_id(&self, role: Role) -> u32 {
        match role {
            Role::System => self.system_token_id,
            Role::User => self.user_token_id,
            Role::Assistant => self.assistant_token_id,
            Role::Observation => self.observation_token_id,
        }
    }

    /// `<|role|>` followed by `metadata\ncontent`.
    pub fn encode_single_message(&self, role: Role, metadata: &str, content: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.role_token_id(role)];
        ids.extend(self.hf.encode(&format!("{metadata}\n{content}"))?);
        Ok(ids)
    }
}

impl Tokenizer for ChatGLM3Tokenizer {
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
        let mut ids = vec![self.gmask_token_id, self.sop_token_id];
        for msg in messages {
            ids.extend(self.encode_single_message(msg.role, "", &msg.content)?);
            // A code call travels as its own interpreter message.
            if let Some(ToolCallMessage::Code(code)) = msg.tool_calls.first() {
                ids.extend(self.encode_single_message(msg.role, INTERPRETER, &code.input)?);
            }
        }
        ids.push(self.assistant_token_id);
        truncate_keep_prefix(&mut ids, PREFIX_LEN, max_length);
        Ok(ids)
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        let Some((&last, body)) = ids.split_last() else {
            return Ok(ChatMessage::assistant(""));
        };
        if last != self.observation_token_id {
            return Ok(ChatMessage::assistant(self.decode(ids, true)?));
        }

        // The model may emit several `<|assistant|>` segments; the call is in the last.
        let segment = body
            .rsplit(|&id| id == self.assistant_token_id)
            .next()
            .unwrap_or(body);
        let output = self.decode(segment, true)?;
        let (metadata, content) = match output.split_once('\n') {
            Some((meta, rest)) => (meta.trim(), rest.trim()),
            None => (output.trim(), ""),
        };
        debug!(metadata, "decoding tool call");

        if metadata == INTERPRETER {
            let code = extract_code(content);
            return Ok(ChatMessage::assistant(content)
                .with_tool_calls(vec![ToolCallMessage::code(code)]));
        }
        match parse_tool_call_arguments(content) {
            Some(arguments) if !metadata.is_empty() => Ok(ChatMessage::assistant(content)
                .with_tool_calls(vec![ToolCallMessage::function(metadata, arguments)])),
            _ => Ok(ChatMessage::assistant(output.trim())),
        }
    }
}
