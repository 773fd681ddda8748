//! Tokenizer selection by model family.

use std::path::Path;

use glm_core::{ModelType, Result, Tokenizer};
use tracing::info;

use crate::chatglm::ChatGLMTokenizer;
use crate::chatglm2::ChatGLM2Tokenizer;
use crate::chatglm3::ChatGLM3Tokenizer;
use crate::chatglm4::ChatGLM4Tokenizer;
use crate::hf::HfTokenizer;

/// Load `tokenizer.json` and wrap it in the family's prompt format.
pub fn load_tokenizer(model_type: ModelType, path: &Path) -> Result<Box<dyn Tokenizer>> {
    let hf = HfTokenizer::from_file(path)?;
    info!(
        family = model_type.name(),
        vocab_size = hf.vocab_size(),
        path = %path.display(),
        "loaded tokenizer"
    );
    build_tokenizer(model_type, hf)
}

pub fn build_tokenizer(model_type: ModelType, hf: HfTokenizer) -> Result<Box<dyn Tokenizer>> {
    Ok(match model_type {
        ModelType::ChatGLM => Box::new(ChatGLMTokenizer::new(hf)?),
        ModelType::ChatGLM2 => Box::new(ChatGLM2Tokenizer::new(hf)?),
        ModelType::ChatGLM3 => Box::new(ChatGLM3Tokenizer::new(hf)?),
        ModelType::ChatGLM4 | ModelType::ChatGLM4V => Box::new(ChatGLM4Tokenizer::new(hf)?),
    })
}

/// Special ids that end a turn in addition to the config's eos ids.
pub fn terminator_ids(model_type: ModelType, hf: &HfTokenizer) -> Vec<u32> {
    let tokens: &[&str] = match model_type {
        ModelType::ChatGLM => &["<eop>"],
        ModelType::ChatGLM2 => &[],
        ModelType::ChatGLM3 => &["<|user|>", "<|observation|>"],
        ModelType::ChatGLM4 | ModelType::ChatGLM4V => {
            &["<|endoftext|>", "<|user|>", "<|observation|>"]
        }
    };
    tokens.iter().filter_map(|t| hf.token_to_id(t)).collect()
}
