use std::path::Path;

use glm_core::{DType, GlmError, ModelConfig, ModelType, Result, VisionModelConfig};
use serde::Deserialize;

/// HuggingFace `config.json` of a ChatGLM checkpoint. The same file shape
/// covers every family; `detect_model_type` tells them apart.
#[derive(Debug, Clone, Deserialize)]
pub struct GlmConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// ChatGLM2 and later.
    #[serde(default)]
    pub padded_vocab_size: Option<usize>,
    /// ChatGLM.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    /// Present (and true) on ChatGLM2 and later.
    #[serde(default)]
    pub multi_query_attention: Option<bool>,
    #[serde(default)]
    pub multi_query_group_num: Option<usize>,
    pub num_layers: usize,
    #[serde(default)]
    pub ffn_hidden_size: Option<usize>,
    #[serde(default)]
    pub inner_hidden_size: Option<usize>,
    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f32,
    #[serde(default = "default_rope_ratio")]
    pub rope_ratio: f32,
    #[serde(default)]
    pub seq_length: Option<usize>,
    #[serde(default)]
    pub max_sequence_length: Option<usize>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    #[serde(default)]
    pub vision_config: Option<GlmVisionConfig>,
    /// GLM-4V image markers.
    #[serde(default = "default_boi_token_id")]
    pub boi_token_id: u32,
    #[serde(default = "default_eoi_token_id")]
    pub eoi_token_id: u32,
}

/// `eos_token_id` is a single id on older checkpoints and a list on GLM-4.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmVisionConfig {
    pub hidden_size: usize,
    pub image_size: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_vision_eps")]
    pub layer_norm_eps: f32,
    pub num_heads: usize,
    pub num_hidden_layers: usize,
    pub num_positions: usize,
    pub patch_size: usize,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f32,
}

fn default_model_type() -> String {
    "chatglm".to_string()
}
fn default_layernorm_epsilon() -> f32 {
    1e-5
}
fn default_rope_ratio() -> f32 {
    1.0
}
fn default_in_channels() -> usize {
    3
}
fn default_vision_eps() -> f32 {
    1e-6
}
fn default_scaling_factor() -> f32 {
    8.0
}
fn default_boi_token_id() -> u32 {
    151_339
}
fn default_eoi_token_id() -> u32 {
    151_340
}

/// Vocabulary size of the GLM-4 tiktoken vocabulary.
const GLM4_PADDED_VOCAB_SIZE: usize = 151_552;

impl GlmConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: GlmConfig = serde_json::from_str(text)?;
        if config.model_type != "chatglm" {
            return Err(GlmError::UnsupportedFormat(format!(
                "unsupported model_type {:?}",
                config.model_type
            )));
        }
        Ok(config)
    }

    /// Pick the model family.
    ///
    /// ChatGLM2, 3 and 4 share one architecture and config layout, so the
    /// tokenizer breaks the tie: `has_token` reports whether the vocabulary
    /// contains a given special token.
    pub fn detect_model_type(&self, has_token: impl Fn(&str) -> bool) -> ModelType {
        if !self.multi_query_attention.unwrap_or(false) {
            return ModelType::ChatGLM;
        }
        let is_glm4 = self.padded_vocab_size == Some(GLM4_PADDED_VOCAB_SIZE)
            || has_token("<sop>")
            || self.vision_config.is_some();
        if is_glm4 {
            if self.vision_config.is_some() {
                ModelType::ChatGLM4V
            } else {
                ModelType::ChatGLM4
            }
        } else if has_token("<|system|>") {
            ModelType::ChatGLM3
        } else {
            ModelType::ChatGLM2
        }
    }

    pub fn to_model_config(&self, model_type: ModelType) -> Result<ModelConfig> {
        let vocab_size = self
            .padded_vocab_size
            .or(self.vocab_size)
            .ok_or_else(|| GlmError::ModelLoad("config.json has no vocab size".into()))?;
        let intermediate_size = self
            .ffn_hidden_size
            .or(self.inner_hidden_size)
            .unwrap_or(4 * self.hidden_size);
        let max_length = self
            .seq_length
            .or(self.max_sequence_length)
            .ok_or_else(|| GlmError::ModelLoad("config.json has no sequence length".into()))?;
        let num_key_value_heads = match model_type {
            ModelType::ChatGLM => self.num_attention_heads,
            _ => self.multi_query_group_num.unwrap_or(self.num_attention_heads),
        };
        let rope_theta = match model_type {
            ModelType::ChatGLM => 10000.0,
            _ => 10000.0 * self.rope_ratio,
        };
        let eos_ids = self.eos_token_id.as_ref().map(EosTokenId::ids).unwrap_or_default();
        let dtype = match self.torch_dtype.as_deref() {
            Some("float16") => DType::F16,
            Some("bfloat16") => DType::BF16,
            _ => DType::F32,
        };

        let config = ModelConfig {
            model_type,
            dtype,
            vocab_size,
            hidden_size: self.hidden_size,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads,
            num_hidden_layers: self.num_layers,
            intermediate_size,
            norm_eps: self.layernorm_epsilon,
            rope_theta,
            max_length,
            bos_token_id: self.bos_token_id,
            eos_token_id: eos_ids.first().copied(),
            pad_token_id: self.pad_token_id,
            sep_token_id: None,
            extra_eos_token_ids: eos_ids.iter().skip(1).copied().collect(),
            vision: match model_type {
                ModelType::ChatGLM4V => self
                    .vision_config
                    .as_ref()
                    .map(|v| v.to_vision_config(self.boi_token_id, self.eoi_token_id)),
                _ => None,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

impl GlmVisionConfig {
    pub fn to_vision_config(&self, boi_token_id: u32, eoi_token_id: u32) -> VisionModelConfig {
        VisionModelConfig {
            hidden_size: self.hidden_size,
            image_size: self.image_size,
            in_channels: self.in_channels,
            intermediate_size: self.intermediate_size,
            norm_eps: self.layer_norm_eps,
            num_attention_heads: self.num_heads,
            num_hidden_layers: self.num_hidden_layers,
            num_positions: self.num_positions,
            patch_size: self.patch_size,
            scaling_factor: self.scaling_factor,
            boi_token_id,
            eoi_token_id,
        }
    }
}
