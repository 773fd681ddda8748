use serde::{Deserialize, Serialize};

use crate::{GlmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

/// Model family tag. The numeric values match the tags written into
/// converted weight metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    ChatGLM = 1,
    ChatGLM2 = 2,
    ChatGLM3 = 3,
    ChatGLM4 = 4,
    ChatGLM4V = 1004,
}

impl ModelType {
    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            1 => Ok(ModelType::ChatGLM),
            2 => Ok(ModelType::ChatGLM2),
            3 => Ok(ModelType::ChatGLM3),
            4 => Ok(ModelType::ChatGLM4),
            1004 => Ok(ModelType::ChatGLM4V),
            other => Err(GlmError::UnsupportedFormat(format!(
                "unknown model type tag {other}"
            ))),
        }
    }

    pub fn tag(&self) -> i32 {
        *self as i32
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelType::ChatGLM => "ChatGLM",
            ModelType::ChatGLM2 => "ChatGLM2",
            ModelType::ChatGLM3 => "ChatGLM3",
            ModelType::ChatGLM4 => "GLM-4",
            ModelType::ChatGLM4V => "GLM-4V",
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionModelConfig {
    pub hidden_size: usize,
    pub image_size: usize,
    pub in_channels: usize,
    pub intermediate_size: usize,
    pub norm_eps: f32,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub num_positions: usize,
    pub patch_size: usize,
    pub scaling_factor: f32,
    /// `<|begin_of_image|>`, the token the image embeddings follow.
    pub boi_token_id: u32,
    /// `<|end_of_image|>`
    pub eoi_token_id: u32,
}

impl VisionModelConfig {
    /// Side length of the patch grid before the 2x2 downsampling conv.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Number of image tokens handed to the language model (boi/eoi excluded).
    pub fn num_image_tokens(&self) -> usize {
        let side = self.grid_size() / 2;
        side * side
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(GlmError::InvalidInput(format!(
                "image_size {} is not a multiple of patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.grid_size() % 2 != 0 {
            return Err(GlmError::InvalidInput(format!(
                "patch grid {} cannot be downsampled by 2",
                self.grid_size()
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(GlmError::InvalidInput(format!(
                "vision hidden_size {} not divisible by {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_positions != self.grid_size() * self.grid_size() + 1 {
            return Err(GlmError::InvalidInput(format!(
                "vision num_positions {} does not match {} patches + cls",
                self.num_positions,
                self.grid_size() * self.grid_size()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub dtype: DType,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub norm_eps: f32,
    pub rope_theta: f32,
    pub max_length: usize,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub sep_token_id: Option<u32>,
    pub extra_eos_token_ids: Vec<u32>,
    pub vision: Option<VisionModelConfig>,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim()
    }

    pub fn model_type_name(&self) -> &'static str {
        self.model_type.name()
    }

    /// Whether `token_id` terminates generation.
    pub fn is_eos(&self, token_id: u32) -> bool {
        self.eos_token_id == Some(token_id) || self.extra_eos_token_ids.contains(&token_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(GlmError::InvalidInput(format!(
                "hidden_size {} not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_key_value_heads == 0
            || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(GlmError::InvalidInput(format!(
                "{} attention heads not divisible by {} key/value heads",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        let specials = [
            ("bos_token_id", self.bos_token_id),
            ("eos_token_id", self.eos_token_id),
            ("pad_token_id", self.pad_token_id),
            ("sep_token_id", self.sep_token_id),
        ];
        for (name, id) in specials {
            if let Some(id) = id {
                if id as usize >= self.vocab_size {
                    return Err(GlmError::InvalidInput(format!(
                        "{name} {id} out of range (vocab_size={})",
                        self.vocab_size
                    )));
                }
            }
        }
        if let Some(&id) = self
            .extra_eos_token_ids
            .iter()
            .find(|&&id| id as usize >= self.vocab_size)
        {
            return Err(GlmError::InvalidInput(format!(
                "extra eos token {id} out of range (vocab_size={})",
                self.vocab_size
            )));
        }
        if let Some(vision) = &self.vision {
            vision.validate()?;
            for id in [vision.boi_token_id, vision.eoi_token_id] {
                if id as usize >= self.vocab_size {
                    return Err(GlmError::InvalidInput(format!(
                        "image marker token {id} out of range (vocab_size={})",
                        self.vocab_size
                    )));
                }
            }
        }
        Ok(())
    }
}
