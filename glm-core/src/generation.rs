use serde::{Deserialize, Serialize};

use crate::{GlmError, Result};

/// Decoding policy for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on prompt plus generated positions.
    pub max_length: usize,
    /// Tokens to produce per call; `-1` means "bounded only by `max_length`".
    pub max_new_tokens: i32,
    /// Size of the context window the prompt and generation must fit into.
    pub max_context_length: usize,
    pub do_sample: bool,
    /// `0` disables top-k filtering.
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    /// `1.0` disables the penalty.
    pub repetition_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 2048,
            max_new_tokens: -1,
            max_context_length: 512,
            do_sample: true,
            top_k: 0,
            top_p: 0.7,
            temperature: 0.95,
            repetition_penalty: 1.0,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with an explicit token budget.
    pub fn greedy(max_new_tokens: i32) -> Self {
        Self {
            do_sample: false,
            max_new_tokens,
            ..Default::default()
        }
    }

    /// The per-call generation cap, if one is set.
    pub fn new_token_limit(&self) -> Option<usize> {
        (self.max_new_tokens > 0).then_some(self.max_new_tokens as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(GlmError::InvalidInput("max_length must be positive".into()));
        }
        if self.max_context_length == 0 {
            return Err(GlmError::InvalidInput(
                "max_context_length must be positive".into(),
            ));
        }
        if self.max_new_tokens == 0 || self.max_new_tokens < -1 {
            return Err(GlmError::InvalidInput(format!(
                "max_new_tokens must be positive or -1, got {}",
                self.max_new_tokens
            )));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty <= 0.0 {
            return Err(GlmError::SamplingPolicy(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if self.do_sample {
            if self.temperature.is_nan() || self.temperature <= 0.0 {
                return Err(GlmError::SamplingPolicy(format!(
                    "temperature must be positive when sampling, got {}",
                    self.temperature
                )));
            }
            if !(0.0..=1.0).contains(&self.top_p) || self.top_p == 0.0 {
                return Err(GlmError::SamplingPolicy(format!(
                    "top_p must be in (0, 1], got {}",
                    self.top_p
                )));
            }
        }
        Ok(())
    }
}
