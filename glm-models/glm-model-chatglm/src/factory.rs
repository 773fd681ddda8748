use glm_core::{Backend, CausalLM, ModelConfig, ModelType, Result};
use tracing::info;

use crate::chatglm::{self, ChatGLMForCausalLM};
use crate::chatglm2::{self, ChatGLM2ForCausalLM};
use crate::chatglm4v::{self, ChatGLM4VForCausalLM};
use crate::weights::WeightSpecs;

/// Build the unloaded model for `config.model_type` with a cache of
/// `capacity` positions.
pub fn build_model<B: Backend>(
    config: ModelConfig,
    backend: B,
    capacity: usize,
) -> Result<Box<dyn CausalLM>> {
    config.validate()?;
    info!(
        model = config.model_type_name(),
        capacity,
        backend = backend.name(),
        "building model"
    );
    Ok(match config.model_type {
        ModelType::ChatGLM => Box::new(ChatGLMForCausalLM::new(config, backend, capacity)),
        ModelType::ChatGLM2 | ModelType::ChatGLM3 | ModelType::ChatGLM4 => {
            Box::new(ChatGLM2ForCausalLM::new(config, backend, capacity))
        }
        ModelType::ChatGLM4V => Box::new(ChatGLM4VForCausalLM::new(config, backend, capacity)?),
    })
}

/// Tensor names and shapes the family of `config` expects.
pub fn weight_specs(config: &ModelConfig) -> WeightSpecs {
    match config.model_type {
        ModelType::ChatGLM => chatglm::weight_specs(config),
        ModelType::ChatGLM2 | ModelType::ChatGLM3 | ModelType::ChatGLM4 => {
            chatglm2::weight_specs(config)
        }
        ModelType::ChatGLM4V => chatglm4v::weight_specs(config),
    }
}
