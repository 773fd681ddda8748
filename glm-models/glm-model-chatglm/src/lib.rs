//! ChatGLM model family: ChatGLM, ChatGLM2/3/4 and GLM-4V.

pub mod chatglm;
pub mod chatglm2;
pub mod chatglm4v;
mod context;
pub mod factory;
pub mod layers;
pub mod rope;
pub mod vision;
pub mod weights;

pub use chatglm::ChatGLMForCausalLM;
pub use chatglm2::ChatGLM2ForCausalLM;
pub use chatglm4v::ChatGLM4VForCausalLM;
pub use factory::{build_model, weight_specs};
pub use weights::WeightSpecs;
