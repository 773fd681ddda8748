//! GLM core types, traits, and error definitions.

pub mod backend;
pub mod error;
pub mod generation;
pub mod image;
pub mod kvcache;
pub mod message;
pub mod model;
pub mod sampling;
pub mod state_dict;
pub mod tensor;
pub mod tokenizer;
pub mod types;

pub use backend::{AttentionMask, Backend};
pub use error::{ErrorKind, GlmError, Result};
pub use generation::GenerationConfig;
pub use image::Image;
pub use kvcache::{CacheUsage, KvCache};
pub use message::{ChatMessage, CodeMessage, FunctionMessage, Role, ToolCallMessage};
pub use model::{CausalLM, GraphInputs, NextToken, PositionIds};
pub use sampling::{SampleResult, TokenSampler};
pub use state_dict::{StateDict, TensorData};
pub use tensor::Tensor;
pub use tokenizer::Tokenizer;
pub use types::*;
