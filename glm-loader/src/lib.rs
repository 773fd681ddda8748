//! GLM loader: SafeTensors weight loading and `config.json` parsing.

pub mod config;
pub mod safetensors;

pub use config::{EosTokenId, GlmConfig, GlmVisionConfig};
pub use self::safetensors::SafeTensorsLoader;
