use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum GlmError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Context overflow: {required} positions required, capacity is {capacity}")]
    ContextOverflow { required: usize, capacity: usize },

    #[error("Sampling policy error: {0}")]
    SamplingPolicy(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(DType),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes callers can match on without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedFormat,
    MissingWeight,
    ShapeMismatch,
    ContextOverflow,
    SamplingPolicyError,
    Tokenizer,
    Io,
    Internal,
}

impl GlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GlmError::InvalidInput(_) => ErrorKind::InvalidInput,
            GlmError::UnsupportedFormat(_) | GlmError::UnsupportedDtype(_) => {
                ErrorKind::UnsupportedFormat
            }
            GlmError::MissingWeight(_) => ErrorKind::MissingWeight,
            GlmError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            GlmError::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            GlmError::SamplingPolicy(_) => ErrorKind::SamplingPolicyError,
            GlmError::Tokenizer(_) | GlmError::Template(_) => ErrorKind::Tokenizer,
            GlmError::Io(_) | GlmError::Json(_) | GlmError::ModelLoad(_) => ErrorKind::Io,
            GlmError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        GlmError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GlmError>;
