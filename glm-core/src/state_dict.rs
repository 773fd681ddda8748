use std::collections::HashMap;

use crate::types::DType;
use crate::{GlmError, Result};

/// Raw weight data as supplied by an external loader.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Little-endian element bytes, `numel * dtype.size_in_bytes()` long.
    pub data: Vec<u8>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(GlmError::InvalidInput(format!(
                "{dtype:?} tensor of shape {shape:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    pub fn from_f32(values: &[f32], shape: &[usize]) -> Result<Self> {
        Self::new(
            shape.to_vec(),
            DType::F32,
            bytemuck::cast_slice::<f32, u8>(values).to_vec(),
        )
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the stored elements to f32.
    pub fn to_f32(&self) -> Vec<f32> {
        match self.dtype {
            // pod_collect_to_vec copies, so unaligned byte buffers are fine.
            DType::F32 => bytemuck::pod_collect_to_vec(&self.data),
            DType::F16 => bytemuck::pod_collect_to_vec::<u8, half::f16>(&self.data)
                .into_iter()
                .map(half::f16::to_f32)
                .collect(),
            DType::BF16 => bytemuck::pod_collect_to_vec::<u8, half::bf16>(&self.data)
                .into_iter()
                .map(half::bf16::to_f32)
                .collect(),
        }
    }
}

/// Mapping from parameter name to weight tensor.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, TensorData>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: TensorData) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorData> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    /// Look up `name` and check it has `shape`.
    pub fn expect(&self, name: &str, shape: &[usize]) -> Result<&TensorData> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| GlmError::MissingWeight(name.to_string()))?;
        if tensor.shape != shape {
            return Err(GlmError::shape_mismatch(name, shape, &tensor.shape));
        }
        Ok(tensor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}
