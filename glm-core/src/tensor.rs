use crate::{DType, GlmError, Result};

pub trait Tensor: Clone + Send + Sync + std::fmt::Debug {
    fn shape(&self) -> &[usize];
    fn dtype(&self) -> DType;
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }
    fn size_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
    /// `(rows, cols)` of a 2-D tensor.
    fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(GlmError::InvalidInput(format!(
                "expected a 2-d tensor, got shape {other:?}"
            ))),
        }
    }
}
