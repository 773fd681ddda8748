use glm_core::{Backend, Result, Tensor};

use crate::weights::WeightBinder;

/// Dense projection `x @ W (+ b)` with `W` stored as `[in, out]`.
pub struct Linear<B: Backend> {
    weight: B::Tensor,
    bias: Option<B::Tensor>,
}

impl<B: Backend> Linear<B> {
    pub fn new(weight: B::Tensor, bias: Option<B::Tensor>) -> Self {
        Self { weight, bias }
    }

    pub(crate) fn load(
        binder: &WeightBinder<'_, B>,
        prefix: &str,
        out: usize,
        inp: usize,
        bias: bool,
    ) -> Result<Self> {
        let weight = binder.linear_weight(&format!("{prefix}.weight"), out, inp)?;
        let bias = if bias {
            Some(binder.tensor(&format!("{prefix}.bias"), &[out])?)
        } else {
            None
        };
        Ok(Self::new(weight, bias))
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let y = backend.matmul(x, &self.weight)?;
        match &self.bias {
            Some(bias) => backend.add_bias(&y, bias),
            None => Ok(y),
        }
    }
}

/// RMS normalization layer.
pub struct RMSNorm<B: Backend> {
    weight: B::Tensor,
    eps: f32,
}

impl<B: Backend> RMSNorm<B> {
    pub fn new(weight: B::Tensor, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub(crate) fn load(binder: &WeightBinder<'_, B>, prefix: &str, dim: usize, eps: f32) -> Result<Self> {
        Ok(Self::new(binder.tensor(&format!("{prefix}.weight"), &[dim])?, eps))
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        backend.rms_norm(x, &self.weight, self.eps)
    }
}

/// Layer normalization with a learned bias.
pub struct LayerNorm<B: Backend> {
    weight: B::Tensor,
    bias: B::Tensor,
    eps: f32,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(weight: B::Tensor, bias: B::Tensor, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    pub(crate) fn load(binder: &WeightBinder<'_, B>, prefix: &str, dim: usize, eps: f32) -> Result<Self> {
        Ok(Self::new(
            binder.tensor(&format!("{prefix}.weight"), &[dim])?,
            binder.tensor(&format!("{prefix}.bias"), &[dim])?,
            eps,
        ))
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        backend.layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

/// Two-layer GELU feed-forward (`fc1 -> gelu -> fc2`).
pub struct GeluMLP<B: Backend> {
    up: Linear<B>,
    down: Linear<B>,
}

impl<B: Backend> GeluMLP<B> {
    pub fn new(up: Linear<B>, down: Linear<B>) -> Self {
        Self { up, down }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let h = self.up.forward(x, backend)?;
        let h = backend.gelu(&h)?;
        self.down.forward(&h, backend)
    }
}

/// SiLU-gated MLP whose first projection emits `gate ‖ up` side by side.
pub struct SwiGLU<B: Backend> {
    dense_h_to_4h: Linear<B>,
    dense_4h_to_h: Linear<B>,
    ffn_size: usize,
}

impl<B: Backend> SwiGLU<B> {
    pub fn new(dense_h_to_4h: Linear<B>, dense_4h_to_h: Linear<B>, ffn_size: usize) -> Self {
        Self {
            dense_h_to_4h,
            dense_4h_to_h,
            ffn_size,
        }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let h = self.dense_h_to_4h.forward(x, backend)?;
        let (gate, up) = split_columns(&h, self.ffn_size, backend)?;
        let fused = backend.fused_silu_mul(&gate, &up)?;
        self.dense_4h_to_h.forward(&fused, backend)
    }
}

/// Split `[rows, 2 * width]` into its left and right `[rows, width]` halves.
pub(crate) fn split_columns<B: Backend>(
    x: &B::Tensor,
    width: usize,
    backend: &B,
) -> Result<(B::Tensor, B::Tensor)> {
    let (rows, cols) = x.dims2()?;
    if cols != 2 * width {
        return Err(glm_core::GlmError::shape_mismatch(
            "gate/up projection",
            &[rows, 2 * width],
            x.shape(),
        ));
    }
    let data = backend.copy_to_host_f32(x)?;
    let mut left = Vec::with_capacity(rows * width);
    let mut right = Vec::with_capacity(rows * width);
    for row in data.chunks_exact(cols) {
        left.extend_from_slice(&row[..width]);
        right.extend_from_slice(&row[width..]);
    }
    Ok((
        backend.copy_from_host_f32(&left, &[rows, width])?,
        backend.copy_from_host_f32(&right, &[rows, width])?,
    ))
}
