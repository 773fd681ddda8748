use crate::state_dict::TensorData;
use crate::tensor::Tensor;
use crate::{DType, GlmError, Result};

/// Which keys each query row may attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionMask {
    /// Every query sees every key.
    None,
    /// Query `q` sees keys up to its absolute position `kv_len - q_len + q`.
    Causal,
    /// GLM context attention: rows attend bidirectionally, except that the
    /// final key is only visible to the final query row.
    Prefix,
}

pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;

    // Allocation
    fn allocate_zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    // Data transfer
    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    /// Upload loader-supplied weight bytes.
    fn upload(&self, tensor: &TensorData) -> Result<Self::Tensor> {
        match tensor.dtype {
            DType::F32 => self.copy_from_host_f32(&tensor.to_f32(), &tensor.shape),
            DType::F16 => {
                let data: Vec<half::f16> = tensor
                    .data
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                    .collect();
                self.copy_from_host_f16(&data, &tensor.shape)
            }
            DType::BF16 => {
                let data: Vec<half::bf16> = tensor
                    .data
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                    .collect();
                self.copy_from_host_bf16(&data, &tensor.shape)
            }
        }
    }

    // Core ops
    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    /// Add a `[cols]` bias to every row of a `[rows, cols]` tensor.
    fn add_bias(&self, x: &Self::Tensor, bias: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul_scalar(&self, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;
    fn silu(&self, a: &Self::Tensor) -> Result<Self::Tensor>;
    /// GELU, tanh approximation.
    fn gelu(&self, a: &Self::Tensor) -> Result<Self::Tensor>;

    /// Fused SiLU activation and element-wise multiply: out = silu(gate) * up
    fn fused_silu_mul(&self, gate: &Self::Tensor, up: &Self::Tensor) -> Result<Self::Tensor> {
        let activated = self.silu(gate)?;
        self.mul(&activated, up)
    }

    fn rms_norm(&self, x: &Self::Tensor, weight: &Self::Tensor, eps: f32) -> Result<Self::Tensor>;
    fn layer_norm(
        &self,
        x: &Self::Tensor,
        weight: &Self::Tensor,
        bias: &Self::Tensor,
        eps: f32,
    ) -> Result<Self::Tensor>;
    fn softmax(&self, x: &Self::Tensor, dim: i32) -> Result<Self::Tensor>;
    fn embedding(&self, weight: &Self::Tensor, indices: &[u32]) -> Result<Self::Tensor>;
    fn reshape(&self, x: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor>;
    fn transpose(&self, x: &Self::Tensor, dim0: usize, dim1: usize) -> Result<Self::Tensor>;
    fn cat(&self, tensors: &[&Self::Tensor], dim: usize) -> Result<Self::Tensor>;

    /// Split a concatenated QKV tensor [rows, q_size + kv_size + kv_size] into
    /// (Q [rows, q_size], K [rows, kv_size], V [rows, kv_size]).
    fn split_qkv(
        &self,
        qkv: &Self::Tensor,
        q_size: usize,
        kv_size: usize,
    ) -> Result<(Self::Tensor, Self::Tensor, Self::Tensor)> {
        let rows = qkv.shape()[0];
        let total_cols = q_size + 2 * kv_size;
        let data = self.copy_to_host_f32(qkv)?;
        if data.len() != rows * total_cols {
            return Err(GlmError::shape_mismatch(
                "qkv",
                &[rows, total_cols],
                qkv.shape(),
            ));
        }
        let mut q_data = Vec::with_capacity(rows * q_size);
        let mut k_data = Vec::with_capacity(rows * kv_size);
        let mut v_data = Vec::with_capacity(rows * kv_size);
        for r in 0..rows {
            let row = &data[r * total_cols..(r + 1) * total_cols];
            q_data.extend_from_slice(&row[..q_size]);
            k_data.extend_from_slice(&row[q_size..q_size + kv_size]);
            v_data.extend_from_slice(&row[q_size + kv_size..]);
        }
        Ok((
            self.copy_from_host_f32(&q_data, &[rows, q_size])?,
            self.copy_from_host_f32(&k_data, &[rows, kv_size])?,
            self.copy_from_host_f32(&v_data, &[rows, kv_size])?,
        ))
    }

    /// Multi-head scaled dot-product attention with grouped key/value heads.
    ///
    /// Q: [q_len, num_heads * head_dim]
    /// K: [kv_len, num_kv_heads * head_dim]
    /// V: [kv_len, num_kv_heads * head_dim]
    ///
    /// Returns: [q_len, num_heads * head_dim]
    #[allow(clippy::too_many_arguments)]
    fn attention(
        &self,
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        scale: f32,
        mask: AttentionMask,
    ) -> Result<Self::Tensor> {
        let q_len = q.shape()[0];
        let kv_len = k.shape()[0];
        if kv_len < q_len {
            return Err(GlmError::InvalidInput(format!(
                "attention over {kv_len} keys for {q_len} queries"
            )));
        }
        let heads_per_group = num_heads / num_kv_heads;

        let mut head_outputs = Vec::with_capacity(num_heads);
        for h in 0..num_heads {
            let kv_h = h / heads_per_group;

            let q_head = self.extract_head(q, q_len, num_heads, head_dim, h)?;
            let k_head = self.extract_head(k, kv_len, num_kv_heads, head_dim, kv_h)?;
            let v_head = self.extract_head(v, kv_len, num_kv_heads, head_dim, kv_h)?;

            let k_t = self.transpose(&k_head, 0, 1)?;
            let scores = self.matmul(&q_head, &k_t)?;
            let scores = self.mul_scalar(&scores, scale)?;
            let scores = self.apply_mask(&scores, q_len, kv_len, mask)?;

            let attn = self.softmax(&scores, -1)?;
            head_outputs.push(self.matmul(&attn, &v_head)?);
        }

        let refs: Vec<&Self::Tensor> = head_outputs.iter().collect();
        self.interleave_heads(&refs, q_len, head_dim)
    }

    // ── Attention helpers ───────────────────────────────────────
    // Default impls go through host memory.

    /// Extract head `head` from `[seq_len, num_heads * head_dim]` → `[seq_len, head_dim]`.
    fn extract_head(
        &self,
        tensor: &Self::Tensor,
        seq_len: usize,
        num_heads: usize,
        head_dim: usize,
        head: usize,
    ) -> Result<Self::Tensor> {
        let data = self.copy_to_host_f32(tensor)?;
        let stride = num_heads * head_dim;
        let mut out = Vec::with_capacity(seq_len * head_dim);
        for t in 0..seq_len {
            let start = t * stride + head * head_dim;
            out.extend_from_slice(&data[start..start + head_dim]);
        }
        self.copy_from_host_f32(&out, &[seq_len, head_dim])
    }

    /// Set masked `[q_len, kv_len]` scores to `-inf`.
    fn apply_mask(
        &self,
        scores: &Self::Tensor,
        q_len: usize,
        kv_len: usize,
        mask: AttentionMask,
    ) -> Result<Self::Tensor> {
        match mask {
            AttentionMask::None => Ok(scores.clone()),
            AttentionMask::Causal if q_len == 1 => Ok(scores.clone()),
            AttentionMask::Causal => {
                let mut data = self.copy_to_host_f32(scores)?;
                for q_pos in 0..q_len {
                    let abs_pos = kv_len - q_len + q_pos;
                    for k_pos in (abs_pos + 1)..kv_len {
                        data[q_pos * kv_len + k_pos] = f32::NEG_INFINITY;
                    }
                }
                self.copy_from_host_f32(&data, scores.shape())
            }
            AttentionMask::Prefix => {
                let mut data = self.copy_to_host_f32(scores)?;
                for q_pos in 0..q_len.saturating_sub(1) {
                    data[q_pos * kv_len + kv_len - 1] = f32::NEG_INFINITY;
                }
                self.copy_from_host_f32(&data, scores.shape())
            }
        }
    }

    /// Extract rows `[start_row..start_row+num_rows]` from a tensor.
    /// Input: `[total_rows, cols...]`, Output: `[num_rows, cols...]`.
    fn slice_rows(
        &self,
        tensor: &Self::Tensor,
        start_row: usize,
        num_rows: usize,
    ) -> Result<Self::Tensor> {
        let shape = tensor.shape();
        let cols: usize = if shape.len() > 1 {
            shape[1..].iter().product()
        } else {
            1
        };
        let data = self.copy_to_host_f32(tensor)?;
        let offset = start_row * cols;
        let len = num_rows * cols;
        if offset + len > data.len() {
            return Err(GlmError::InvalidInput(format!(
                "rows {start_row}..{} out of range for shape {shape:?}",
                start_row + num_rows
            )));
        }
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        self.copy_from_host_f32(&data[offset..offset + len], &out_shape)
    }

    /// Interleave per-head `[seq_len, head_dim]` outputs → `[seq_len, num_heads * head_dim]`.
    fn interleave_heads(
        &self,
        heads: &[&Self::Tensor],
        seq_len: usize,
        head_dim: usize,
    ) -> Result<Self::Tensor> {
        let num_heads = heads.len();
        let mut head_data: Vec<Vec<f32>> = Vec::with_capacity(num_heads);
        for h in heads {
            head_data.push(self.copy_to_host_f32(h)?);
        }
        let mut result = Vec::with_capacity(seq_len * num_heads * head_dim);
        for t in 0..seq_len {
            for data in &head_data {
                let offset = t * head_dim;
                result.extend_from_slice(&data[offset..offset + head_dim]);
            }
        }
        self.copy_from_host_f32(&result, &[seq_len, num_heads * head_dim])
    }
}
