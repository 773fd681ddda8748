use glm_core::{Backend, DType, GlmError, Result, Tensor};

use crate::tensor::CpuTensor;

/// Reference backend: every tensor lives in host memory as `f32`, whatever
/// dtype the weights were stored in.
#[derive(Clone, Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(GlmError::shape_mismatch("host buffer", shape, &[data_len]));
    }
    Ok(())
}

fn validate_same_shape(op: &str, a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(GlmError::shape_mismatch(op, a.shape(), b.shape()));
    }
    Ok(())
}

fn validate_row_param(op: &str, x: &CpuTensor, param: &CpuTensor) -> Result<usize> {
    let cols = x.last_dim();
    if param.len() != cols {
        return Err(GlmError::shape_mismatch(op, &[cols], param.shape()));
    }
    Ok(cols)
}

fn map(a: &CpuTensor, f: impl Fn(f32) -> f32) -> CpuTensor {
    CpuTensor::new(a.data().iter().map(|&x| f(x)).collect(), a.shape().to_vec())
}

fn zip_map(a: &CpuTensor, b: &CpuTensor, f: impl Fn(f32, f32) -> f32) -> CpuTensor {
    let data = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    CpuTensor::new(data, a.shape().to_vec())
}

fn gelu_scalar(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    // ── Allocation ──────────────────────────────────────────────

    fn allocate_zeros(&self, shape: &[usize], _dtype: DType) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        Ok(CpuTensor::new(vec![0.0; numel], shape.to_vec()))
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        Ok(CpuTensor::new(data.to_vec(), shape.to_vec()))
    }

    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    // ── Compute ops ────────────────────────────────────────────

    fn matmul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let (m, k) = a.dims2()?;
        let (kb, n) = b.dims2()?;
        if kb != k {
            return Err(GlmError::shape_mismatch("matmul rhs", &[k, n], b.shape()));
        }
        let lhs = a.data();
        let rhs = b.data();
        let mut c = vec![0.0f32; m * n];
        // i-k-j order keeps the inner loop on contiguous rows of both `b` and `c`.
        for i in 0..m {
            let out_row = &mut c[i * n..(i + 1) * n];
            for p in 0..k {
                let a_ip = lhs[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = &rhs[p * n..(p + 1) * n];
                for (o, &bv) in out_row.iter_mut().zip(b_row) {
                    *o += a_ip * bv;
                }
            }
        }
        Ok(CpuTensor::new(c, vec![m, n]))
    }

    fn add(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape("add", a, b)?;
        Ok(zip_map(a, b, |x, y| x + y))
    }

    fn add_bias(&self, x: &CpuTensor, bias: &CpuTensor) -> Result<CpuTensor> {
        let cols = validate_row_param("bias", x, bias)?;
        let b = bias.data();
        let data = x
            .data()
            .chunks(cols)
            .flat_map(|row| row.iter().zip(b).map(|(v, bv)| v + bv))
            .collect();
        Ok(CpuTensor::new(data, x.shape().to_vec()))
    }

    fn mul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape("mul", a, b)?;
        Ok(zip_map(a, b, |x, y| x * y))
    }

    fn mul_scalar(&self, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        Ok(map(a, |x| x * scalar))
    }

    fn silu(&self, a: &CpuTensor) -> Result<CpuTensor> {
        Ok(map(a, |x| x / (1.0 + (-x).exp())))
    }

    fn gelu(&self, a: &CpuTensor) -> Result<CpuTensor> {
        Ok(map(a, gelu_scalar))
    }

    fn fused_silu_mul(&self, gate: &CpuTensor, up: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape("silu_mul", gate, up)?;
        Ok(zip_map(gate, up, |g, u| (g / (1.0 + (-g).exp())) * u))
    }

    fn rms_norm(&self, x: &CpuTensor, weight: &CpuTensor, eps: f32) -> Result<CpuTensor> {
        let cols = validate_row_param("rms_norm weight", x, weight)?;
        let w = weight.data();
        let mut out = Vec::with_capacity(x.len());
        for row in x.data().chunks(cols) {
            let ss: f32 = row.iter().map(|v| v * v).sum();
            let rms = (ss / cols as f32 + eps).sqrt().recip();
            out.extend(row.iter().zip(w).map(|(v, wv)| v * rms * wv));
        }
        Ok(CpuTensor::new(out, x.shape().to_vec()))
    }

    fn layer_norm(
        &self,
        x: &CpuTensor,
        weight: &CpuTensor,
        bias: &CpuTensor,
        eps: f32,
    ) -> Result<CpuTensor> {
        let cols = validate_row_param("layer_norm weight", x, weight)?;
        validate_row_param("layer_norm bias", x, bias)?;
        let w = weight.data();
        let b = bias.data();
        let mut out = Vec::with_capacity(x.len());
        for row in x.data().chunks(cols) {
            let mean = row.iter().sum::<f32>() / cols as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
            let inv_std = (var + eps).sqrt().recip();
            out.extend(
                row.iter()
                    .zip(w.iter().zip(b))
                    .map(|(v, (wv, bv))| (v - mean) * inv_std * wv + bv),
            );
        }
        Ok(CpuTensor::new(out, x.shape().to_vec()))
    }

    fn softmax(&self, x: &CpuTensor, dim: i32) -> Result<CpuTensor> {
        let shape = x.shape();
        let ndim = shape.len() as i32;
        let normalized_dim = if dim < 0 { ndim + dim } else { dim };
        if normalized_dim != ndim - 1 {
            return Err(GlmError::InvalidInput(format!(
                "softmax only supports last dimension (got dim={dim}, ndim={ndim})"
            )));
        }
        let cols = x.last_dim();
        let mut out = Vec::with_capacity(x.len());
        for row in x.data().chunks(cols) {
            let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let start = out.len();
            let mut sum = 0.0f32;
            for &v in row {
                let e = (v - max_val).exp();
                out.push(e);
                sum += e;
            }
            for v in &mut out[start..] {
                *v /= sum;
            }
        }
        Ok(CpuTensor::new(out, shape.to_vec()))
    }

    fn embedding(&self, weight: &CpuTensor, indices: &[u32]) -> Result<CpuTensor> {
        let (vocab_size, dim) = weight.dims2()?;
        let mut out = Vec::with_capacity(indices.len() * dim);
        for &idx in indices {
            if idx as usize >= vocab_size {
                return Err(GlmError::InvalidInput(format!(
                    "token id {idx} out of range (vocab_size={vocab_size})"
                )));
            }
            let start = idx as usize * dim;
            out.extend_from_slice(&weight.data()[start..start + dim]);
        }
        Ok(CpuTensor::new(out, vec![indices.len(), dim]))
    }

    fn reshape(&self, x: &CpuTensor, shape: &[usize]) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        if numel != x.len() {
            return Err(GlmError::shape_mismatch("reshape", shape, x.shape()));
        }
        Ok(CpuTensor {
            data: x.data.clone(),
            shape: shape.to_vec(),
        })
    }

    fn transpose(&self, x: &CpuTensor, dim0: usize, dim1: usize) -> Result<CpuTensor> {
        if !((dim0 == 0 && dim1 == 1) || (dim0 == 1 && dim1 == 0)) {
            return Err(GlmError::InvalidInput(
                "transpose only supports 2-d tensors with dims (0,1)".into(),
            ));
        }
        let (rows, cols) = x.dims2()?;
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Ok(CpuTensor::new(out, vec![cols, rows]))
    }

    fn cat(&self, tensors: &[&CpuTensor], dim: usize) -> Result<CpuTensor> {
        let Some(first) = tensors.first() else {
            return Err(GlmError::InvalidInput("cat of an empty tensor list".into()));
        };
        if dim != 0 {
            return Err(GlmError::InvalidInput("cat only supports dim=0".into()));
        }
        for t in tensors.iter().skip(1) {
            if t.shape().len() != first.shape().len() || t.shape()[1..] != first.shape()[1..] {
                return Err(GlmError::shape_mismatch("cat", first.shape(), t.shape()));
            }
        }
        let total_len: usize = tensors.iter().map(|t| t.len()).sum();
        let mut all_data = Vec::with_capacity(total_len);
        let mut total_rows = 0;
        for t in tensors {
            total_rows += t.shape()[0];
            all_data.extend_from_slice(t.data());
        }
        let mut out_shape = first.shape().to_vec();
        out_shape[0] = total_rows;
        Ok(CpuTensor::new(all_data, out_shape))
    }

    fn slice_rows(&self, tensor: &CpuTensor, start_row: usize, num_rows: usize) -> Result<CpuTensor> {
        let shape = tensor.shape();
        let cols: usize = shape.get(1..).map(|s| s.iter().product()).unwrap_or(1);
        let offset = start_row * cols;
        let len = num_rows * cols;
        let Some(data) = tensor.data().get(offset..offset + len) else {
            return Err(GlmError::InvalidInput(format!(
                "rows {start_row}..{} out of range for shape {shape:?}",
                start_row + num_rows
            )));
        };
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        Ok(CpuTensor::new(data.to_vec(), out_shape))
    }

    fn split_qkv(
        &self,
        qkv: &CpuTensor,
        q_size: usize,
        kv_size: usize,
    ) -> Result<(CpuTensor, CpuTensor, CpuTensor)> {
        let rows = qkv.shape()[0];
        let total_cols = q_size + 2 * kv_size;
        if qkv.len() != rows * total_cols {
            return Err(GlmError::shape_mismatch("qkv", &[rows, total_cols], qkv.shape()));
        }
        let mut q = Vec::with_capacity(rows * q_size);
        let mut k = Vec::with_capacity(rows * kv_size);
        let mut v = Vec::with_capacity(rows * kv_size);
        for row in qkv.data().chunks(total_cols) {
            q.extend_from_slice(&row[..q_size]);
            k.extend_from_slice(&row[q_size..q_size + kv_size]);
            v.extend_from_slice(&row[q_size + kv_size..]);
        }
        Ok((
            CpuTensor::new(q, vec![rows, q_size]),
            CpuTensor::new(k, vec![rows, kv_size]),
            CpuTensor::new(v, vec![rows, kv_size]),
        ))
    }
}
