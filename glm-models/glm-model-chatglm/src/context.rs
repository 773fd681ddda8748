use glm_core::{Backend, GlmError, KvCache, Result};
use glm_kvcache::ArenaKvCache;

/// Check a pass of `required` new positions fits the session.
pub(crate) fn check_context(
    cache: &ArenaKvCache,
    input_len: usize,
    n_past: usize,
    n_ctx: usize,
    required: usize,
) -> Result<()> {
    if input_len == 0 {
        return Err(GlmError::InvalidInput("empty input_ids".into()));
    }
    if n_past != cache.len() {
        return Err(GlmError::InvalidInput(format!(
            "n_past {n_past} does not match the cache length {}",
            cache.len()
        )));
    }
    if n_ctx > cache.capacity() {
        return Err(GlmError::ContextOverflow {
            required: n_ctx,
            capacity: cache.capacity(),
        });
    }
    if n_past + required > n_ctx {
        return Err(GlmError::ContextOverflow {
            required: n_past + required,
            capacity: n_ctx,
        });
    }
    Ok(())
}

/// Stage this pass's key/value rows for `layer` and return the full
/// `[n_past + rows, kv_dim]` keys and values as tensors.
pub(crate) fn append_kv<B: Backend>(
    cache: &mut ArenaKvCache,
    layer: usize,
    n_past: usize,
    key: &[f32],
    value: &[f32],
    backend: &B,
) -> Result<(B::Tensor, B::Tensor)> {
    let kv_dim = cache.kv_dim();
    cache.write(layer, n_past, key, value)?;
    let total = n_past + key.len() / kv_dim;
    let (k_all, v_all) = cache.read(layer, total)?;
    Ok((
        backend.copy_from_host_f32(k_all, &[total, kv_dim])?,
        backend.copy_from_host_f32(v_all, &[total, kv_dim])?,
    ))
}

/// Take the last row of `[rows, cols]` hidden states.
pub(crate) fn last_row<B: Backend>(hidden: &B::Tensor, rows: usize, backend: &B) -> Result<B::Tensor> {
    backend.slice_rows(hidden, rows - 1, 1)
}

pub(crate) fn not_loaded() -> GlmError {
    GlmError::ModelLoad("model weights are not loaded".into())
}
