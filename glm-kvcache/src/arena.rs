//! Arena KV cache: every layer's keys and values live in one host buffer
//! sized for `capacity` positions up front, so appending never reallocates.

use glm_core::{GlmError, KvCache, Result};
use tracing::debug;

struct LayerArena {
    /// `[capacity, kv_dim]` keys
    key: Vec<f32>,
    /// `[capacity, kv_dim]` values
    value: Vec<f32>,
}

pub struct ArenaKvCache {
    layers: Vec<LayerArena>,
    kv_dim: usize,
    capacity: usize,
    committed: usize,
}

impl ArenaKvCache {
    pub fn new(num_layers: usize, kv_dim: usize, capacity: usize) -> Self {
        debug!(num_layers, kv_dim, capacity, "allocating kv arena");
        let layers = (0..num_layers)
            .map(|_| LayerArena {
                key: vec![0.0; capacity * kv_dim],
                value: vec![0.0; capacity * kv_dim],
            })
            .collect();
        Self {
            layers,
            kv_dim,
            capacity,
            committed: 0,
        }
    }

    fn layer(&self, layer: usize) -> Result<&LayerArena> {
        self.layers.get(layer).ok_or_else(|| {
            GlmError::InvalidInput(format!(
                "layer {layer} exceeds num_layers {}",
                self.layers.len()
            ))
        })
    }
}

impl KvCache for ArenaKvCache {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.committed
    }

    fn write(&mut self, layer: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<()> {
        if key.len() != value.len() || key.len() % self.kv_dim != 0 {
            return Err(GlmError::shape_mismatch(
                "kv rows",
                &[key.len() / self.kv_dim.max(1), self.kv_dim],
                &[value.len()],
            ));
        }
        if pos < self.committed {
            return Err(GlmError::InvalidInput(format!(
                "position {pos} is already committed (cache length {})",
                self.committed
            )));
        }
        let rows = key.len() / self.kv_dim;
        if pos + rows > self.capacity {
            return Err(GlmError::ContextOverflow {
                required: pos + rows,
                capacity: self.capacity,
            });
        }
        let kv_dim = self.kv_dim;
        let arena = self.layers.get_mut(layer).ok_or_else(|| {
            GlmError::InvalidInput(format!("layer {layer} exceeds num_layers"))
        })?;
        let range = pos * kv_dim..(pos + rows) * kv_dim;
        arena.key[range.clone()].copy_from_slice(key);
        arena.value[range].copy_from_slice(value);
        Ok(())
    }

    fn read(&self, layer: usize, len: usize) -> Result<(&[f32], &[f32])> {
        if len > self.capacity {
            return Err(GlmError::ContextOverflow {
                required: len,
                capacity: self.capacity,
            });
        }
        let arena = self.layer(layer)?;
        let end = len * self.kv_dim;
        Ok((&arena.key[..end], &arena.value[..end]))
    }

    fn commit(&mut self, len: usize) -> Result<()> {
        if len < self.committed {
            return Err(GlmError::InvalidInput(format!(
                "cannot roll back cache from {} to {len}",
                self.committed
            )));
        }
        if len > self.capacity {
            return Err(GlmError::ContextOverflow {
                required: len,
                capacity: self.capacity,
            });
        }
        self.committed = len;
        Ok(())
    }

    fn reset(&mut self) {
        self.committed = 0;
    }
}
