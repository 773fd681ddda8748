use crate::Result;

/// Occupancy snapshot of a key/value cache, in positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub capacity: usize,
    pub committed: usize,
}

impl CacheUsage {
    pub fn free_positions(&self) -> usize {
        self.capacity.saturating_sub(self.committed)
    }

    pub fn usage_ratio(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.committed as f32 / self.capacity as f32
    }
}

/// Per-layer key/value storage for a single sequence, addressed by position.
///
/// Rows `[0, len())` are committed and immutable until `reset`. A forward pass
/// stages rows at or beyond the committed length with `write`, reads them back
/// through `read`, and makes them permanent with `commit` once every layer has
/// succeeded. Staged rows that are never committed are simply overwritten by
/// the next pass.
pub trait KvCache: Send + Sync {
    fn num_layers(&self) -> usize;

    /// Width of one key (or value) row: `num_kv_heads * head_dim`.
    fn kv_dim(&self) -> usize;

    /// Maximum number of positions the cache can hold.
    fn capacity(&self) -> usize;

    /// Number of committed positions (the next write position).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage key/value rows for `layer` starting at position `pos`.
    /// `key` and `value` hold `rows * kv_dim` values each.
    fn write(&mut self, layer: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<()>;

    /// Rows `[0, len)` of `layer`'s keys and values, staged rows included.
    fn read(&self, layer: usize, len: usize) -> Result<(&[f32], &[f32])>;

    /// Mark positions `[0, len)` as committed.
    fn commit(&mut self, len: usize) -> Result<()>;

    /// Forget every position. Starts a new session.
    fn reset(&mut self);

    fn usage(&self) -> CacheUsage {
        CacheUsage {
            capacity: self.capacity(),
            committed: self.len(),
        }
    }
}
