//! GLM KV cache: a preallocated per-layer key/value arena for one sequence.

pub mod arena;

pub use arena::ArenaKvCache;
