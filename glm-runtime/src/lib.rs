//! GLM runtime: decoding policy, token streaming and the chat pipeline.

pub mod pipeline;
pub mod sampling;
pub mod streamer;

pub use pipeline::{ChatSession, Pipeline};
pub use sampling::{CpuSampler, LogitProcessorPipeline};
pub use streamer::{PerfStats, PerfStreamer, Streamer, StreamerGroup, TextStreamer};
