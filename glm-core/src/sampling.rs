use crate::{GenerationConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleResult {
    pub token_id: u32,
    pub logprob: f32,
}

/// Decoding policy: picks the next token from a logits row.
///
/// `history` is every token already in the session context (prompt and
/// generated), used by repetition penalties.
pub trait TokenSampler {
    fn sample(
        &mut self,
        logits: &[f32],
        config: &GenerationConfig,
        history: &[u32],
    ) -> Result<SampleResult>;
}
