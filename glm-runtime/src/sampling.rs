use std::collections::HashSet;

use glm_core::{GenerationConfig, GlmError, Result, SampleResult, TokenSampler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Logit processor pipeline: applies penalties and temperature in the logit
/// domain. Top-k, top-p and the draw happen in `CpuSampler`.
pub struct LogitProcessorPipeline {
    temperature: f32,
    repetition_penalty: f32,
}

impl LogitProcessorPipeline {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            repetition_penalty: config.repetition_penalty,
        }
    }

    /// Penalize every distinct token of `history`. Modifies `logits` in place.
    pub fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[u32]) {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        // Penalize each unique token exactly once.
        let mut seen = HashSet::new();
        for &token_id in history {
            if !seen.insert(token_id) {
                continue;
            }
            let Some(logit) = logits.get_mut(token_id as usize) else {
                continue;
            };
            if *logit > 0.0 {
                *logit /= self.repetition_penalty;
            } else {
                *logit *= self.repetition_penalty;
            }
        }
    }

    pub fn apply_temperature(&self, logits: &mut [f32]) {
        if self.temperature <= 0.0 || (self.temperature - 1.0).abs() < f32::EPSILON {
            return;
        }
        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }
    }
}

/// CPU sampler: greedy argmax or top-k/top-p multinomial sampling with an
/// owned random generator.
pub struct CpuSampler {
    rng: StdRng,
}

impl CpuSampler {
    /// Reproducible draws: equal seeds give equal token streams.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    fn greedy(&self, logits: &[f32]) -> Result<SampleResult> {
        // Strict `>` keeps the first maximum on ties.
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in logits.iter().enumerate() {
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        let (token_id, _) = best.ok_or_else(|| GlmError::InvalidInput("empty logits".into()))?;

        // Logprob from the normalized probability, matching the sampled path.
        let probs = softmax(logits);
        Ok(SampleResult {
            token_id: token_id as u32,
            logprob: ln_or_neg_inf(probs[token_id]),
        })
    }

    fn multinomial(&mut self, candidates: &[(usize, f32)]) -> SampleResult {
        let r: f32 = self.rng.r#gen();
        let mut cumulative = 0.0;
        for &(id, p) in candidates {
            cumulative += p;
            if cumulative >= r {
                return SampleResult {
                    token_id: id as u32,
                    logprob: ln_or_neg_inf(p),
                };
            }
        }
        // Rounding left the total just below `r`: take the last kept id.
        let (id, p) = candidates[candidates.len() - 1];
        SampleResult {
            token_id: id as u32,
            logprob: ln_or_neg_inf(p),
        }
    }
}

impl TokenSampler for CpuSampler {
    /// Sample one token from a `vocab_size` logits row.
    ///
    /// Without `do_sample` this is argmax. Otherwise temperature, top-k,
    /// softmax and top-p narrow the candidates before a categorical draw.
    fn sample(
        &mut self,
        logits: &[f32],
        config: &GenerationConfig,
        history: &[u32],
    ) -> Result<SampleResult> {
        config.validate()?;
        if logits.is_empty() {
            return Err(GlmError::InvalidInput("empty logits".into()));
        }
        let pipeline = LogitProcessorPipeline::from_config(config);
        let mut processed = logits.to_vec();
        pipeline.apply_repetition_penalty(&mut processed, history);

        if !config.do_sample {
            return self.greedy(&processed);
        }

        pipeline.apply_temperature(&mut processed);

        // Stable sort: ties keep ascending id order.
        let mut order: Vec<usize> = (0..processed.len()).collect();
        order.sort_by(|&a, &b| {
            processed[b]
                .partial_cmp(&processed[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if config.top_k > 0 {
            order.truncate(config.top_k);
        }

        let kept: Vec<f32> = order.iter().map(|&i| processed[i]).collect();
        let probs = softmax(&kept);
        let mut candidates: Vec<(usize, f32)> = order.into_iter().zip(probs).collect();
        apply_top_p(&mut candidates, config.top_p);

        let sum: f32 = candidates.iter().map(|&(_, p)| p).sum();
        if sum.is_nan() || sum <= 0.0 {
            return self.greedy(&processed);
        }
        for (_, p) in candidates.iter_mut() {
            *p /= sum;
        }
        Ok(self.multinomial(&candidates))
    }
}

fn ln_or_neg_inf(p: f32) -> f32 {
    if p > 0.0 {
        p.ln()
    } else {
        f32::NEG_INFINITY
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Keep the shortest descending-probability prefix whose mass reaches
/// `top_p`. `candidates` must already be sorted by probability.
fn apply_top_p(candidates: &mut Vec<(usize, f32)>, top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let mut cumulative = 0.0;
    let mut cutoff = candidates.len();
    for (i, &(_, p)) in candidates.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    candidates.truncate(cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_p_keeps_prefix_reaching_threshold() {
        let mut c = vec![(3, 0.5), (0, 0.25), (1, 0.25)];
        apply_top_p(&mut c, 0.75);
        assert_eq!(c, vec![(3, 0.5), (0, 0.25)]);
    }

    #[test]
    fn top_p_of_one_keeps_everything() {
        let mut c = vec![(0, 0.9), (1, 0.1)];
        apply_top_p(&mut c, 1.0);
        assert_eq!(c.len(), 2);
    }
}
