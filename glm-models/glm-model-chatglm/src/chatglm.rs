//! ChatGLM-6B: LayerNorm blocks with 2-D rotary positions and GLM prefix
//! attention over the prompt.

use glm_core::{
    AttentionMask, Backend, CausalLM, GlmError, GraphInputs, Image, KvCache, ModelConfig,
    PositionIds, Result, StateDict,
};
use glm_kvcache::ArenaKvCache;
use tracing::{debug, info};

use crate::context::{append_kv, check_context, last_row, not_loaded};
use crate::layers::{GeluMLP, LayerNorm, Linear};
use crate::rope::{RopeStyle, RotaryEmbedding};
use crate::weights::{WeightBinder, WeightSpecs};

const ROPE_BASE: f32 = 10000.0;

struct GlmBlock<B: Backend> {
    input_layernorm: LayerNorm<B>,
    query_key_value: Linear<B>,
    dense: Linear<B>,
    post_attention_layernorm: LayerNorm<B>,
    mlp: GeluMLP<B>,
}

struct ChatGLMWeights<B: Backend> {
    word_embeddings: B::Tensor,
    layers: Vec<GlmBlock<B>>,
    final_layernorm: LayerNorm<B>,
    /// Tied to `word_embeddings`, stored as `[hidden, vocab]`.
    lm_head: B::Tensor,
}

pub struct ChatGLMForCausalLM<B: Backend> {
    config: ModelConfig,
    backend: B,
    rope: RotaryEmbedding,
    weights: Option<ChatGLMWeights<B>>,
    cache: ArenaKvCache,
    /// `[gMASK]` position of the current session.
    mask_position: Option<usize>,
}

impl<B: Backend> ChatGLMForCausalLM<B> {
    /// Build an unloaded model whose cache holds `capacity` positions.
    pub fn new(config: ModelConfig, backend: B, capacity: usize) -> Self {
        // Each half of a head carries one of the two position ids.
        let rope = RotaryEmbedding::new(config.head_dim() / 2, ROPE_BASE, RopeStyle::Neox);
        let cache = ArenaKvCache::new(config.num_hidden_layers, config.kv_dim(), capacity);
        Self {
            config,
            backend,
            rope,
            weights: None,
            cache,
            mask_position: None,
        }
    }

    fn bind(&self, binder: &WeightBinder<'_, B>) -> Result<ChatGLMWeights<B>> {
        let config = &self.config;
        let hidden = config.hidden_size;
        let eps = config.norm_eps;
        let word_embeddings = binder.tensor(
            "transformer.word_embeddings.weight",
            &[config.vocab_size, hidden],
        )?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("transformer.layers.{i}");
            layers.push(GlmBlock {
                input_layernorm: LayerNorm::load(binder, &format!("{p}.input_layernorm"), hidden, eps)?,
                query_key_value: Linear::load(
                    binder,
                    &format!("{p}.attention.query_key_value"),
                    3 * hidden,
                    hidden,
                    true,
                )?,
                dense: Linear::load(binder, &format!("{p}.attention.dense"), hidden, hidden, true)?,
                post_attention_layernorm: LayerNorm::load(
                    binder,
                    &format!("{p}.post_attention_layernorm"),
                    hidden,
                    eps,
                )?,
                mlp: GeluMLP::new(
                    Linear::load(
                        binder,
                        &format!("{p}.mlp.dense_h_to_4h"),
                        config.intermediate_size,
                        hidden,
                        true,
                    )?,
                    Linear::load(
                        binder,
                        &format!("{p}.mlp.dense_4h_to_h"),
                        hidden,
                        config.intermediate_size,
                        true,
                    )?,
                ),
            });
        }
        let final_layernorm = LayerNorm::load(binder, "transformer.final_layernorm", hidden, eps)?;
        let lm_head = binder.backend().transpose(&word_embeddings, 0, 1)?;
        Ok(ChatGLMWeights {
            word_embeddings,
            layers,
            final_layernorm,
            lm_head,
        })
    }

    /// Split per-head `[q, k, v]` projections into `[rows, hidden]` buffers.
    fn split_headwise_qkv(&self, qkv: &[f32], rows: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let hidden = self.config.hidden_size;
        let head_dim = self.config.head_dim();
        let mut q = Vec::with_capacity(rows * hidden);
        let mut k = Vec::with_capacity(rows * hidden);
        let mut v = Vec::with_capacity(rows * hidden);
        for row in qkv.chunks_exact(3 * hidden) {
            for head in row.chunks_exact(3 * head_dim) {
                q.extend_from_slice(&head[..head_dim]);
                k.extend_from_slice(&head[head_dim..2 * head_dim]);
                v.extend_from_slice(&head[2 * head_dim..]);
            }
        }
        (q, k, v)
    }

    /// Rotate the first half of each head by `positions` and the second
    /// half by `block_positions`.
    fn apply_rope_2d(&self, x: &mut [f32], positions: &[usize], block_positions: &[usize]) {
        let heads = self.config.num_attention_heads;
        let head_dim = self.config.head_dim();
        self.rope.apply(x, positions, heads, head_dim, 0);
        self.rope.apply(x, block_positions, heads, head_dim, self.rope.dim());
    }
}

/// Every tensor ChatGLM binds, with its stored shape.
pub fn weight_specs(config: &ModelConfig) -> WeightSpecs {
    let hidden = config.hidden_size;
    let mut specs = WeightSpecs::new();
    let ffn = config.intermediate_size;
    specs.push("transformer.word_embeddings.weight", &[config.vocab_size, hidden]);
    for i in 0..config.num_hidden_layers {
        let p = format!("transformer.layers.{i}");
        specs.layer_norm(&format!("{p}.input_layernorm"), hidden);
        specs.linear(&format!("{p}.attention.query_key_value"), 3 * hidden, hidden, true);
        specs.linear(&format!("{p}.attention.dense"), hidden, hidden, true);
        specs.layer_norm(&format!("{p}.post_attention_layernorm"), hidden);
        specs.linear(&format!("{p}.mlp.dense_h_to_4h"), ffn, hidden, true);
        specs.linear(&format!("{p}.mlp.dense_4h_to_h"), hidden, ffn, true);
    }
    specs.layer_norm("transformer.final_layernorm", hidden);
    specs
}

/// GLM 2-D positions for absolute positions `start..start+len` with the
/// `[gMASK]` slot at `mask_position`.
pub fn block_position_ids(start: usize, len: usize, mask_position: usize) -> PositionIds {
    let range = start..start + len;
    PositionIds::Block {
        positions: range.clone().map(|p| p.min(mask_position)).collect(),
        block_positions: range.map(|p| p.saturating_sub(mask_position)).collect(),
    }
}

impl<B: Backend> CausalLM for ChatGLMForCausalLM<B> {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        weight_specs(&self.config).validate(state_dict)?;
        let binder = WeightBinder::new(state_dict, &self.backend);
        let weights = self.bind(&binder)?;
        self.weights = Some(weights);
        info!(
            layers = self.config.num_hidden_layers,
            backend = self.backend.name(),
            "loaded ChatGLM weights"
        );
        Ok(())
    }

    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        _image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs> {
        check_context(&self.cache, input_ids.len(), n_past, n_ctx, input_ids.len())?;
        let mask_position = if n_past == 0 {
            // Prompts end with `[gMASK] <sop>`.
            input_ids.len().checked_sub(2).ok_or_else(|| {
                GlmError::InvalidInput(format!(
                    "ChatGLM prompt needs [gMASK] and <sop>, got {} tokens",
                    input_ids.len()
                ))
            })?
        } else {
            self.mask_position.ok_or_else(|| {
                GlmError::InvalidInput("decode step without a prefilled prompt".into())
            })?
        };
        Ok(GraphInputs {
            input_ids: input_ids.to_vec(),
            position_ids: block_position_ids(n_past, input_ids.len(), mask_position),
            pixel_values: None,
            mask_position: Some(mask_position),
            n_past,
            n_ctx,
            num_positions: input_ids.len(),
        })
    }

    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Vec<f32>> {
        let weights = self.weights.as_ref().ok_or_else(not_loaded)?;
        let PositionIds::Block {
            positions,
            block_positions,
        } = &inputs.position_ids
        else {
            return Err(GlmError::InvalidInput(
                "ChatGLM needs block position ids".into(),
            ));
        };
        check_context(
            &self.cache,
            inputs.input_ids.len(),
            inputs.n_past,
            inputs.n_ctx,
            inputs.num_positions,
        )?;
        let backend = &self.backend;
        let rows = inputs.input_ids.len();
        let n_past = inputs.n_past;
        let heads = self.config.num_attention_heads;
        let head_dim = self.config.head_dim();
        let hidden_size = self.config.hidden_size;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let alpha = (2.0 * self.config.num_hidden_layers as f32).sqrt();
        let mask = if is_decoding {
            AttentionMask::None
        } else {
            AttentionMask::Prefix
        };
        debug!(rows, n_past, is_decoding, "ChatGLM forward");

        let mut hidden = backend.embedding(&weights.word_embeddings, &inputs.input_ids)?;
        for (i, layer) in weights.layers.iter().enumerate() {
            let normed = layer.input_layernorm.forward(&hidden, backend)?;
            let qkv = layer.query_key_value.forward(&normed, backend)?;
            let qkv = backend.copy_to_host_f32(&qkv)?;
            let (mut q, mut k, v) = self.split_headwise_qkv(&qkv, rows);
            self.apply_rope_2d(&mut q, positions, block_positions);
            self.apply_rope_2d(&mut k, positions, block_positions);

            let (k_all, v_all) = append_kv(&mut self.cache, i, n_past, &k, &v, backend)?;
            let q = backend.copy_from_host_f32(&q, &[rows, hidden_size])?;
            let attn = backend.attention(&q, &k_all, &v_all, heads, heads, head_dim, scale, mask)?;
            let attn = layer.dense.forward(&attn, backend)?;

            // Residuals scale the normalized input, not the raw stream.
            hidden = backend.add(&backend.mul_scalar(&normed, alpha)?, &attn)?;
            let normed = layer.post_attention_layernorm.forward(&hidden, backend)?;
            let mlp = layer.mlp.forward(&normed, backend)?;
            hidden = backend.add(&backend.mul_scalar(&normed, alpha)?, &mlp)?;
        }

        let last = last_row(&hidden, rows, backend)?;
        let last = weights.final_layernorm.forward(&last, backend)?;
        let logits = backend.matmul(&last, &weights.lm_head)?;
        let logits = backend.copy_to_host_f32(&logits)?;

        self.cache.commit(n_past + inputs.num_positions)?;
        self.mask_position = inputs.mask_position;
        Ok(logits)
    }

    fn n_past(&self) -> usize {
        self.cache.len()
    }

    fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    fn reset_cache(&mut self) {
        self.cache.reset();
        self.mask_position = None;
    }
}
