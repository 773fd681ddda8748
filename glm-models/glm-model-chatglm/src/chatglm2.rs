//! ChatGLM2 / ChatGLM3 / GLM-4 text model: RMSNorm pre-norm blocks with
//! grouped-query attention, half-head rotary embedding and SwiGLU.

use glm_core::{
    AttentionMask, Backend, CausalLM, GlmError, GraphInputs, Image, KvCache, ModelConfig,
    PositionIds, Result, StateDict,
};
use glm_kvcache::ArenaKvCache;
use tracing::{debug, info};

use crate::context::{append_kv, check_context, last_row, not_loaded};
use crate::layers::{Linear, RMSNorm, SwiGLU};
use crate::rope::{RopeStyle, RotaryEmbedding};
use crate::weights::{WeightBinder, WeightSpecs};

struct GlmBlock<B: Backend> {
    input_layernorm: RMSNorm<B>,
    query_key_value: Linear<B>,
    dense: Linear<B>,
    post_attention_layernorm: RMSNorm<B>,
    mlp: SwiGLU<B>,
}

/// Embedding, encoder stack and output head shared by the text-only and
/// vision-language variants.
pub(crate) struct Glm2Transformer<B: Backend> {
    word_embeddings: B::Tensor,
    layers: Vec<GlmBlock<B>>,
    final_layernorm: RMSNorm<B>,
    /// `[hidden, vocab]`
    output_layer: B::Tensor,
}

impl<B: Backend> Glm2Transformer<B> {
    pub(crate) fn load(binder: &WeightBinder<'_, B>, config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let ffn = config.intermediate_size;
        let qkv = hidden + 2 * config.kv_dim();
        let eps = config.norm_eps;
        let word_embeddings = binder.tensor(
            "transformer.embedding.word_embeddings.weight",
            &[config.vocab_size, hidden],
        )?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("transformer.encoder.layers.{i}");
            layers.push(GlmBlock {
                input_layernorm: RMSNorm::load(binder, &format!("{p}.input_layernorm"), hidden, eps)?,
                query_key_value: Linear::load(
                    binder,
                    &format!("{p}.self_attention.query_key_value"),
                    qkv,
                    hidden,
                    true,
                )?,
                dense: Linear::load(binder, &format!("{p}.self_attention.dense"), hidden, hidden, false)?,
                post_attention_layernorm: RMSNorm::load(
                    binder,
                    &format!("{p}.post_attention_layernorm"),
                    hidden,
                    eps,
                )?,
                mlp: SwiGLU::new(
                    Linear::load(binder, &format!("{p}.mlp.dense_h_to_4h"), 2 * ffn, hidden, false)?,
                    Linear::load(binder, &format!("{p}.mlp.dense_4h_to_h"), hidden, ffn, false)?,
                    ffn,
                ),
            });
        }
        Ok(Self {
            word_embeddings,
            layers,
            final_layernorm: RMSNorm::load(binder, "transformer.encoder.final_layernorm", hidden, eps)?,
            output_layer: binder.linear_weight(
                "transformer.output_layer.weight",
                config.vocab_size,
                hidden,
            )?,
        })
    }

    pub(crate) fn embed(&self, input_ids: &[u32], backend: &B) -> Result<B::Tensor> {
        backend.embedding(&self.word_embeddings, input_ids)
    }

    /// Run the encoder over `[rows, hidden]` embeddings and return the
    /// last row's logits. Key/value rows are staged at `n_past..`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn forward_embeddings(
        &self,
        hidden: B::Tensor,
        positions: &[usize],
        n_past: usize,
        cache: &mut ArenaKvCache,
        rope: &RotaryEmbedding,
        config: &ModelConfig,
        backend: &B,
    ) -> Result<Vec<f32>> {
        let rows = positions.len();
        let heads = config.num_attention_heads;
        let kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();
        let q_size = heads * head_dim;
        let kv_size = config.kv_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let mut hidden = hidden;
        for (i, layer) in self.layers.iter().enumerate() {
            let normed = layer.input_layernorm.forward(&hidden, backend)?;
            let qkv = layer.query_key_value.forward(&normed, backend)?;
            let (q, k, v) = backend.split_qkv(&qkv, q_size, kv_size)?;

            let mut q = backend.copy_to_host_f32(&q)?;
            let mut k = backend.copy_to_host_f32(&k)?;
            let v = backend.copy_to_host_f32(&v)?;
            rope.apply(&mut q, positions, heads, head_dim, 0);
            rope.apply(&mut k, positions, kv_heads, head_dim, 0);

            let (k_all, v_all) = append_kv(cache, i, n_past, &k, &v, backend)?;
            let q = backend.copy_from_host_f32(&q, &[rows, q_size])?;
            let attn = backend.attention(
                &q,
                &k_all,
                &v_all,
                heads,
                kv_heads,
                head_dim,
                scale,
                AttentionMask::Causal,
            )?;
            let attn = layer.dense.forward(&attn, backend)?;
            hidden = backend.add(&hidden, &attn)?;

            let normed = layer.post_attention_layernorm.forward(&hidden, backend)?;
            let mlp = layer.mlp.forward(&normed, backend)?;
            hidden = backend.add(&hidden, &mlp)?;
        }

        let last = last_row(&hidden, rows, backend)?;
        let last = self.final_layernorm.forward(&last, backend)?;
        let logits = backend.matmul(&last, &self.output_layer)?;
        backend.copy_to_host_f32(&logits)
    }
}

pub(crate) fn transformer_specs(specs: &mut WeightSpecs, config: &ModelConfig) {
    let hidden = config.hidden_size;
    let qkv = hidden + 2 * config.kv_dim();
    let ffn = config.intermediate_size;
    specs.push("transformer.embedding.word_embeddings.weight", &[config.vocab_size, hidden]);
    for i in 0..config.num_hidden_layers {
        let p = format!("transformer.encoder.layers.{i}");
        specs.rms_norm(&format!("{p}.input_layernorm"), hidden);
        specs.linear(&format!("{p}.self_attention.query_key_value"), qkv, hidden, true);
        specs.linear(&format!("{p}.self_attention.dense"), hidden, hidden, false);
        specs.rms_norm(&format!("{p}.post_attention_layernorm"), hidden);
        specs.linear(&format!("{p}.mlp.dense_h_to_4h"), 2 * ffn, hidden, false);
        specs.linear(&format!("{p}.mlp.dense_4h_to_h"), hidden, ffn, false);
    }
    specs.rms_norm("transformer.encoder.final_layernorm", hidden);
    specs.linear("transformer.output_layer", config.vocab_size, hidden, false);
}

/// Every tensor the GLM-2 architecture binds, with its stored shape.
pub fn weight_specs(config: &ModelConfig) -> WeightSpecs {
    let mut specs = WeightSpecs::new();
    transformer_specs(&mut specs, config);
    specs
}

/// Rotary embedding over the first half of each head, GPT-J pairing.
pub(crate) fn glm2_rope(config: &ModelConfig) -> RotaryEmbedding {
    RotaryEmbedding::new(config.head_dim() / 2, config.rope_theta, RopeStyle::Interleaved)
}

pub struct ChatGLM2ForCausalLM<B: Backend> {
    config: ModelConfig,
    backend: B,
    rope: RotaryEmbedding,
    transformer: Option<Glm2Transformer<B>>,
    cache: ArenaKvCache,
}

impl<B: Backend> ChatGLM2ForCausalLM<B> {
    /// Build an unloaded model whose cache holds `capacity` positions.
    pub fn new(config: ModelConfig, backend: B, capacity: usize) -> Self {
        let rope = glm2_rope(&config);
        let cache = ArenaKvCache::new(config.num_hidden_layers, config.kv_dim(), capacity);
        Self {
            config,
            backend,
            rope,
            transformer: None,
            cache,
        }
    }
}

impl<B: Backend> CausalLM for ChatGLM2ForCausalLM<B> {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        weight_specs(&self.config).validate(state_dict)?;
        let binder = WeightBinder::new(state_dict, &self.backend);
        let transformer = Glm2Transformer::load(&binder, &self.config)?;
        self.transformer = Some(transformer);
        info!(
            model = self.config.model_type_name(),
            layers = self.config.num_hidden_layers,
            backend = self.backend.name(),
            "loaded weights"
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
        Ok(GraphInputs {
            input_ids: input_ids.to_vec(),
            position_ids: PositionIds::Linear((n_past..n_past + input_ids.len()).collect()),
            pixel_values: None,
            mask_position: None,
            n_past,
            n_ctx,
            num_positions: input_ids.len(),
        })
    }

    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Vec<f32>> {
        let transformer = self.transformer.as_ref().ok_or_else(not_loaded)?;
        let PositionIds::Linear(positions) = &inputs.position_ids else {
            return Err(GlmError::InvalidInput(format!(
                "{} needs linear position ids",
                self.config.model_type_name()
            )));
        };
        check_context(
            &self.cache,
            inputs.input_ids.len(),
            inputs.n_past,
            inputs.n_ctx,
            inputs.num_positions,
        )?;
        debug!(
            rows = inputs.input_ids.len(),
            n_past = inputs.n_past,
            is_decoding,
            "forward"
        );
        let hidden = transformer.embed(&inputs.input_ids, &self.backend)?;
        let logits = transformer.forward_embeddings(
            hidden,
            positions,
            inputs.n_past,
            &mut self.cache,
            &self.rope,
            &self.config,
            &self.backend,
        )?;
        self.cache.commit(inputs.n_past + inputs.num_positions)?;
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
    }
}
