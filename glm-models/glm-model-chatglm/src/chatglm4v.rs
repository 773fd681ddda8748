//! GLM-4V: the GLM-4 text model with image embeddings spliced in over the
//! `<|begin_of_image|><|endoftext|><|end_of_image|>` placeholder.

use glm_core::{
    Backend, CausalLM, GlmError, GraphInputs, Image, KvCache, ModelConfig, PositionIds, Result,
    StateDict, VisionModelConfig,
};
use glm_kvcache::ArenaKvCache;
use tracing::{debug, info};

use crate::chatglm2::{glm2_rope, transformer_specs, Glm2Transformer};
use crate::context::{check_context, not_loaded};
use crate::rope::RotaryEmbedding;
use crate::vision::{preprocess_image, vision_specs, VisionTower};
use crate::weights::{WeightBinder, WeightSpecs};

struct Glm4VWeights<B: Backend> {
    transformer: Glm2Transformer<B>,
    vision: VisionTower<B>,
}

pub struct ChatGLM4VForCausalLM<B: Backend> {
    config: ModelConfig,
    vision_config: VisionModelConfig,
    backend: B,
    rope: RotaryEmbedding,
    weights: Option<Glm4VWeights<B>>,
    cache: ArenaKvCache,
    /// Cache slots minus text positions consumed so far. Image patches
    /// share one position, so later tokens sit this far behind their slot.
    position_shift: usize,
}

/// Every tensor GLM-4V binds, with its stored shape.
pub fn weight_specs(config: &ModelConfig) -> WeightSpecs {
    let mut specs = WeightSpecs::new();
    transformer_specs(&mut specs, config);
    if let Some(vision) = &config.vision {
        vision_specs(&mut specs, vision, config.hidden_size, config.intermediate_size);
    }
    specs
}

impl<B: Backend> ChatGLM4VForCausalLM<B> {
    /// Build an unloaded model whose cache holds `capacity` positions.
    pub fn new(config: ModelConfig, backend: B, capacity: usize) -> Result<Self> {
        let vision_config = config.vision.clone().ok_or_else(|| {
            GlmError::InvalidInput("GLM-4V config has no vision section".into())
        })?;
        let rope = glm2_rope(&config);
        let cache = ArenaKvCache::new(config.num_hidden_layers, config.kv_dim(), capacity);
        Ok(Self {
            config,
            vision_config,
            backend,
            rope,
            weights: None,
            cache,
            position_shift: 0,
        })
    }

    /// Index of `<|begin_of_image|>`, checked to frame a single placeholder.
    fn find_image_slot(&self, input_ids: &[u32]) -> Result<usize> {
        let boi = input_ids
            .iter()
            .position(|&id| id == self.vision_config.boi_token_id)
            .ok_or_else(|| {
                GlmError::InvalidInput("image given but prompt has no <|begin_of_image|>".into())
            })?;
        if input_ids.get(boi + 2) != Some(&self.vision_config.eoi_token_id) {
            return Err(GlmError::InvalidInput(
                "<|begin_of_image|> must be followed by one placeholder and <|end_of_image|>"
                    .into(),
            ));
        }
        Ok(boi)
    }

    /// Positions for a prefill with an image at `boi`: text keeps its own
    /// index, every patch shares `boi + 1`.
    fn image_positions(&self, len: usize, boi: usize) -> Vec<usize> {
        let patches = self.vision_config.num_image_tokens();
        let mut positions = Vec::with_capacity(len - 1 + patches);
        positions.extend(0..=boi);
        positions.extend(std::iter::repeat(boi + 1).take(patches));
        positions.extend(boi + 2..len);
        positions
    }

    /// Token embeddings with the placeholder triple swapped for the image.
    fn splice_image(
        &self,
        weights: &Glm4VWeights<B>,
        input_ids: &[u32],
        pixel_values: &[f32],
    ) -> Result<B::Tensor> {
        let backend = &self.backend;
        let boi = self.find_image_slot(input_ids)?;
        let image = weights.vision.forward(pixel_values, backend)?;
        let mut parts = Vec::with_capacity(3);
        if boi > 0 {
            parts.push(weights.transformer.embed(&input_ids[..boi], backend)?);
        }
        parts.push(image);
        if boi + 3 < input_ids.len() {
            parts.push(weights.transformer.embed(&input_ids[boi + 3..], backend)?);
        }
        let refs: Vec<&B::Tensor> = parts.iter().collect();
        backend.cat(&refs, 0)
    }
}

impl<B: Backend> CausalLM for ChatGLM4VForCausalLM<B> {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        weight_specs(&self.config).validate(state_dict)?;
        let binder = WeightBinder::new(state_dict, &self.backend);
        let transformer = Glm2Transformer::load(&binder, &self.config)?;
        let vision = VisionTower::load(
            &binder,
            &self.vision_config,
            self.config.hidden_size,
            self.config.intermediate_size,
        )?;
        self.weights = Some(Glm4VWeights {
            transformer,
            vision,
        });
        info!(
            layers = self.config.num_hidden_layers,
            vision_layers = self.vision_config.num_hidden_layers,
            backend = self.backend.name(),
            "loaded GLM-4V weights"
        );
        Ok(())
    }

    fn count_tokens(&self, input_ids: &[u32], image: Option<&Image>) -> usize {
        match image {
            Some(_) => (input_ids.len() + self.vision_config.num_image_tokens()).saturating_sub(1),
            None => input_ids.len(),
        }
    }

    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs> {
        let required = self.count_tokens(input_ids, image);
        check_context(&self.cache, input_ids.len(), n_past, n_ctx, required)?;
        let (position_ids, pixel_values) = match image {
            Some(image) => {
                if n_past != 0 {
                    return Err(GlmError::InvalidInput(
                        "an image can only be attached to the first forward pass".into(),
                    ));
                }
                let boi = self.find_image_slot(input_ids)?;
                let pixels = preprocess_image(image, self.vision_config.image_size)?;
                (self.image_positions(input_ids.len(), boi), Some(pixels))
            }
            None => {
                let start = n_past - self.position_shift;
                ((start..start + input_ids.len()).collect(), None)
            }
        };
        Ok(GraphInputs {
            input_ids: input_ids.to_vec(),
            position_ids: PositionIds::Linear(position_ids),
            pixel_values,
            mask_position: None,
            n_past,
            n_ctx,
            num_positions: required,
        })
    }

    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Vec<f32>> {
        let weights = self.weights.as_ref().ok_or_else(not_loaded)?;
        let PositionIds::Linear(positions) = &inputs.position_ids else {
            return Err(GlmError::InvalidInput(
                "GLM-4V needs linear position ids".into(),
            ));
        };
        check_context(
            &self.cache,
            inputs.input_ids.len(),
            inputs.n_past,
            inputs.n_ctx,
            inputs.num_positions,
        )?;
        if positions.len() != inputs.num_positions {
            return Err(GlmError::InvalidInput(format!(
                "{} position ids for {} positions",
                positions.len(),
                inputs.num_positions
            )));
        }
        debug!(
            rows = inputs.num_positions,
            n_past = inputs.n_past,
            has_image = inputs.pixel_values.is_some(),
            is_decoding,
            "GLM-4V forward"
        );
        let hidden = match &inputs.pixel_values {
            Some(pixels) => self.splice_image(weights, &inputs.input_ids, pixels)?,
            None => weights.transformer.embed(&inputs.input_ids, &self.backend)?,
        };
        let logits = weights.transformer.forward_embeddings(
            hidden,
            positions,
            inputs.n_past,
            &mut self.cache,
            &self.rope,
            &self.config,
            &self.backend,
        )?;
        self.cache.commit(inputs.n_past + inputs.num_positions)?;
        self.position_shift += inputs.num_positions - inputs.input_ids.len();
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
        self.position_shift = 0;
    }
}
