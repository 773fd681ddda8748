use crate::sampling::TokenSampler;
use crate::{GenerationConfig, Image, ModelConfig, Result, StateDict};

/// Position ids for the tokens of one forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionIds {
    /// One absolute position per token (ChatGLM2 and later).
    Linear(Vec<usize>),
    /// GLM 2-D positions: the position clamped at the `[gMASK]` slot, plus the
    /// offset inside the generated block (ChatGLM).
    Block {
        positions: Vec<usize>,
        block_positions: Vec<usize>,
    },
}

impl PositionIds {
    pub fn len(&self) -> usize {
        match self {
            PositionIds::Linear(p) => p.len(),
            PositionIds::Block { positions, .. } => positions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything one forward pass consumes, staged by `CausalLM::set_graph_inputs`.
#[derive(Debug, Clone)]
pub struct GraphInputs {
    pub input_ids: Vec<u32>,
    pub position_ids: PositionIds,
    /// Normalized `[channels, size, size]` pixels for the vision tower.
    pub pixel_values: Option<Vec<f32>>,
    /// Position of `[gMASK]` in the session, for 2-D position families.
    pub mask_position: Option<usize>,
    pub n_past: usize,
    pub n_ctx: usize,
    /// Cache positions this pass will occupy.
    pub num_positions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextToken {
    pub token_id: u32,
    pub n_past: usize,
}

/// An autoregressive language model with its own key/value cache.
pub trait CausalLM: Send {
    fn config(&self) -> &ModelConfig;

    /// Validate and bind every weight. On error the model stays unloaded.
    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()>;

    /// Cache positions a prompt consumes.
    fn count_tokens(&self, input_ids: &[u32], image: Option<&Image>) -> usize {
        let _ = image;
        input_ids.len()
    }

    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs>;

    /// Run the network and return last-position logits (`vocab_size` values).
    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Vec<f32>>;

    /// Committed cache length.
    fn n_past(&self) -> usize;

    /// Positions the key/value cache can hold.
    fn capacity(&self) -> usize {
        self.config().max_length
    }

    fn reset_cache(&mut self);

    #[allow(clippy::too_many_arguments)]
    fn generate_next_token(
        &mut self,
        input_ids: &[u32],
        image: Option<&Image>,
        gen_config: &GenerationConfig,
        n_past: usize,
        n_ctx: usize,
        history: &[u32],
        sampler: &mut dyn TokenSampler,
    ) -> Result<NextToken> {
        let inputs = self.set_graph_inputs(input_ids, image, n_past, n_ctx)?;
        let logits = self.forward(&inputs, n_past > 0)?;
        let sample = sampler.sample(&logits, gen_config, history)?;
        Ok(NextToken {
            token_id: sample.token_id,
            n_past: n_past + inputs.num_positions,
        })
    }
}
