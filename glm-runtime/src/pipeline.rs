//! Chat pipeline: one tokenizer, one model, and the prefill/decode loop
//! that ties them to a sampler and an optional streamer.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use glm_backend_cpu::CpuBackend;
use glm_core::{
    CausalLM, ChatMessage, GenerationConfig, GlmError, Image, Result, Role, TokenSampler,
    Tokenizer,
};
use glm_loader::{GlmConfig, SafeTensorsLoader};
use glm_model_chatglm::build_model;
use glm_tokenizer::{build_tokenizer, terminator_ids, HfTokenizer};
use tracing::{debug, info};

use crate::streamer::Streamer;

pub struct Pipeline {
    tokenizer: Arc<dyn Tokenizer>,
    model: Box<dyn CausalLM>,
    max_length: usize,
}

impl Pipeline {
    /// `max_length: None` uses the model's own context length.
    pub fn new(
        tokenizer: Box<dyn Tokenizer>,
        model: Box<dyn CausalLM>,
        max_length: Option<usize>,
    ) -> Self {
        let max_length = max_length.unwrap_or(model.config().max_length);
        Self {
            tokenizer: Arc::from(tokenizer),
            model,
            max_length,
        }
    }

    /// Load a converted checkpoint directory holding `config.json`,
    /// `tokenizer.json` and `*.safetensors` onto the CPU backend.
    pub fn from_path(model_dir: &Path, max_length: Option<usize>) -> Result<Self> {
        let start = Instant::now();
        let glm_config = GlmConfig::from_file(&model_dir.join("config.json"))?;
        let hf = HfTokenizer::from_file(&model_dir.join("tokenizer.json"))?;
        let model_type = glm_config.detect_model_type(|token| hf.has_token(token));

        let mut config = glm_config.to_model_config(model_type)?;
        for id in terminator_ids(model_type, &hf) {
            if !config.is_eos(id) {
                config.extra_eos_token_ids.push(id);
            }
        }
        let tokenizer = build_tokenizer(model_type, hf)?;

        let capacity = max_length.map_or(config.max_length, |n| n.min(config.max_length));
        let state_dict = SafeTensorsLoader::new(model_dir)?.load_state_dict()?;
        let mut model = build_model(config, CpuBackend, capacity)?;
        model.load_state_dict(&state_dict)?;

        info!(
            family = model_type.name(),
            max_length = capacity,
            elapsed_ms = start.elapsed().as_millis() as u64,
            path = %model_dir.display(),
            "pipeline ready"
        );
        Ok(Self::new(tokenizer, model, Some(capacity)))
    }

    pub fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        Arc::clone(&self.tokenizer)
    }

    pub fn model(&self) -> &dyn CausalLM {
        self.model.as_ref()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Positions prompt plus generation may occupy under `gen_config`,
    /// never more than the model's cache holds.
    pub fn context_window(&self, gen_config: &GenerationConfig) -> usize {
        gen_config
            .max_length
            .min(gen_config.max_context_length)
            .min(self.max_length)
            .min(self.model.config().max_length)
            .min(self.model.capacity())
    }

    /// Run one generation from a fresh cache and return the sampled ids,
    /// including a terminating eos if one was produced.
    pub fn generate(
        &mut self,
        input_ids: &[u32],
        image: Option<&Image>,
        gen_config: &GenerationConfig,
        sampler: &mut dyn TokenSampler,
        mut streamer: Option<&mut dyn Streamer>,
    ) -> Result<Vec<u32>> {
        gen_config.validate()?;
        let window = self.context_window(gen_config);
        let limit = gen_config.new_token_limit();
        let prompt_len = self.model.count_tokens(input_ids, image);
        let required = prompt_len + limit.unwrap_or(1);
        if required > window {
            return Err(GlmError::ContextOverflow {
                required,
                capacity: window,
            });
        }

        self.model.reset_cache();
        if let Some(streamer) = streamer.as_deref_mut() {
            streamer.put(input_ids)?;
        }
        debug!(prompt_len, window, max_new_tokens = gen_config.max_new_tokens, "prefill");

        let mut history = input_ids.to_vec();
        let mut output = Vec::new();
        let mut step_ids = input_ids.to_vec();
        let mut step_image = image;
        let mut n_past = 0;
        loop {
            let next = self.model.generate_next_token(
                &step_ids,
                step_image,
                gen_config,
                n_past,
                window,
                &history,
                sampler,
            )?;
            n_past = next.n_past;
            history.push(next.token_id);
            output.push(next.token_id);
            if let Some(streamer) = streamer.as_deref_mut() {
                streamer.put(&[next.token_id])?;
            }

            if self.model.config().is_eos(next.token_id) {
                break;
            }
            if limit.is_some_and(|limit| output.len() >= limit) {
                break;
            }
            if n_past + 1 > window {
                debug!(n_past, window, "context window exhausted");
                break;
            }
            step_ids.clear();
            step_ids.push(next.token_id);
            step_image = None;
        }

        if let Some(streamer) = streamer.as_deref_mut() {
            streamer.end()?;
        }
        Ok(output)
    }

    /// Answer the conversation in `messages` with one assistant turn.
    pub fn chat(
        &mut self,
        messages: &[ChatMessage],
        gen_config: &GenerationConfig,
        sampler: &mut dyn TokenSampler,
        streamer: Option<&mut dyn Streamer>,
    ) -> Result<ChatMessage> {
        gen_config.validate()?;
        let window = self.context_window(gen_config);
        let reserve = gen_config.new_token_limit().unwrap_or(1);
        let budget = window
            .checked_sub(reserve)
            .filter(|&budget| budget > 0)
            .ok_or(GlmError::ContextOverflow {
                required: reserve + 1,
                capacity: window,
            })?;

        // The templates render one image slot per image-bearing message but
        // the vision tower splices a single image.
        let mut images = messages.iter().filter_map(|m| m.image.as_ref());
        let image = images.next();
        if images.next().is_some() {
            return Err(GlmError::InvalidInput(
                "at most one message per conversation may carry an image".into(),
            ));
        }

        let input_ids = self.tokenizer.apply_chat_template(messages, budget)?;
        let start = Instant::now();
        let mut output = self.generate(&input_ids, image, gen_config, sampler, streamer)?;

        // Only the primary eos is dropped. Turn terminators such as
        // `<|observation|>` mark tool calls for `decode_message`.
        let produced = output.len();
        if output.last().copied() == self.model.config().eos_token_id {
            output.pop();
        }
        let reply = self.tokenizer.decode_message(&output)?;
        info!(
            prompt_tokens = input_ids.len(),
            output_tokens = produced,
            tool_calls = reply.tool_calls.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "chat turn"
        );
        Ok(reply)
    }
}

/// A conversation bound to one pipeline.
pub struct ChatSession {
    pipeline: Pipeline,
    gen_config: GenerationConfig,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(pipeline: Pipeline, gen_config: GenerationConfig) -> Self {
        Self {
            pipeline,
            gen_config,
            history: Vec::new(),
        }
    }

    /// Start the history with a system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.history.insert(0, ChatMessage::system(system));
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn gen_config(&self) -> &GenerationConfig {
        &self.gen_config
    }

    pub fn gen_config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.gen_config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Forget every turn except a leading system prompt.
    pub fn clear(&mut self) {
        self.history.retain(|m| m.role == Role::System);
        self.history.truncate(1);
    }

    /// Append `message`, generate the reply and append it too. A failed
    /// turn leaves the history as it was.
    pub fn send(
        &mut self,
        message: ChatMessage,
        sampler: &mut dyn TokenSampler,
        streamer: Option<&mut dyn Streamer>,
    ) -> Result<ChatMessage> {
        self.history.push(message);
        match self
            .pipeline
            .chat(&self.history, &self.gen_config, sampler, streamer)
        {
            Ok(reply) => {
                self.history.push(reply.clone());
                Ok(reply)
            }
            Err(err) => {
                self.history.pop();
                Err(err)
            }
        }
    }
}
