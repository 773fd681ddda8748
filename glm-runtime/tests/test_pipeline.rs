//! Pipeline tests against a scripted model and a letter tokenizer.

use glm_core::{
    CausalLM, ChatMessage, DType, ErrorKind, GenerationConfig, GraphInputs, Image, ModelConfig,
    ModelType, PositionIds, Result, Role, StateDict, Tokenizer,
};
use glm_runtime::{ChatSession, CpuSampler, PerfStreamer, Pipeline, Streamer, TextStreamer};

const VOCAB: usize = 32;
const EOS: u32 = 31;
const PREFIX: u32 = 30;
/// Spells `'z'`; registered as an extra terminator by some tests.
const TERMINATOR: u32 = 25;

/// Predicts `script[step]` with certainty, repeating the last entry once the
/// script runs out.
struct ScriptedModel {
    config: ModelConfig,
    capacity: usize,
    script: Vec<u32>,
    step: usize,
    n_past: usize,
}

impl ScriptedModel {
    fn new(script: &[u32]) -> Self {
        Self {
            config: ModelConfig {
                model_type: ModelType::ChatGLM4,
                dtype: DType::F32,
                vocab_size: VOCAB,
                hidden_size: 8,
                num_attention_heads: 2,
                num_key_value_heads: 2,
                num_hidden_layers: 1,
                intermediate_size: 8,
                norm_eps: 1e-5,
                rope_theta: 10000.0,
                max_length: 64,
                bos_token_id: None,
                eos_token_id: Some(EOS),
                pad_token_id: None,
                sep_token_id: None,
                extra_eos_token_ids: vec![],
                vision: None,
            },
            capacity: 64,
            script: script.to_vec(),
            step: 0,
            n_past: 0,
        }
    }

    fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn with_terminator(mut self, id: u32) -> Self {
        self.config.extra_eos_token_ids.push(id);
        self
    }
}

impl CausalLM for ScriptedModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn load_state_dict(&mut self, _state_dict: &StateDict) -> Result<()> {
        Ok(())
    }

    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        _image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs> {
        assert_eq!(n_past, self.n_past, "pipeline lost track of n_past");
        assert!(n_ctx <= self.capacity, "window larger than the cache");
        assert!(n_past + input_ids.len() <= n_ctx, "window exceeded");
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

    fn forward(&mut self, inputs: &GraphInputs, _is_decoding: bool) -> Result<Vec<f32>> {
        let next = self.script[self.step.min(self.script.len() - 1)];
        self.step += 1;
        self.n_past += inputs.num_positions;
        let mut logits = vec![0.0; VOCAB];
        logits[next as usize] = 10.0;
        Ok(logits)
    }

    fn n_past(&self) -> usize {
        self.n_past
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset_cache(&mut self) {
        self.step = 0;
        self.n_past = 0;
    }
}

/// Id `i` spells the letter `'a' + i`; the prompt opens with `PREFIX`.
struct LetterTokenizer;

impl Tokenizer for LetterTokenizer {
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let ids: Vec<u32> = text.bytes().map(|b| u32::from(b - b'a')).collect();
        Ok(ids[ids.len().saturating_sub(max_length)..].to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        Ok(ids
            .iter()
            .filter(|&&id| !(skip_special_tokens && id >= PREFIX))
            .map(|&id| char::from(b'a' + id as u8))
            .collect())
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>> {
        let mut body = Vec::new();
        for message in messages {
            body.extend(self.encode(&message.content, usize::MAX)?);
        }
        let keep = body.len().min(max_length - 1);
        let mut ids = vec![PREFIX];
        ids.extend_from_slice(&body[body.len() - keep..]);
        Ok(ids)
    }
}

fn pipeline(script: &[u32]) -> Pipeline {
    pipeline_with(ScriptedModel::new(script))
}

fn pipeline_with(model: ScriptedModel) -> Pipeline {
    Pipeline::new(Box::new(LetterTokenizer), Box::new(model), None)
}

fn greedy(max_new_tokens: i32) -> GenerationConfig {
    GenerationConfig::greedy(max_new_tokens)
}

#[test]
fn test_generate_stops_at_eos() {
    let mut pipeline = pipeline(&[0, 1, EOS, 5]);
    let mut sampler = CpuSampler::seeded(0);
    let output = pipeline
        .generate(&[7, 8, 9], None, &greedy(3), &mut sampler, None)
        .unwrap();
    assert_eq!(output, vec![0, 1, EOS]);
    assert_eq!(pipeline.model().n_past(), 5);
}

#[test]
fn test_generate_honours_max_new_tokens() {
    let mut pipeline = pipeline(&[4]);
    let mut sampler = CpuSampler::seeded(0);
    let output = pipeline
        .generate(&[1, 2], None, &greedy(5), &mut sampler, None)
        .unwrap();
    assert_eq!(output, vec![4; 5]);
}

#[test]
fn test_generate_stops_at_window() {
    let mut pipeline = pipeline(&[4]);
    let mut sampler = CpuSampler::seeded(0);
    let config = GenerationConfig {
        max_length: 6,
        ..greedy(-1)
    };
    let output = pipeline
        .generate(&[1, 2, 3], None, &config, &mut sampler, None)
        .unwrap();
    assert_eq!(output.len(), 4);
    assert_eq!(pipeline.model().n_past(), 6);
}

#[test]
fn test_window_clamped_to_cache_capacity() {
    let mut pipeline = pipeline_with(ScriptedModel::new(&[4]).with_capacity(16));
    let mut sampler = CpuSampler::seeded(0);
    let config = greedy(-1);
    assert_eq!(pipeline.max_length(), 64);
    assert_eq!(pipeline.context_window(&config), 16);

    let output = pipeline
        .generate(&[1, 2, 3], None, &config, &mut sampler, None)
        .unwrap();
    assert_eq!(output.len(), 14);
    assert_eq!(pipeline.model().n_past(), 16);
}

#[test]
fn test_prompt_beyond_cache_capacity_overflows() {
    let mut pipeline = pipeline_with(ScriptedModel::new(&[4]).with_capacity(4));
    let mut sampler = CpuSampler::seeded(0);
    let err = pipeline
        .generate(&[1, 2, 3, 4], None, &greedy(2), &mut sampler, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextOverflow);
}

#[test]
fn test_prompt_beyond_window_overflows() {
    let mut pipeline = pipeline(&[4]);
    let mut sampler = CpuSampler::seeded(0);
    let config = GenerationConfig {
        max_context_length: 8,
        ..greedy(4)
    };
    let err = pipeline
        .generate(&[1, 2, 3, 4, 5], None, &config, &mut sampler, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextOverflow);
    assert_eq!(pipeline.model().n_past(), 0);
}

#[test]
fn test_generate_restarts_from_fresh_cache() {
    let mut pipeline = pipeline(&[0, EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let first = pipeline.generate(&[3, 4], None, &greedy(4), &mut sampler, None).unwrap();
    let second = pipeline.generate(&[3, 4], None, &greedy(4), &mut sampler, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_chat_strips_eos_and_decodes() {
    let mut pipeline = pipeline(&[7, 8, EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let reply = pipeline
        .chat(&[ChatMessage::user("abc")], &greedy(3), &mut sampler, None)
        .unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "hi");
    assert!(reply.tool_calls.is_empty());
}

#[test]
fn test_generate_stops_at_extra_terminator() {
    let model = ScriptedModel::new(&[7, TERMINATOR, 5]).with_terminator(TERMINATOR);
    let mut pipeline = pipeline_with(model);
    let mut sampler = CpuSampler::seeded(0);
    let output = pipeline
        .generate(&[1, 2], None, &greedy(8), &mut sampler, None)
        .unwrap();
    assert_eq!(output, vec![7, TERMINATOR]);
}

#[test]
fn test_chat_keeps_extra_terminator_for_decoding() {
    let model = ScriptedModel::new(&[7, TERMINATOR, 5]).with_terminator(TERMINATOR);
    let mut pipeline = pipeline_with(model);
    let mut sampler = CpuSampler::seeded(0);
    let reply = pipeline
        .chat(&[ChatMessage::user("abc")], &greedy(8), &mut sampler, None)
        .unwrap();
    // The terminator reaches `decode_message`, which spells it as 'z'.
    assert_eq!(reply.content, "hz");
}

#[test]
fn test_chat_rejects_second_image() {
    let mut pipeline = pipeline(&[EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let image = || Image::new(1, 1, vec![0; 3]).unwrap();
    let messages = [
        ChatMessage::user("ab").with_image(image()),
        ChatMessage::assistant("c"),
        ChatMessage::user("de").with_image(image()),
    ];
    let err = pipeline.chat(&messages, &greedy(3), &mut sampler, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(pipeline.model().n_past(), 0);
}

#[test]
fn test_chat_accepts_single_image() {
    let mut pipeline = pipeline(&[7, EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let image = Image::new(1, 1, vec![0; 3]).unwrap();
    let messages = [
        ChatMessage::user("ab").with_image(image),
        ChatMessage::assistant("c"),
        ChatMessage::user("de"),
    ];
    let reply = pipeline.chat(&messages, &greedy(3), &mut sampler, None).unwrap();
    assert_eq!(reply.content, "h");
}

#[test]
fn test_chat_truncates_prompt_to_budget() {
    let mut pipeline = pipeline(&[EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let config = GenerationConfig {
        max_context_length: 8,
        ..greedy(3)
    };
    // Ten letters of history, but only 8 - 3 positions for the prompt.
    let reply = pipeline
        .chat(&[ChatMessage::user("abcdefghij")], &config, &mut sampler, None)
        .unwrap();
    assert_eq!(reply.content, "");
    assert_eq!(pipeline.model().n_past(), 5);
}

#[test]
fn test_text_streamer_writes_reply_only() {
    let mut pipeline = pipeline(&[7, 8, EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let mut streamer = TextStreamer::new(Vec::new(), pipeline.tokenizer());
    pipeline
        .chat(
            &[ChatMessage::user("abc")],
            &greedy(3),
            &mut sampler,
            Some(&mut streamer as &mut dyn Streamer),
        )
        .unwrap();
    assert_eq!(String::from_utf8(streamer.into_inner()).unwrap(), "hi\n");
}

#[test]
fn test_perf_streamer_counts_tokens() {
    let mut pipeline = pipeline(&[1, 2, 3, EOS]);
    let mut sampler = CpuSampler::seeded(0);
    let mut perf = PerfStreamer::new();
    pipeline
        .generate(
            &[5, 6, 7, 8],
            None,
            &greedy(8),
            &mut sampler,
            Some(&mut perf as &mut dyn Streamer),
        )
        .unwrap();
    let stats = perf.stats();
    assert_eq!(stats.num_prompt_tokens, 4);
    assert_eq!(stats.num_output_tokens, 4);
}

#[test]
fn test_session_keeps_history() {
    let mut session = ChatSession::new(pipeline(&[7, 8, EOS]), greedy(3)).with_system("ab");
    let mut sampler = CpuSampler::seeded(0);
    let reply = session.send(ChatMessage::user("abc"), &mut sampler, None).unwrap();
    assert_eq!(reply.content, "hi");
    let roles: Vec<Role> = session.history().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

    session.clear();
    assert_eq!(session.history().len(), 1);
}

#[test]
fn test_failed_turn_leaves_history_unchanged() {
    let mut session = ChatSession::new(pipeline(&[EOS]), greedy(64));
    let mut sampler = CpuSampler::seeded(0);
    let err = session.send(ChatMessage::user("abc"), &mut sampler, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextOverflow);
    assert!(session.history().is_empty());
}
