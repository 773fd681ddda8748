//! Forward-pass tests on tiny deterministic models.

use glm_backend_cpu::CpuBackend;
use glm_core::{
    CausalLM, DType, ErrorKind, GenerationConfig, Image, ModelConfig, ModelType, PositionIds,
    Result, SampleResult, StateDict, TensorData, TokenSampler, VisionModelConfig,
};
use glm_model_chatglm::{build_model, weight_specs};

const VOCAB: usize = 32;
const CAPACITY: usize = 48;

fn tiny_config(model_type: ModelType) -> ModelConfig {
    let (kv_heads, vision) = match model_type {
        ModelType::ChatGLM => (4, None),
        ModelType::ChatGLM4V => (2, Some(tiny_vision())),
        _ => (2, None),
    };
    ModelConfig {
        model_type,
        dtype: DType::F32,
        vocab_size: VOCAB,
        hidden_size: 16,
        num_attention_heads: 4,
        num_key_value_heads: kv_heads,
        num_hidden_layers: 2,
        intermediate_size: 24,
        norm_eps: 1e-5,
        rope_theta: 10000.0,
        max_length: 64,
        bos_token_id: None,
        eos_token_id: Some(2),
        pad_token_id: None,
        sep_token_id: None,
        extra_eos_token_ids: vec![],
        vision,
    }
}

fn tiny_vision() -> VisionModelConfig {
    VisionModelConfig {
        hidden_size: 8,
        image_size: 8,
        in_channels: 3,
        intermediate_size: 12,
        norm_eps: 1e-6,
        num_attention_heads: 2,
        num_hidden_layers: 1,
        num_positions: 17,
        patch_size: 2,
        scaling_factor: 8.0,
        boi_token_id: 28,
        eoi_token_id: 29,
    }
}

/// Deterministic weights: norms at one, everything else a small sawtooth.
fn tiny_state_dict(config: &ModelConfig) -> StateDict {
    let mut state_dict = StateDict::new();
    for (name, shape) in weight_specs(config).iter() {
        let numel: usize = shape.iter().product();
        let is_norm_weight = name.contains("norm") && name.ends_with(".weight");
        let values: Vec<f32> = (0..numel)
            .map(|i| {
                if is_norm_weight {
                    1.0
                } else {
                    (((i * 7 + name.len()) % 23) as f32 / 23.0 - 0.5) * 0.2
                }
            })
            .collect();
        state_dict.insert(name, TensorData::from_f32(&values, shape).unwrap());
    }
    state_dict
}

fn loaded_model(model_type: ModelType) -> Box<dyn CausalLM> {
    let config = tiny_config(model_type);
    let state_dict = tiny_state_dict(&config);
    let mut model = build_model(config, CpuBackend, CAPACITY).unwrap();
    model.load_state_dict(&state_dict).unwrap();
    model
}

fn run(model: &mut dyn CausalLM, ids: &[u32], image: Option<&Image>) -> Vec<f32> {
    let n_past = model.n_past();
    let inputs = model.set_graph_inputs(ids, image, n_past, CAPACITY).unwrap();
    model.forward(&inputs, n_past > 0).unwrap()
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < 1e-4, "logit {i}: {x} vs {y}");
    }
}

struct ArgMax;

impl TokenSampler for ArgMax {
    fn sample(
        &mut self,
        logits: &[f32],
        _config: &GenerationConfig,
        _history: &[u32],
    ) -> Result<SampleResult> {
        let (id, _) = logits
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        Ok(SampleResult {
            token_id: id as u32,
            logprob: 0.0,
        })
    }
}

#[test]
fn test_incremental_decode_matches_full_prefill() {
    for model_type in [ModelType::ChatGLM2, ModelType::ChatGLM4] {
        let mut full = loaded_model(model_type);
        let expected = run(full.as_mut(), &[5, 6, 7, 8], None);
        assert_eq!(expected.len(), VOCAB);

        let mut stepped = loaded_model(model_type);
        run(stepped.as_mut(), &[5, 6, 7], None);
        let got = run(stepped.as_mut(), &[8], None);
        assert_close(&expected, &got);
        assert_eq!(stepped.n_past(), 4);
    }
}

#[test]
fn test_reset_cache_replays_identically() {
    let mut model = loaded_model(ModelType::ChatGLM3);
    let first = run(model.as_mut(), &[3, 4, 5], None);
    run(model.as_mut(), &[6], None);
    model.reset_cache();
    assert_eq!(model.n_past(), 0);
    let again = run(model.as_mut(), &[3, 4, 5], None);
    assert_close(&first, &again);
}

#[test]
fn test_chatglm_block_positions_follow_mask() {
    let model = loaded_model(ModelType::ChatGLM);
    // "a b [gMASK] <sop>"
    let inputs = model.set_graph_inputs(&[10, 11, 20, 21], None, 0, CAPACITY).unwrap();
    assert_eq!(inputs.mask_position, Some(2));
    assert_eq!(
        inputs.position_ids,
        PositionIds::Block {
            positions: vec![0, 1, 2, 2],
            block_positions: vec![0, 0, 0, 1],
        }
    );
}

#[test]
fn test_chatglm_decode_continues_block_positions() {
    let mut model = loaded_model(ModelType::ChatGLM);
    let logits = run(model.as_mut(), &[10, 11, 20, 21], None);
    assert_eq!(logits.len(), VOCAB);
    assert!(logits.iter().all(|v| v.is_finite()));

    let inputs = model.set_graph_inputs(&[12], None, 4, CAPACITY).unwrap();
    assert_eq!(
        inputs.position_ids,
        PositionIds::Block {
            positions: vec![2],
            block_positions: vec![2],
        }
    );
    let logits = model.forward(&inputs, true).unwrap();
    assert!(logits.iter().all(|v| v.is_finite()));
    assert_eq!(model.n_past(), 5);
}

#[test]
fn test_chatglm_prompt_too_short_for_mask() {
    let model = loaded_model(ModelType::ChatGLM);
    let err = model.set_graph_inputs(&[21], None, 0, CAPACITY).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_generate_next_token_advances_n_past() {
    let mut model = loaded_model(ModelType::ChatGLM2);
    let config = GenerationConfig::greedy(4);
    let mut sampler = ArgMax;
    let next = model
        .generate_next_token(&[1, 2, 3], None, &config, 0, CAPACITY, &[1, 2, 3], &mut sampler)
        .unwrap();
    assert_eq!(next.n_past, 3);
    assert!((next.token_id as usize) < VOCAB);

    let again = model
        .generate_next_token(&[next.token_id], None, &config, 3, CAPACITY, &[], &mut sampler)
        .unwrap();
    assert_eq!(again.n_past, 4);
}

#[test]
fn test_missing_weight_leaves_model_unloaded() {
    let config = tiny_config(ModelType::ChatGLM2);
    let mut state_dict = tiny_state_dict(&config);
    state_dict.remove("transformer.encoder.layers.1.mlp.dense_4h_to_h.weight");

    let mut model = build_model(config, CpuBackend, CAPACITY).unwrap();
    let err = model.load_state_dict(&state_dict).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingWeight);

    let inputs = model.set_graph_inputs(&[1, 2], None, 0, CAPACITY).unwrap();
    assert!(model.forward(&inputs, false).is_err());
    assert_eq!(model.n_past(), 0);
}

#[test]
fn test_wrong_shape_is_rejected() {
    let config = tiny_config(ModelType::ChatGLM);
    let mut state_dict = tiny_state_dict(&config);
    state_dict.insert(
        "transformer.final_layernorm.bias",
        TensorData::from_f32(&[0.0; 8], &[8]).unwrap(),
    );
    let mut model = build_model(config, CpuBackend, CAPACITY).unwrap();
    let err = model.load_state_dict(&state_dict).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
}

#[test]
fn test_context_checks() {
    let mut model = loaded_model(ModelType::ChatGLM4);

    // n_ctx beyond what the cache can hold.
    let err = model.set_graph_inputs(&[1], None, 0, CAPACITY + 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextOverflow);

    // Prompt longer than the window.
    let err = model.set_graph_inputs(&[1, 2, 3, 4], None, 0, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextOverflow);

    run(model.as_mut(), &[1, 2, 3], None);

    // No rollback: n_past must equal the committed length.
    let err = model.set_graph_inputs(&[4], None, 1, CAPACITY).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = model.set_graph_inputs(&[], None, 3, CAPACITY).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_capacity_reports_cache_size() {
    for model_type in [ModelType::ChatGLM, ModelType::ChatGLM2, ModelType::ChatGLM4V] {
        let model = loaded_model(model_type);
        assert!(CAPACITY < model.config().max_length);
        assert_eq!(model.capacity(), CAPACITY);
    }
}

fn test_image() -> Image {
    let pixels = (0..5 * 3 * 3).map(|v| (v * 17 % 256) as u8).collect();
    Image::new(5, 3, pixels).unwrap()
}

#[test]
fn test_glm4v_counts_image_tokens() {
    let model = loaded_model(ModelType::ChatGLM4V);
    let ids = [1, 28, 30, 29, 7];
    assert_eq!(model.count_tokens(&ids, None), 5);
    // grid 4, downsampled to 2x2 patch tokens.
    assert_eq!(model.count_tokens(&ids, Some(&test_image())), 5 - 1 + 4);
}

#[test]
fn test_glm4v_prefill_with_image_then_decode() {
    let mut model = loaded_model(ModelType::ChatGLM4V);
    let image = test_image();
    let ids = [1, 28, 30, 29, 7];

    let inputs = model.set_graph_inputs(&ids, Some(&image), 0, CAPACITY).unwrap();
    assert_eq!(inputs.num_positions, 8);
    assert_eq!(
        inputs.position_ids,
        PositionIds::Linear(vec![0, 1, 2, 2, 2, 2, 3, 4])
    );
    assert_eq!(inputs.pixel_values.as_ref().map(Vec::len), Some(3 * 8 * 8));

    let logits = model.forward(&inputs, false).unwrap();
    assert_eq!(logits.len(), VOCAB);
    assert!(logits.iter().all(|v| v.is_finite()));
    assert_eq!(model.n_past(), 8);

    // Text after the image resumes at the prompt's own length.
    let inputs = model.set_graph_inputs(&[9], None, 8, CAPACITY).unwrap();
    assert_eq!(inputs.position_ids, PositionIds::Linear(vec![5]));
    model.forward(&inputs, true).unwrap();
    assert_eq!(model.n_past(), 9);
}

#[test]
fn test_glm4v_image_needs_placeholder() {
    let model = loaded_model(ModelType::ChatGLM4V);
    let err = model
        .set_graph_inputs(&[1, 2, 3], Some(&test_image()), 0, CAPACITY)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_glm4v_text_only_matches_glm4() {
    let mut vision = loaded_model(ModelType::ChatGLM4V);
    let mut text = loaded_model(ModelType::ChatGLM4);
    let a = run(vision.as_mut(), &[4, 5, 6], None);
    let b = run(text.as_mut(), &[4, 5, 6], None);
    assert_close(&a, &b);
}
