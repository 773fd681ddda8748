use glm_core::{ChatMessage, ErrorKind, Image, ModelType, Role, ToolCallMessage, Tokenizer};
use glm_tokenizer::{
    build_tokenizer, terminator_ids, ChatGLM2Tokenizer, ChatGLM3Tokenizer, ChatGLM4Tokenizer,
    ChatGLMTokenizer, HfTokenizer, IncrementalDecoder,
};
use serde_json::{json, Value};

// ──────────── Test vocabularies ────────────

const WORDS: &[&str] = &[
    "hello", "world", "hi", "there", "[", "]", "Round", "0", "1", "2", "问", "：", "答",
];

const SPECIALS: &[&str] = &[
    "[gMASK]",
    "<sop>",
    "<eop>",
    "sop",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "<|observation|>",
    "<|endoftext|>",
    "<|begin_of_image|>",
    "<|end_of_image|>",
];

/// Whitespace-folding pieces of the ChatGLM-6B vocabulary; decoded verbatim.
const PIECES: &[&str] = &["<n>", "<|tab|>", "<|blank_2|>"];

/// WordLevel vocabulary with the given pre-tokenizer and decoder.
fn build_hf(words: &[&str], pre_tokenizer: Value, decoder: Value) -> HfTokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), json!(0));
    let mut added = Vec::new();
    let mut next_id = 1u32;
    for w in words {
        vocab.insert((*w).into(), json!(next_id));
        next_id += 1;
    }
    for (tokens, special) in [(SPECIALS, true), (PIECES, false)] {
        for t in tokens {
            vocab.insert((*t).into(), json!(next_id));
            added.push(json!({
                "id": next_id,
                "content": t,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": special,
            }));
            next_id += 1;
        }
    }
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": pre_tokenizer,
        "post_processor": null,
        "decoder": decoder,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    });
    HfTokenizer::from_json(&tokenizer.to_string()).unwrap()
}

/// Space-separated words; decode joins tokens with spaces.
fn word_tokenizer() -> HfTokenizer {
    build_hf(WORDS, json!({"type": "Whitespace"}), Value::Null)
}

/// One token per line; decode concatenates, so newlines survive.
fn line_tokenizer(lines: &[&str]) -> HfTokenizer {
    let mut words = vec!["\n"];
    words.extend_from_slice(lines);
    build_hf(
        &words,
        json!({
            "type": "Split",
            "pattern": {"String": "\n"},
            "behavior": "Isolated",
            "invert": false
        }),
        json!({"type": "Fuse"}),
    )
}

fn id(hf: &HfTokenizer, token: &str) -> u32 {
    hf.token_to_id(token).unwrap()
}

fn conversation() -> Vec<ChatMessage> {
    vec![
        ChatMessage::user("hello"),
        ChatMessage::assistant("world"),
        ChatMessage::user("hi there"),
    ]
}

// ──────────── Vocabulary wrapper ────────────

#[test]
fn test_unknown_ids_decode_to_placeholder() {
    let hf = word_tokenizer();
    let hello = id(&hf, "hello");
    let text = hf.decode(&[hello, 9999], true).unwrap();
    assert_eq!(text, "hello<unk>");
}

fn stream(tokenizer: &dyn Tokenizer, ids: &[u32]) -> String {
    let mut decoder = IncrementalDecoder::new();
    let mut streamed = String::new();
    for &token in ids {
        if let Some(delta) = decoder.add_token(token, tokenizer) {
            streamed.push_str(&delta);
        }
    }
    if let Some(rest) = decoder.flush(tokenizer) {
        streamed.push_str(&rest);
    }
    streamed
}

#[test]
fn test_incremental_decoder_streams_deltas() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM2Tokenizer::new(hf.clone()).unwrap();
    let ids = [id(&hf, "hello"), id(&hf, "world"), id(&hf, "hi")];
    assert_eq!(stream(&tokenizer, &ids), "hello world hi");
}

#[test]
fn test_incremental_decoder_matches_full_decode_over_long_output() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM2Tokenizer::new(hf.clone()).unwrap();
    let ids: Vec<u32> = ["hello", "world", "hi", "there"]
        .iter()
        .cycle()
        .take(50)
        .map(|w| id(&hf, w))
        .collect();
    assert_eq!(stream(&tokenizer, &ids), tokenizer.decode(&ids, true).unwrap());
}

#[test]
fn test_incremental_decoder_unfolds_chatglm_newlines() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLMTokenizer::new(hf.clone()).unwrap();
    let ids = [
        id(&hf, "hello"),
        id(&hf, "<n>"),
        id(&hf, "world"),
        id(&hf, "<n>"),
        id(&hf, "hi"),
    ];
    let streamed = stream(&tokenizer, &ids);
    assert_eq!(streamed, tokenizer.decode(&ids, true).unwrap());
    assert!(!streamed.contains("<n>"));
}

// ──────────── ChatGLM ────────────

#[test]
fn test_chatglm_encode_appends_mask_and_round_trips() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLMTokenizer::new(hf.clone()).unwrap();
    let ids = tokenizer.encode("hello world", 64).unwrap();
    assert_eq!(
        ids,
        vec![id(&hf, "hello"), id(&hf, "world"), id(&hf, "[gMASK]"), id(&hf, "<sop>")]
    );
    assert_eq!(tokenizer.decode(&ids, true).unwrap(), "hello world");
}

#[test]
fn test_chatglm_single_turn_prompt_is_the_query() {
    let tokenizer = ChatGLMTokenizer::new(word_tokenizer()).unwrap();
    let prompt = tokenizer.build_prompt(&[ChatMessage::user("hello")]).unwrap();
    assert_eq!(prompt, "hello");
}

#[test]
fn test_chatglm_multi_turn_rounds() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLMTokenizer::new(hf.clone()).unwrap();
    let prompt = tokenizer.build_prompt(&conversation()).unwrap();
    assert_eq!(
        prompt,
        "[Round 0]\n问：hello\n答：world\n[Round 1]\n问：hi there\n答："
    );

    let ids = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    assert!(ids.contains(&id(&hf, "<n>")));
    assert_eq!(ids[ids.len() - 2..], [id(&hf, "[gMASK]"), id(&hf, "<sop>")]);
}

#[test]
fn test_chatglm_truncation_keeps_tail() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLMTokenizer::new(hf.clone()).unwrap();
    let full = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    let cut = tokenizer.apply_chat_template(&conversation(), 5).unwrap();
    assert_eq!(cut.len(), 5);
    assert_eq!(cut[..], full[full.len() - 5..]);
}

#[test]
fn test_chatglm_decode_restores_newlines() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLMTokenizer::new(hf.clone()).unwrap();
    let ids = [id(&hf, "hello"), id(&hf, "<n>"), id(&hf, "world")];
    assert_eq!(tokenizer.decode(&ids, true).unwrap(), "hello \n world");
}

// ──────────── ChatGLM2 ────────────

#[test]
fn test_chatglm2_template_and_prefix() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM2Tokenizer::new(hf.clone()).unwrap();
    assert_eq!(
        tokenizer.build_prompt(&conversation()).unwrap(),
        "[Round 1]\n\n问：hello\n\n答：world\n\n[Round 2]\n\n问：hi there\n\n答："
    );
    let ids = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    assert_eq!(ids[..2], [id(&hf, "[gMASK]"), id(&hf, "sop")]);
    assert_eq!(*ids.last().unwrap(), id(&hf, "："));
}

#[test]
fn test_chatglm2_template_is_deterministic() {
    let tokenizer = ChatGLM2Tokenizer::new(word_tokenizer()).unwrap();
    let a = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    let b = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_chatglm2_truncation_keeps_prefix_and_recent_tokens() {
    let tokenizer = ChatGLM2Tokenizer::new(word_tokenizer()).unwrap();
    let full = tokenizer.apply_chat_template(&conversation(), 128).unwrap();
    let cut = tokenizer.apply_chat_template(&conversation(), 7).unwrap();
    assert_eq!(cut.len(), 7);
    assert_eq!(cut[..2], full[..2]);
    assert_eq!(cut[2..], full[full.len() - 5..]);
}

#[test]
fn test_chatglm2_rejects_non_alternating_turns() {
    let tokenizer = ChatGLM2Tokenizer::new(word_tokenizer()).unwrap();
    let msgs = [ChatMessage::system("hi"), ChatMessage::user("hello")];
    let err = tokenizer.apply_chat_template(&msgs, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let ends_with_assistant = &conversation()[..2];
    assert!(tokenizer.apply_chat_template(ends_with_assistant, 64).is_err());
}

#[test]
fn test_zero_max_length_is_invalid() {
    let tokenizer = ChatGLM2Tokenizer::new(word_tokenizer()).unwrap();
    let err = tokenizer.encode("hello", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_round_trip_without_truncation() {
    let hf = word_tokenizer();
    for model_type in [ModelType::ChatGLM2, ModelType::ChatGLM3, ModelType::ChatGLM4] {
        let tokenizer = build_tokenizer(model_type, hf.clone()).unwrap();
        let ids = tokenizer.encode("hello world hi", 16).unwrap();
        assert_eq!(tokenizer.decode(&ids, true).unwrap(), "hello world hi");
    }
}

// ──────────── ChatGLM3 ────────────

#[test]
fn test_chatglm3_role_tokens() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM3Tokenizer::new(hf.clone()).unwrap();
    let msgs = [ChatMessage::system("hi"), ChatMessage::user("hello")];
    let ids = tokenizer.apply_chat_template(&msgs, 64).unwrap();
    assert_eq!(
        ids,
        vec![
            id(&hf, "[gMASK]"),
            id(&hf, "sop"),
            id(&hf, "<|system|>"),
            id(&hf, "hi"),
            id(&hf, "<|user|>"),
            id(&hf, "hello"),
            id(&hf, "<|assistant|>"),
        ]
    );
}

#[test]
fn test_chatglm3_code_call_becomes_extra_message() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM3Tokenizer::new(hf.clone()).unwrap();
    let msg = ChatMessage::assistant("hello").with_tool_calls(vec![ToolCallMessage::code("world")]);
    let ids = tokenizer.apply_chat_template(&[msg], 64).unwrap();
    let assistant = id(&hf, "<|assistant|>");
    assert_eq!(ids.iter().filter(|&&t| t == assistant).count(), 3);
    assert!(ids.contains(&id(&hf, "world")));
}

#[test]
fn test_chatglm3_decodes_function_call() {
    let lines = ["get_weather", "```python", "tool_call(city='Beijing', days=2)", "```"];
    let hf = line_tokenizer(&lines);
    let tokenizer = ChatGLM3Tokenizer::new(hf.clone()).unwrap();
    let nl = id(&hf, "\n");
    let mut ids = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            ids.push(nl);
        }
        ids.push(id(&hf, line));
    }
    ids.push(id(&hf, "<|observation|>"));

    let msg = tokenizer.decode_message(&ids).unwrap();
    assert_eq!(msg.role, Role::Assistant);
    assert_eq!(msg.tool_calls.len(), 1);
    let ToolCallMessage::Function(call) = &msg.tool_calls[0] else {
        panic!("expected a function call, got {:?}", msg.tool_calls[0]);
    };
    assert_eq!(call.name, "get_weather");
    let args: Value = serde_json::from_str(&call.arguments).unwrap();
    assert_eq!(args, json!({"city": "Beijing", "days": 2}));
}

#[test]
fn test_chatglm3_decodes_interpreter_call() {
    let lines = ["interpreter", "```python", "print(1)", "```"];
    let hf = line_tokenizer(&lines);
    let tokenizer = ChatGLM3Tokenizer::new(hf.clone()).unwrap();
    let nl = id(&hf, "\n");
    let ids = vec![
        id(&hf, "<|assistant|>"),
        id(&hf, "interpreter"),
        nl,
        id(&hf, "```python"),
        nl,
        id(&hf, "print(1)"),
        nl,
        id(&hf, "```"),
        id(&hf, "<|observation|>"),
    ];
    let msg = tokenizer.decode_message(&ids).unwrap();
    assert_eq!(msg.tool_calls, vec![ToolCallMessage::code("print(1)")]);
}

#[test]
fn test_chatglm3_plain_reply() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM3Tokenizer::new(hf.clone()).unwrap();
    let msg = tokenizer
        .decode_message(&[id(&hf, "hello"), id(&hf, "world")])
        .unwrap();
    assert_eq!(msg, ChatMessage::assistant("hello world"));
}

// ──────────── GLM-4 ────────────

#[test]
fn test_glm4_template_text() {
    let tokenizer = ChatGLM4Tokenizer::new(word_tokenizer()).unwrap();
    let msgs = [ChatMessage::system("hi"), ChatMessage::user("hello")];
    assert_eq!(
        tokenizer.build_prompt(&msgs).unwrap(),
        "[gMASK]<sop><|system|>\nhi<|user|>\nhello<|assistant|>"
    );
}

#[test]
fn test_glm4_image_placeholder() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM4Tokenizer::new(hf.clone()).unwrap();
    let image = Image::new(2, 2, vec![0; 12]).unwrap();
    let msgs = [ChatMessage::user("hello").with_image(image)];
    let ids = tokenizer.apply_chat_template(&msgs, 64).unwrap();
    assert_eq!(
        ids,
        vec![
            id(&hf, "[gMASK]"),
            id(&hf, "<sop>"),
            id(&hf, "<|user|>"),
            id(&hf, "<|begin_of_image|>"),
            id(&hf, "<|endoftext|>"),
            id(&hf, "<|end_of_image|>"),
            id(&hf, "hello"),
            id(&hf, "<|assistant|>"),
        ]
    );
}

#[test]
fn test_glm4_truncation_keeps_prefix() {
    let tokenizer = ChatGLM4Tokenizer::new(word_tokenizer()).unwrap();
    let msgs = [
        ChatMessage::user("hello world hi there"),
        ChatMessage::assistant("world"),
        ChatMessage::user("hi"),
    ];
    let full = tokenizer.apply_chat_template(&msgs, 128).unwrap();
    let cut = tokenizer.apply_chat_template(&msgs, 6).unwrap();
    assert_eq!(cut.len(), 6);
    assert_eq!(cut[..2], full[..2]);
    assert_eq!(cut[2..], full[full.len() - 4..]);
}

#[test]
fn test_glm4_decodes_json_function_call() {
    let lines = ["get_weather", r#"{"location": "Beijing"}"#];
    let hf = line_tokenizer(&lines);
    let tokenizer = ChatGLM4Tokenizer::new(hf.clone()).unwrap();
    let ids = [
        id(&hf, lines[0]),
        id(&hf, "\n"),
        id(&hf, lines[1]),
        id(&hf, "<|observation|>"),
    ];
    let msg = tokenizer.decode_message(&ids).unwrap();
    let ToolCallMessage::Function(call) = &msg.tool_calls[0] else {
        panic!("expected a function call");
    };
    assert_eq!(call.name, "get_weather");
    assert_eq!(
        serde_json::from_str::<Value>(&call.arguments).unwrap(),
        json!({"location": "Beijing"})
    );
}

#[test]
fn test_glm4_json_without_observation_is_plain_text() {
    let lines = ["Summary", r#"{"a": 1}"#];
    let hf = line_tokenizer(&lines);
    let tokenizer = ChatGLM4Tokenizer::new(hf.clone()).unwrap();
    let ids = [
        id(&hf, lines[0]),
        id(&hf, "\n"),
        id(&hf, lines[1]),
        id(&hf, "<|user|>"),
    ];
    let msg = tokenizer.decode_message(&ids).unwrap();
    assert!(msg.tool_calls.is_empty());
    assert_eq!(msg.content, "Summary\n{\"a\": 1}");
}

#[test]
fn test_glm4_plain_reply_has_no_tool_calls() {
    let hf = word_tokenizer();
    let tokenizer = ChatGLM4Tokenizer::new(hf.clone()).unwrap();
    let msg = tokenizer
        .decode_message(&[id(&hf, "hello"), id(&hf, "world")])
        .unwrap();
    assert!(msg.tool_calls.is_empty());
    assert_eq!(msg.content, "hello world");
}

// ──────────── Family selection ────────────

#[test]
fn test_terminators_per_family() {
    let hf = word_tokenizer();
    assert!(terminator_ids(ModelType::ChatGLM2, &hf).is_empty());
    assert_eq!(
        terminator_ids(ModelType::ChatGLM3, &hf),
        vec![id(&hf, "<|user|>"), id(&hf, "<|observation|>")]
    );
    assert_eq!(terminator_ids(ModelType::ChatGLM4V, &hf).len(), 3);
}

#[test]
fn test_missing_special_token_is_a_tokenizer_error() {
    let bare = HfTokenizer::from_json(
        &json!({
            "version": "1.0",
            "model": {"type": "WordLevel", "vocab": {"[UNK]": 0}, "unk_token": "[UNK]"},
            "pre_tokenizer": {"type": "Whitespace"}
        })
        .to_string(),
    )
    .unwrap();
    let err = ChatGLM4Tokenizer::new(bare).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Tokenizer);
}
