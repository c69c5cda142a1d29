//! Tests against a real GGUF model.
//!
//! Set `LLAMA_TEST_MODEL` to a small model (e.g. a Q4 quant of a ~100M
//! parameter chat model) to run them; otherwise every test is skipped.

use std::sync::{Arc, OnceLock};

use llama_core::{
    ChatMessage, ContextParams, ContextState, FinishReason, GenerateEvent, GenerateRequest, LlamaBackend,
    LlamaBatch, LlamaContext, LlamaError, LlamaModel, LlamaSampler, LlamaToken, LoraAdapter, ModelParams,
    PoolingType, SamplerChain, SamplingParams, apply_model_template, embed, generate, generate_blocking,
};

fn load_model() -> Option<Arc<LlamaModel>> {
    static MODEL: OnceLock<Option<Arc<LlamaModel>>> = OnceLock::new();
    MODEL
        .get_or_init(|| {
            let path = std::env::var_os("LLAMA_TEST_MODEL")?;
            let backend = LlamaBackend::init();
            backend.void_logs();
            let params = ModelParams {
                n_gpu_layers: 0,
                ..Default::default()
            };
            Some(Arc::new(
                LlamaModel::load_from_file(std::path::Path::new(&path), &params).expect("load test model"),
            ))
        })
        .clone()
}

macro_rules! model_or_skip {
    () => {
        match load_model() {
            Some(m) => m,
            None => {
                eprintln!("LLAMA_TEST_MODEL not set, skipping");
                return;
            }
        }
    };
}

fn context(model: &Arc<LlamaModel>, n_ctx: u32) -> LlamaContext {
    let params = ContextParams {
        n_ctx,
        n_batch: 64,
        n_ubatch: 64,
        ..Default::default()
    };
    LlamaContext::new(Arc::clone(model), &params).unwrap()
}

fn greedy() -> SamplingParams {
    SamplingParams {
        temperature: 0.0,
        repeat_penalty: 1.0,
        ..Default::default()
    }
}

#[test]
fn model_metadata() {
    let model = model_or_skip!();
    assert!(model.n_vocab() > 0);
    assert!(model.n_embd() > 0);
    assert!(model.n_layer() > 0);
    assert!(!model.desc().is_empty());
    let meta = model.metadata();
    assert!(meta.contains_key("general.architecture"));
    assert_eq!(
        model.meta_val_str("general.architecture"),
        meta.get("general.architecture").cloned()
    );
    assert!(model.meta_val_str("no.such.key").is_none());
}

#[test]
fn tokenize_and_detokenize() {
    let model = model_or_skip!();
    let tokens = model.tokenize("Hello world", false, false).unwrap();
    assert!(!tokens.is_empty());
    let text = model.detokenize(&tokens, false, false).unwrap();
    assert_eq!(text.trim(), "Hello world");
    assert!(model.tokenize("", false, false).unwrap().is_empty());

    let vocab = model.vocab();
    assert!(vocab.text(LlamaToken(vocab.n_tokens())).is_none());
    if let Some(eos) = vocab.eos() {
        assert!(vocab.is_eog(eos));
    }
}

#[test]
fn decode_produces_logits_and_fills_cache() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 256);
    let tokens = model.tokenize("The capital of France is", true, false).unwrap();

    let batch = LlamaBatch::get_one(&tokens).unwrap();
    assert!(!batch.is_owned());
    ctx.decode(&batch).unwrap();

    let logits = ctx.logits_ith(-1).unwrap();
    assert_eq!(logits.len(), model.n_vocab() as usize);

    let n = tokens.len() as i32;
    let mut kv = ctx.memory().unwrap();
    assert_eq!(kv.seq_pos_max(0), Some(n - 1));
    assert_eq!(kv.seq_next_pos(0), n);
    assert!(kv.truncate(0, 2));
    assert_eq!(kv.seq_pos_max(0), Some(1));
    kv.clear(true);
    assert_eq!(kv.seq_pos_max(0), None);
}

#[test]
fn decode_empty_batch_is_rejected() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 128);
    let batch = LlamaBatch::new(8, 1).unwrap();
    assert!(matches!(ctx.decode(&batch), Err(LlamaError::InvalidArgument(_))));
}

#[test]
fn greedy_chain_picks_argmax() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 128);
    let tokens = model.tokenize("One, two, three,", true, false).unwrap();
    ctx.decode(&LlamaBatch::get_one(&tokens).unwrap()).unwrap();

    let argmax = ctx
        .logits_ith(-1)
        .unwrap()
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| LlamaToken(i as i32))
        .unwrap();

    let mut chain = SamplerChain::new(true).with(LlamaSampler::greedy());
    assert_eq!(chain.sample(&ctx, -1).unwrap(), argmax);
}

#[test]
fn sampling_without_logits_is_rejected() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 128);
    let mut chain = SamplerChain::new(true).with(LlamaSampler::greedy());
    assert!(matches!(chain.sample(&ctx, 0), Err(LlamaError::InvalidArgument(_))));

    // Only the last prompt token requests logits.
    let tokens = model.tokenize("One, two, three,", true, false).unwrap();
    assert!(tokens.len() > 1);
    ctx.decode(&LlamaBatch::get_one(&tokens).unwrap()).unwrap();
    let mut single = LlamaSampler::greedy();
    assert!(matches!(single.sample(&ctx, 0), Err(LlamaError::InvalidArgument(_))));
    assert!(single.sample(&ctx, -1).is_ok());
}

#[test]
fn state_round_trip() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 128);
    let tokens = model.tokenize("A short prompt", true, false).unwrap();
    ctx.decode(&LlamaBatch::get_one(&tokens).unwrap()).unwrap();

    let state = ctx.save_state(&tokens).unwrap();
    assert!(state.size() > 0);
    assert_eq!(state.n_ctx, ctx.n_ctx());

    ctx.kv_cache_clear();
    assert_eq!(ctx.memory().unwrap().seq_pos_max(0), None);

    ctx.load_state(&state).unwrap();
    assert_eq!(ctx.memory().unwrap().seq_pos_max(0), Some(tokens.len() as i32 - 1));

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("session.bin");
    ctx.save_state_file(&file, &tokens).unwrap();
    let restored = ctx.load_state_file(&file, ctx.n_ctx() as usize).unwrap();
    assert_eq!(restored, tokens);
}

#[test]
fn state_too_large_for_context_is_rejected() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 64);
    let state = ContextState {
        n_ctx: 4096,
        tokens: vec![LlamaToken(0); ctx.n_ctx() as usize + 1],
        data: Vec::new(),
    };
    assert!(matches!(ctx.load_state(&state), Err(LlamaError::StateLoadFailed(_))));
}

#[test]
fn greedy_generation_is_deterministic() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 256);
    let mut request = GenerateRequest::new(model.tokenize("Once upon a time", true, false).unwrap());
    request.max_tokens = 8;
    request.sampling_params = greedy();

    let first = generate(&mut ctx, &request).unwrap();
    let second = generate(&mut ctx, &request).unwrap();
    assert_eq!(first.text, second.text);
    assert!(first.completion_tokens <= 8);
    assert!(matches!(first.finish_reason, FinishReason::Length | FinishReason::Stop));
}

#[test]
fn streaming_generation_ends_with_done() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 256);
    let mut request = GenerateRequest::new(model.tokenize("Hello", true, false).unwrap());
    request.max_tokens = 4;
    request.sampling_params = greedy();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let events = std::thread::scope(|s| {
        s.spawn(|| generate_blocking(&mut ctx, &request, tx));
        let mut events = Vec::new();
        while let Some(ev) = rx.blocking_recv() {
            events.push(ev);
        }
        events
    });

    match events.last() {
        Some(GenerateEvent::Done {
            prompt_tokens,
            completion_tokens,
            ..
        }) => {
            assert_eq!(*prompt_tokens as usize, request.tokens.len());
            assert!(*completion_tokens <= 4);
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[test]
fn closed_receiver_cancels_without_done() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 256);
    let mut request = GenerateRequest::new(model.tokenize("Count to one hundred:", true, false).unwrap());
    request.max_tokens = 200;
    request.sampling_params = greedy();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    rx.close();
    generate_blocking(&mut ctx, &request, tx);
    assert!(rx.blocking_recv().is_none());
}

#[test]
fn prompt_longer_than_context_is_rejected() {
    let model = model_or_skip!();
    let mut ctx = context(&model, 32);
    let request = GenerateRequest::new(vec![LlamaToken(1); 64]);
    assert!(matches!(generate(&mut ctx, &request), Err(LlamaError::InvalidArgument(_))));
}

#[test]
fn model_chat_template_renders() {
    let model = model_or_skip!();
    let prompt = apply_model_template(&model, &[ChatMessage::user("ping")], true).unwrap();
    assert!(prompt.contains("ping"));
}

#[test]
fn embeddings_are_normalized() {
    let model = model_or_skip!();
    let params = ContextParams {
        n_ctx: 256,
        n_batch: 128,
        n_ubatch: 128,
        n_seq_max: 2,
        embeddings: true,
        pooling_type: PoolingType::Mean,
        ..Default::default()
    };
    let mut ctx = LlamaContext::new(Arc::clone(&model), &params).unwrap();
    let inputs = vec![
        model.tokenize("first sentence", true, false).unwrap(),
        model.tokenize("second sentence", true, false).unwrap(),
    ];
    let vectors = embed(&mut ctx, &inputs, true).unwrap();
    assert_eq!(vectors.len(), 2);
    for v in &vectors {
        assert_eq!(v.len(), model.n_embd() as usize);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }
}

#[test]
fn embed_packs_by_ubatch_and_restores_mode() {
    let model = model_or_skip!();
    let params = ContextParams {
        n_ctx: 256,
        n_batch: 128,
        n_ubatch: 16,
        n_seq_max: 4,
        pooling_type: PoolingType::Mean,
        ..Default::default()
    };
    let mut ctx = LlamaContext::new(Arc::clone(&model), &params).unwrap();
    assert!(!ctx.embeddings_enabled());

    let long = model.tokenize(&"word ".repeat(40), true, false).unwrap();
    assert!(long.len() > 16);
    assert!(matches!(embed(&mut ctx, &[long], true), Err(LlamaError::InvalidArgument(_))));

    // Together these exceed one ubatch, so they are split across decodes.
    let inputs: Vec<_> = ["red apple", "green pear", "blue plum", "ripe fig"]
        .iter()
        .map(|s| model.tokenize(s, true, false).unwrap())
        .collect();
    let vectors = embed(&mut ctx, &inputs, true).unwrap();
    assert_eq!(vectors.len(), inputs.len());
    assert!(!ctx.embeddings_enabled());

    // The context still produces logits afterwards.
    let prompt = model.tokenize("Hello", true, false).unwrap();
    ctx.kv_cache_clear();
    ctx.decode(&LlamaBatch::get_one(&prompt).unwrap()).unwrap();
    assert!(ctx.logits_ith(-1).is_some());
}

#[test]
fn bogus_lora_file_fails() {
    let model = model_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.gguf");
    std::fs::write(&path, b"not a gguf file").unwrap();
    assert!(matches!(
        LoraAdapter::load(Arc::clone(&model), &path),
        Err(LlamaError::LoraAdapter(_))
    ));
}

#[test]
fn missing_model_file_fails() {
    LlamaBackend::init();
    let err = LlamaModel::load_from_file(std::path::Path::new("/nonexistent/model.gguf"), &ModelParams::default())
        .unwrap_err();
    assert!(matches!(err, LlamaError::ModelLoadFailed { .. }));
}
