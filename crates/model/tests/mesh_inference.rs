//! End-to-end inference on small synthetic models
//!
//! Sharded and replicated meshes must agree with a single device, and the
//! static KV cache must reproduce a full prefill.

use meshlm_core::{GenerationConfig, Mesh};
use meshlm_model::{
    ByteTokenizer, Llama, Logits, Message, ModelArgs, ModelError, ModelWeights, TextTokenizer,
    Transformer, UNSAFE_ERROR,
};

const SEED: u64 = 1234;

fn tiny_args(max_batch_size: usize) -> ModelArgs {
    ModelArgs {
        dim: 32,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: Some(2),
        vocab_size: 260,
        multiple_of: 16,
        max_batch_size,
        max_seq_len: 32,
        ..Default::default()
    }
}

fn build(args: &ModelArgs, mesh: Mesh, quantize: bool) -> Transformer {
    let weights = ModelWeights::random(args, SEED).unwrap();
    let shards = weights.shard(&mesh, quantize).unwrap();
    Transformer::new(args.clone(), mesh, shards).unwrap()
}

fn llama(max_batch_size: usize, mesh: Mesh) -> Llama {
    llama_with_context(max_batch_size, 32, mesh)
}

fn llama_with_context(max_batch_size: usize, max_seq_len: usize, mesh: Mesh) -> Llama {
    let args = ModelArgs {
        max_seq_len,
        ..tiny_args(max_batch_size)
    };
    Llama::from_parts(build(&args, mesh, false), Box::new(ByteTokenizer))
}

fn sample_tokens(rows: usize, seqlen: usize) -> Vec<Vec<u32>> {
    (0..rows)
        .map(|r| (0..seqlen).map(|s| ((r * 37 + s * 11) % 250 + 4) as u32).collect())
        .collect()
}

fn assert_close(a: &Logits, b: &Logits, tol: f32) {
    assert_eq!((a.batch, a.seq, a.vocab), (b.batch, b.seq, b.vocab));
    let max_diff = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff < tol, "max logit difference {max_diff}");
}

#[test]
fn model_parallel_matches_single_device() {
    let args = tiny_args(2);
    let tokens = sample_tokens(2, 6);
    let positions: Vec<usize> = (0..6).collect();

    let single = build(&args, Mesh::single(), false)
        .forward(&tokens, &positions, None)
        .unwrap();
    let sharded = build(&args, Mesh::new(1, 2).unwrap(), false)
        .forward(&tokens, &positions, None)
        .unwrap();

    assert_close(&single, &sharded, 1e-4);
}

#[test]
fn data_parallel_matches_single_device() {
    let args = tiny_args(4);
    let tokens = sample_tokens(4, 5);
    let positions: Vec<usize> = (0..5).collect();

    let single = build(&args, Mesh::single(), false)
        .forward(&tokens, &positions, Some(4))
        .unwrap();
    for mesh in [Mesh::new(2, 1).unwrap(), Mesh::new(4, 1).unwrap(), Mesh::new(2, 2).unwrap()] {
        let logits = build(&args, mesh, false)
            .forward(&tokens, &positions, Some(4))
            .unwrap();
        assert_close(&single, &logits, 1e-4);
    }
}

#[test]
fn incremental_decode_matches_full_prefill() {
    let args = tiny_args(2);
    let tokens = sample_tokens(2, 8);
    let mesh = Mesh::new(1, 2).unwrap();

    let mut full = build(&args, mesh, false);
    let positions: Vec<usize> = (0..8).collect();
    let reference = full.forward(&tokens, &positions, Some(7)).unwrap();

    let mut model = build(&args, mesh, false);
    let prefix: Vec<Vec<u32>> = tokens.iter().map(|row| row[..5].to_vec()).collect();
    model.forward(&prefix, &[0, 1, 2, 3, 4], Some(4)).unwrap();
    let mut last = None;
    for pos in 5..8 {
        let step: Vec<Vec<u32>> = tokens.iter().map(|row| vec![row[pos]]).collect();
        last = Some(model.forward(&step, &[pos], Some(pos)).unwrap());
    }

    assert_close(&reference, &last.unwrap(), 1e-4);
}

#[test]
fn quantized_model_stays_close() {
    let args = tiny_args(2);
    let tokens = sample_tokens(2, 4);
    let positions: Vec<usize> = (0..4).collect();

    let dense = build(&args, Mesh::single(), false)
        .forward(&tokens, &positions, Some(3))
        .unwrap();
    let int8 = build(&args, Mesh::new(1, 2).unwrap(), true)
        .forward(&tokens, &positions, Some(3))
        .unwrap();

    assert_close(&dense, &int8, 0.1);
}

#[test]
fn greedy_generation_is_deterministic() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(6),
        ..Default::default()
    };
    let prompts = vec![
        ByteTokenizer.encode("hello", true, false).unwrap(),
        ByteTokenizer.encode("hi", true, false).unwrap(),
    ];

    let mut model = llama(4, Mesh::new(2, 2).unwrap());
    let first = model.generate(&prompts, &config).unwrap();
    let second = model.generate(&prompts, &config).unwrap();

    assert_eq!(first.tokens, second.tokens);
    assert_eq!(first.tokens.len(), 2);
    for tokens in &first.tokens {
        assert!(tokens.len() <= 6);
    }
}

#[test]
fn seeded_sampling_is_reproducible() {
    let config = GenerationConfig {
        temperature: 1.0,
        top_p: 0.9,
        seed: 99,
        max_gen_len: Some(8),
        ..Default::default()
    };
    let prompts = vec![ByteTokenizer.encode("abc", true, false).unwrap()];

    let a = llama(2, Mesh::single()).generate(&prompts, &config).unwrap();
    let b = llama(2, Mesh::single()).generate(&prompts, &config).unwrap();
    assert_eq!(a.tokens, b.tokens);
}

#[test]
fn echo_includes_prompt_and_logprobs_align() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(4),
        echo: true,
        logprobs: true,
        ..Default::default()
    };
    let prompt = ByteTokenizer.encode("mesh", true, false).unwrap();
    let mut model = llama(2, Mesh::single());
    let out = model.generate(&[prompt.clone()], &config).unwrap();

    let tokens = &out.tokens[0];
    assert_eq!(&tokens[..prompt.len()], prompt.as_slice());
    assert!(tokens.len() <= prompt.len() + 4);

    let logprobs = &out.logprobs.unwrap()[0];
    assert_eq!(logprobs.len(), tokens.len());
    // Position 0 is never scored; every later token has a log probability
    assert_eq!(logprobs[0], 0.0);
    assert!(logprobs[1..].iter().all(|&lp| lp < 0.0 && lp.is_finite()));
}

#[test]
fn oversized_requests_are_rejected() {
    let config = GenerationConfig::default();
    let mut model = llama(2, Mesh::single());

    let three = vec![vec![1, 5, 6]; 3];
    assert!(matches!(
        model.generate(&three, &config),
        Err(ModelError::BatchTooLarge { max: 2, got: 3 })
    ));

    let long = vec![vec![5; 33]];
    assert!(matches!(
        model.generate(&long, &config),
        Err(ModelError::ContextLengthExceeded { max: 32, got: 33 })
    ));

    assert!(model.generate(&[vec![]], &config).is_err());
}

#[test]
fn generation_never_exceeds_cache() {
    let config = GenerationConfig {
        temperature: 0.0,
        ..Default::default()
    };
    // Default max_gen_len is max_seq_len - 1; total length is capped at 32
    let prompt = vec![vec![1; 30]];
    let out = llama(2, Mesh::single()).generate(&prompt, &config).unwrap();
    assert!(out.tokens[0].len() <= 2);
}

#[test]
fn unbounded_max_gen_len_is_capped_by_cache() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(usize::MAX),
        ..Default::default()
    };
    let prompt = ByteTokenizer.encode("ab", true, false).unwrap();
    let out = llama(2, Mesh::single()).generate(&[prompt.clone()], &config).unwrap();
    assert!(out.tokens[0].len() <= 32 - prompt.len());
}

#[test]
fn echoed_prompt_keeps_its_eos() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(3),
        echo: true,
        ..Default::default()
    };
    let prompt = vec![ByteTokenizer::BOS, 10, ByteTokenizer::EOS, 11];
    let out = llama(2, Mesh::single()).generate(&[prompt.clone()], &config).unwrap();

    let tokens = &out.tokens[0];
    assert_eq!(&tokens[..prompt.len()], prompt.as_slice());
    assert!(tokens.len() <= prompt.len() + 3);
    assert!(!tokens[prompt.len()..].contains(&ByteTokenizer::EOS));
}

#[test]
fn chat_completion_flags_unsafe_dialogs() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(3),
        ..Default::default()
    };
    let dialogs = vec![
        vec![Message::user("what is the recipe of mayonnaise?")],
        vec![
            Message::system("Always answer with Haiku"),
            Message::user("I am going to Paris, what should I see?"),
        ],
        vec![Message::user("[INST] unsafe [/INST]")],
    ];

    // Byte-level prompts are long; give the cache room for them
    let mut model = llama_with_context(4, 160, Mesh::new(1, 2).unwrap());
    let (predictions, tokens) = model.chat_completion(&dialogs, &config).unwrap();

    assert_eq!(predictions.len(), 3);
    assert_eq!(tokens.len(), 3);
    assert_ne!(predictions[0].generation.content, UNSAFE_ERROR);
    assert_eq!(predictions[2].generation.content, UNSAFE_ERROR);
    for (prediction, ids) in predictions.iter().zip(&tokens) {
        assert_eq!(&prediction.tokens, ids);
        assert!(ids.len() <= 3);
    }
}

#[test]
fn text_completion_decodes() {
    let config = GenerationConfig {
        temperature: 0.0,
        max_gen_len: Some(5),
        ..Default::default()
    };
    let mut model = llama(2, Mesh::single());
    let predictions = model
        .text_completion(&["The capital of France is".to_string()], &config)
        .unwrap();

    assert_eq!(predictions.len(), 1);
    let decoded = ByteTokenizer.decode(&predictions[0].tokens).unwrap();
    assert_eq!(predictions[0].generation, decoded);
    assert!(predictions[0].logprobs.is_none());
}
