//! Batched generation over the static KV cache
//!
//! Every forward pass runs the full static batch of `max_batch_size` rows.
//! Prompts are prefilled up to the shortest prompt length; after that one
//! position is decoded per step. Rows whose prompt is longer than the
//! current position keep their prompt token instead of the sampled one.
//!
//! ```text
//! pos:      0 ........ min_prompt ........ total_len
//! row 0:    [prompt............][gen gen gen eos]
//! row 1:    [prompt.......][gen gen gen gen gen ]
//! padding:  [pad pad pad pad pad pad pad pad pad]   (up to max_batch_size)
//! ```

use std::time::Instant;

use serde::Serialize;

use meshlm_core::{GenerationConfig, Mesh, RuntimeConfig};

use crate::chat::{encode_dialog, is_unsafe, Dialog, Message, Role, UNSAFE_ERROR};
use crate::error::{ModelError, Result};
use crate::loader::CheckpointLoader;
use crate::sampling::{log_softmax, Sampler};
use crate::tokenizer::{TextTokenizer, Tokenizer};
use crate::transformer::Transformer;

/// Token id used for padding rows and unfilled positions
const PAD_ID: u32 = 0;

/// Raw output of `generate`, one entry per prompt
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub tokens: Vec<Vec<u32>>,
    pub logprobs: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionPrediction {
    pub generation: String,
    pub tokens: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatPrediction {
    pub generation: Message,
    pub tokens: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<f32>>,
}

/// Llama 2 model plus tokenizer
pub struct Llama {
    model: Transformer,
    tokenizer: Box<dyn TextTokenizer>,
}

impl Llama {
    /// Load tokenizer and checkpoint, shard the weights over the mesh
    pub fn build(config: &RuntimeConfig) -> Result<Self> {
        let start = Instant::now();
        config.validate()?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path)?;
        let loader = CheckpointLoader::open(&config.ckpt_dir)?;

        let mut args = loader.args().clone();
        if args.vocab_size <= 0 {
            args.vocab_size = tokenizer.vocab_size() as i64;
        }
        args.max_seq_len = config.max_seq_len;
        args.max_batch_size = config.max_batch_size;
        args.quant = config.quantize;

        let mesh = Mesh::from_config(&config.mesh)?;
        args.validate(mesh.model_size())?;

        let weights = loader.load_weights(&args)?;
        let shards = weights.shard(&mesh, args.quant)?;
        drop(weights);

        let model = Transformer::new(args, mesh, shards)?;
        tracing::info!("Loaded in {:.2} seconds", start.elapsed().as_secs_f64());
        Ok(Self::from_parts(model, Box::new(tokenizer)))
    }

    pub fn from_parts(model: Transformer, tokenizer: Box<dyn TextTokenizer>) -> Self {
        Self { model, tokenizer }
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    /// Generate continuations for a batch of tokenized prompts
    pub fn generate(&mut self, prompt_tokens: &[Vec<u32>], config: &GenerationConfig) -> Result<GenerationOutput> {
        config.validate()?;
        let max_batch = self.model.args().max_batch_size;
        let max_seq_len = self.model.args().max_seq_len;

        let bsz = prompt_tokens.len();
        if bsz == 0 {
            return Ok(GenerationOutput::default());
        }
        if bsz > max_batch {
            return Err(ModelError::BatchTooLarge { max: max_batch, got: bsz });
        }
        if prompt_tokens.iter().any(|p| p.is_empty()) {
            return Err(ModelError::InvalidInput("empty prompt".to_string()));
        }

        let prompt_lens: Vec<usize> = prompt_tokens.iter().map(Vec::len).collect();
        let min_prompt_len = prompt_lens.iter().copied().min().unwrap_or(0);
        let max_prompt_len = prompt_lens.iter().copied().max().unwrap_or(0);
        if max_prompt_len > max_seq_len {
            return Err(ModelError::ContextLengthExceeded {
                max: max_seq_len,
                got: max_prompt_len,
            });
        }

        let max_gen_len = config.max_gen_len.unwrap_or(max_seq_len - 1);
        let total_len = max_seq_len.min(max_gen_len.saturating_add(max_prompt_len));

        let mut tokens = vec![vec![PAD_ID; total_len]; max_batch];
        for (row, prompt) in tokens.iter_mut().zip(prompt_tokens) {
            row[..prompt.len()].copy_from_slice(prompt);
        }
        let mut logprobs = config.logprobs.then(|| vec![vec![0.0f32; total_len]; bsz]);
        let mut eos_reached = vec![false; bsz];
        let eos = self.tokenizer.eos_id();
        let mut sampler = Sampler::from_config(config);

        tracing::info!(
            "Generating for {} prompts (static batch {}), prompt lengths {}..={}, up to {} positions",
            bsz,
            max_batch,
            min_prompt_len,
            max_prompt_len,
            total_len
        );
        let start = Instant::now();
        self.model.reset_caches();

        let mut prev_pos = 0;
        let mut steps = 0;
        for cur_pos in min_prompt_len..total_len {
            let input_indexes: Vec<usize> = (prev_pos..cur_pos).collect();
            let chunk: Vec<Vec<u32>> = tokens.iter().map(|row| row[prev_pos..cur_pos].to_vec()).collect();

            // Per-position logits are only needed to score prompt tokens
            let output_index = if config.logprobs { None } else { Some(cur_pos - 1) };
            let logits = self.model.forward(&chunk, &input_indexes, output_index)?;

            for row in 0..bsz {
                let next = if cur_pos < prompt_lens[row] {
                    tokens[row][cur_pos]
                } else {
                    sampler.sample(logits.last(row))
                };
                tokens[row][cur_pos] = next;

                if let Some(lp) = logprobs.as_mut() {
                    for j in 0..logits.seq {
                        let pos = prev_pos + j + 1;
                        let scores = log_softmax(logits.at(row, j));
                        lp[row][pos] = scores[tokens[row][pos] as usize];
                    }
                }

                if cur_pos >= prompt_lens[row] && next == eos {
                    eos_reached[row] = true;
                }
            }

            prev_pos = cur_pos;
            steps += 1;
            if eos_reached.iter().all(|&done| done) {
                break;
            }
        }
        tracing::debug!(
            "Ran {} forward steps in {:.2}s",
            steps,
            start.elapsed().as_secs_f64()
        );

        let mut out_tokens = Vec::with_capacity(bsz);
        let mut out_logprobs = logprobs.as_ref().map(|_| Vec::with_capacity(bsz));
        for (row, &prompt_len) in prompt_lens.iter().enumerate() {
            let begin = if config.echo { 0 } else { prompt_len };
            let mut end = prompt_len.saturating_add(max_gen_len).min(total_len);
            if let Some(eos_pos) = tokens[row][prompt_len..end].iter().position(|&t| t == eos) {
                end = prompt_len + eos_pos;
            }

            out_tokens.push(tokens[row][begin..end].to_vec());
            if let (Some(out), Some(lp)) = (out_logprobs.as_mut(), logprobs.as_ref()) {
                out.push(lp[row][begin..end].to_vec());
            }
        }

        Ok(GenerationOutput {
            tokens: out_tokens,
            logprobs: out_logprobs,
        })
    }

    /// Complete each prompt
    pub fn text_completion(&mut self, prompts: &[String], config: &GenerationConfig) -> Result<Vec<CompletionPrediction>> {
        let prompt_tokens = prompts
            .iter()
            .map(|p| self.tokenizer.encode(p, true, false))
            .collect::<Result<Vec<_>>>()?;

        let output = self.generate(&prompt_tokens, config)?;
        output
            .tokens
            .into_iter()
            .enumerate()
            .map(|(i, tokens)| {
                Ok(CompletionPrediction {
                    generation: self.tokenizer.decode(&tokens)?,
                    tokens,
                    logprobs: output.logprobs.as_ref().map(|lp| lp[i].clone()),
                })
            })
            .collect()
    }

    /// Reply to each dialog
    ///
    /// Returns the predictions and the generated token ids. Dialogs that
    /// contain special tags are still run but answered with `UNSAFE_ERROR`.
    pub fn chat_completion(
        &mut self,
        dialogs: &[Dialog],
        config: &GenerationConfig,
    ) -> Result<(Vec<ChatPrediction>, Vec<Vec<u32>>)> {
        let mut prompt_tokens = Vec::with_capacity(dialogs.len());
        let mut unsafe_requests = Vec::with_capacity(dialogs.len());
        for dialog in dialogs {
            unsafe_requests.push(is_unsafe(dialog));
            prompt_tokens.push(encode_dialog(dialog, self.tokenizer.as_ref())?);
        }

        let output = self.generate(&prompt_tokens, config)?;
        let mut predictions = Vec::with_capacity(dialogs.len());
        for (i, tokens) in output.tokens.iter().enumerate() {
            let content = if unsafe_requests[i] {
                UNSAFE_ERROR.to_string()
            } else {
                self.tokenizer.decode(tokens)?
            };
            predictions.push(ChatPrediction {
                generation: Message {
                    role: Role::Assistant,
                    content,
                },
                tokens: tokens.clone(),
                logprobs: output.logprobs.as_ref().map(|lp| lp[i].clone()),
            });
        }

        if unsafe_requests.iter().any(|&u| u) {
            tracing::warn!("{} dialogs rejected for special tags", unsafe_requests.iter().filter(|&&u| u).count());
        }
        Ok((predictions, output.tokens))
    }
}
