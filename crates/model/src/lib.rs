//! MeshLM Model - Llama 2 inference over a sharded device mesh
//!
//! This crate provides:
//! - Loading Meta Llama 2 checkpoints (params.json + safetensors)
//! - Tensor-parallel layers sharded across the model axis of the mesh
//! - A KV cache of fixed size addressed by explicit positions
//! - Batched text and chat completion with nucleus sampling

pub mod args;
pub mod attention;
pub mod chat;
pub mod error;
pub mod feed_forward;
pub mod generation;
pub mod kv_cache;
pub mod linear;
pub mod loader;
pub mod norm;
pub mod rope;
pub mod sampling;
pub mod tokenizer;
pub mod transformer;
pub mod weights;

pub use args::ModelArgs;
pub use chat::{Dialog, Message, Role, UNSAFE_ERROR};
pub use error::{ModelError, Result};
pub use generation::{ChatPrediction, CompletionPrediction, GenerationOutput, Llama};
pub use kv_cache::{KvCache, KvCacheConfig};
pub use loader::CheckpointLoader;
pub use tokenizer::{ByteTokenizer, TextTokenizer, Tokenizer};
pub use transformer::{Logits, Transformer};
pub use weights::{ModelWeights, ShardWeights};
