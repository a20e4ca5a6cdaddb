//! Model weight storage
//!
//! `ModelWeights` holds the full, unsharded f32 weights as loaded from a
//! checkpoint. `shard()` cuts them into one `ShardWeights` per model rank;
//! every data replica shares the same `Arc`s.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;

use meshlm_core::Mesh;

use crate::args::ModelArgs;
use crate::attention::Attention;
use crate::error::Result;
use crate::feed_forward::FeedForward;
use crate::linear::{ColumnParallelLinear, ParallelEmbedding};
use crate::norm::RmsNorm;

/// Full weights of one transformer block, `[out, in]` row-major
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv: Vec<f32>,
    pub wo: Vec<f32>,
    pub w1: Vec<f32>,
    pub w2: Vec<f32>,
    pub w3: Vec<f32>,
    pub attention_norm: Vec<f32>,
    pub ffn_norm: Vec<f32>,
}

/// Full model weights
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub args: ModelArgs,
    /// `[vocab, dim]`
    pub tok_embeddings: Vec<f32>,
    pub layers: Vec<LayerWeights>,
    pub norm: Vec<f32>,
    /// `[vocab, dim]`
    pub output: Vec<f32>,
}

impl ModelWeights {
    /// Deterministic random weights for tests and benchmarks
    ///
    /// Linear weights are uniform in `±1/sqrt(in_features)`; norms are ones.
    pub fn random(args: &ModelArgs, seed: u64) -> Result<Self> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let vocab = args.vocab()?;
        let dim = args.dim;
        let q_dim = args.n_heads * args.head_dim();
        let kv_dim = args.kv_heads() * args.head_dim();
        let hidden = args.ffn_hidden_dim();

        let mut uniform = |len: usize, fan_in: usize| -> Vec<f32> {
            let bound = 1.0 / (fan_in as f32).sqrt();
            (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let tok_embeddings = uniform(vocab * dim, 1);
        let layers = (0..args.n_layers)
            .map(|_| LayerWeights {
                wq: uniform(q_dim * dim, dim),
                wk: uniform(kv_dim * dim, dim),
                wv: uniform(kv_dim * dim, dim),
                wo: uniform(dim * q_dim, q_dim),
                w1: uniform(hidden * dim, dim),
                w2: uniform(dim * hidden, hidden),
                w3: uniform(hidden * dim, dim),
                attention_norm: vec![1.0; dim],
                ffn_norm: vec![1.0; dim],
            })
            .collect();
        let output = uniform(vocab * dim, dim);

        Ok(Self {
            args: args.clone(),
            tok_embeddings,
            layers,
            norm: vec![1.0; dim],
            output,
        })
    }

    /// Total parameter count
    pub fn num_params(&self) -> usize {
        let per_layer: usize = self
            .layers
            .iter()
            .map(|l| {
                l.wq.len()
                    + l.wk.len()
                    + l.wv.len()
                    + l.wo.len()
                    + l.w1.len()
                    + l.w2.len()
                    + l.w3.len()
                    + l.attention_norm.len()
                    + l.ffn_norm.len()
            })
            .sum();
        self.tok_embeddings.len() + per_layer + self.norm.len() + self.output.len()
    }

    /// Split into one shard per model rank of `mesh`
    pub fn shard(&self, mesh: &Mesh, quantize: bool) -> Result<Vec<Arc<ShardWeights>>> {
        let world = mesh.model_size();
        self.args.validate(world)?;

        let shards: Vec<Arc<ShardWeights>> = (0..world)
            .into_par_iter()
            .map(|rank| ShardWeights::from_full(self, rank, world, quantize).map(Arc::new))
            .collect::<Result<_>>()?;

        tracing::info!(
            "Sharded {} parameters across {} model ranks ({:.1} MB per rank{})",
            self.num_params(),
            world,
            shards.first().map(|s| s.size_bytes()).unwrap_or(0) as f64 / 1e6,
            if quantize { ", int8" } else { "" }
        );
        Ok(shards)
    }
}

/// One transformer block on one model rank
#[derive(Debug, Clone)]
pub struct LayerShard {
    pub attention: Attention,
    pub feed_forward: FeedForward,
    pub attention_norm: RmsNorm,
    pub ffn_norm: RmsNorm,
}

/// Weights held by one model rank
#[derive(Debug, Clone)]
pub struct ShardWeights {
    pub rank: usize,
    pub world: usize,
    pub tok_embeddings: ParallelEmbedding,
    pub layers: Vec<LayerShard>,
    pub norm: RmsNorm,
    pub output: ColumnParallelLinear,
}

impl ShardWeights {
    pub fn from_full(full: &ModelWeights, rank: usize, world: usize, quantize: bool) -> Result<Self> {
        let args = &full.args;
        let vocab = args.vocab()?;

        let layers = full
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerShard {
                    attention: Attention::shard(layer, args, rank, world, quantize)?,
                    feed_forward: FeedForward::shard(layer, args, rank, world, quantize)?,
                    attention_norm: RmsNorm::new(layer.attention_norm.clone(), args.norm_eps),
                    ffn_norm: RmsNorm::new(layer.ffn_norm.clone(), args.norm_eps),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rank,
            world,
            tok_embeddings: ParallelEmbedding::from_full(&full.tok_embeddings, vocab, args.dim, rank, world),
            layers,
            norm: RmsNorm::new(full.norm.clone(), args.norm_eps),
            output: ColumnParallelLinear::from_full(&full.output, vocab, args.dim, rank, world, quantize)?,
        })
    }

    /// Bytes of weights held by this rank
    pub fn size_bytes(&self) -> usize {
        let layers: usize = self
            .layers
            .iter()
            .map(|l| {
                let a = &l.attention;
                let f = &l.feed_forward;
                a.wq.weight.size_bytes()
                    + a.wk.weight.size_bytes()
                    + a.wv.weight.size_bytes()
                    + a.wo.weight.size_bytes()
                    + f.w1.weight.size_bytes()
                    + f.w2.weight.size_bytes()
                    + f.w3.weight.size_bytes()
                    + (l.attention_norm.dim() + l.ffn_norm.dim()) * 4
            })
            .sum();
        self.tok_embeddings.size_bytes() + layers + self.norm.dim() * 4 + self.output.weight.size_bytes()
    }
}
