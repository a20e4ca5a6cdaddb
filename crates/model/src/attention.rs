//! Multi-head attention over the static KV cache
//!
//! Each model rank owns `n_heads / world` query heads and
//! `n_kv_heads / world` key/value heads. Query head `h` reads kv head
//! `h / n_rep` (grouped-query attention). The output projection is
//! row-parallel, so the result is a partial sum the caller all-reduces.

use rayon::prelude::*;

use meshlm_core::{divide_exact, dot};

use crate::args::ModelArgs;
use crate::error::Result;
use crate::kv_cache::KvCache;
use crate::linear::{ColumnParallelLinear, RowParallelLinear};
use crate::rope::RopeTable;
use crate::weights::LayerWeights;

/// Attention weights of one layer on one model rank
#[derive(Debug, Clone)]
pub struct Attention {
    pub wq: ColumnParallelLinear,
    pub wk: ColumnParallelLinear,
    pub wv: ColumnParallelLinear,
    pub wo: RowParallelLinear,
    pub n_local_heads: usize,
    pub n_local_kv_heads: usize,
    pub head_dim: usize,
}

impl Attention {
    /// Take this rank's share of a layer's attention weights
    pub fn shard(layer: &LayerWeights, args: &ModelArgs, rank: usize, world: usize, quantize: bool) -> Result<Self> {
        let dim = args.dim;
        let head_dim = args.head_dim();
        let q_dim = args.n_heads * head_dim;
        let kv_dim = args.kv_heads() * head_dim;

        Ok(Self {
            wq: ColumnParallelLinear::from_full(&layer.wq, q_dim, dim, rank, world, quantize)?,
            wk: ColumnParallelLinear::from_full(&layer.wk, kv_dim, dim, rank, world, quantize)?,
            wv: ColumnParallelLinear::from_full(&layer.wv, kv_dim, dim, rank, world, quantize)?,
            wo: RowParallelLinear::from_full(&layer.wo, dim, q_dim, rank, world, quantize)?,
            n_local_heads: divide_exact(args.n_heads, world)?,
            n_local_kv_heads: divide_exact(args.kv_heads(), world)?,
            head_dim,
        })
    }

    pub fn n_rep(&self) -> usize {
        self.n_local_heads / self.n_local_kv_heads
    }

    /// Attend `x[rows * seqlen, dim]` at cache positions `input_indexes`
    ///
    /// Writes the new keys/values into `cache` and returns the partial
    /// output of `wo`, `[rows * seqlen, dim]`.
    pub fn forward(
        &self,
        x: &[f32],
        rows: usize,
        input_indexes: &[usize],
        rope: &RopeTable,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        let seqlen = input_indexes.len();
        let n = rows * seqlen;
        let head_dim = self.head_dim;
        let q_width = self.n_local_heads * head_dim;
        let kv_width = self.n_local_kv_heads * head_dim;

        let mut xq = self.wq.forward(x, n);
        let mut xk = self.wk.forward(x, n);
        let xv = self.wv.forward(x, n);

        for (t, (q_tok, k_tok)) in xq
            .chunks_exact_mut(q_width)
            .zip(xk.chunks_exact_mut(kv_width))
            .enumerate()
        {
            let pos = input_indexes[t % seqlen];
            rope.apply(q_tok, pos)?;
            rope.apply(k_tok, pos)?;
        }

        cache.index_copy(input_indexes, &xk, &xv)?;
        let cache = &*cache;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let n_rep = self.n_rep();
        let mut out = vec![0.0f32; n * q_width];

        out.par_chunks_mut(q_width)
            .zip(xq.par_chunks(q_width))
            .enumerate()
            .for_each(|(t, (out_tok, q_tok))| {
                let row = t / seqlen;
                // Causal: keys after the query position are masked out
                let pos = input_indexes[t % seqlen];
                let mut scores = vec![0.0f32; pos + 1];

                for head in 0..self.n_local_heads {
                    let kv_head = head / n_rep;
                    let q = &q_tok[head * head_dim..(head + 1) * head_dim];

                    for (j, score) in scores.iter_mut().enumerate() {
                        *score = dot(q, cache.key(row, j, kv_head)) * scale;
                    }
                    softmax_in_place(&mut scores);

                    let o = &mut out_tok[head * head_dim..(head + 1) * head_dim];
                    for (j, &p) in scores.iter().enumerate() {
                        for (oi, &vi) in o.iter_mut().zip(cache.value(row, j, kv_head)) {
                            *oi += p * vi;
                        }
                    }
                }
            });

        Ok(self.wo.forward(&out, n))
    }
}

fn softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in scores.iter_mut() {
        *s /= sum;
    }
}
