//! Llama 2 transformer over a device mesh
//!
//! Implements the Llama 2 decoder stack:
//! - RMSNorm before attention and feed-forward
//! - Grouped-query attention with RoPE over a static KV cache
//! - SwiGLU feed-forward
//!
//! ```text
//! tokens [max_batch, seqlen]
//!   |  split by data replica
//!   v
//! replica d: rows [d*B/D, (d+1)*B/D)
//!   embedding (all-gather over model ranks)
//!   for each layer:
//!     h   = x + all_reduce(attention_r(norm(x)))     r = 0..model
//!     out = h + all_reduce(ffn_r(norm(h)))
//!   norm -> [select output_index] -> all_gather(output_r)
//! ```

use std::sync::Arc;

use rayon::prelude::*;

use meshlm_core::{Communicator, Mesh};

use crate::args::ModelArgs;
use crate::error::{ModelError, Result};
use crate::kv_cache::KvCache;
use crate::rope::RopeTable;
use crate::weights::ShardWeights;

/// Logits of a forward pass, `[batch, seq, vocab]`
#[derive(Debug, Clone)]
pub struct Logits {
    pub batch: usize,
    pub seq: usize,
    pub vocab: usize,
    pub data: Vec<f32>,
}

impl Logits {
    /// Logits of one batch row at one sequence position
    pub fn at(&self, row: usize, pos: usize) -> &[f32] {
        let start = (row * self.seq + pos) * self.vocab;
        &self.data[start..start + self.vocab]
    }

    /// Logits of the last position of a batch row
    pub fn last(&self, row: usize) -> &[f32] {
        self.at(row, self.seq - 1)
    }
}

/// KV caches of one data replica: `caches[model_rank][layer]`
#[derive(Debug)]
struct Replica {
    caches: Vec<Vec<KvCache>>,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &mut self,
        args: &ModelArgs,
        shards: &[Arc<ShardWeights>],
        comm: &Communicator,
        rope: &RopeTable,
        tokens: &[Vec<u32>],
        input_indexes: &[usize],
        select: Option<usize>,
    ) -> Result<Vec<f32>> {
        let rows = tokens.len();
        let seqlen = input_indexes.len();
        let n = rows * seqlen;
        let dim = args.dim;

        let flat: Vec<u32> = tokens.iter().flatten().copied().collect();
        let parts = shards
            .par_iter()
            .map(|shard| shard.tok_embeddings.forward(&flat))
            .collect::<Result<Vec<_>>>()?;
        let mut x = comm.all_gather(&parts, n)?;

        // Norm weights are replicated; any rank's copy will do
        let lead = &shards[0];
        for layer in 0..args.n_layers {
            let xn = lead.layers[layer].attention_norm.forward(&x);
            let partials = self
                .caches
                .par_iter_mut()
                .zip(shards.par_iter())
                .map(|(caches, shard)| {
                    shard.layers[layer]
                        .attention
                        .forward(&xn, rows, input_indexes, rope, &mut caches[layer])
                })
                .collect::<Result<Vec<_>>>()?;
            let attn = comm.reduce_sum(partials)?;
            for (h, a) in x.iter_mut().zip(&attn) {
                *h += a;
            }

            let hn = lead.layers[layer].ffn_norm.forward(&x);
            let partials: Vec<Vec<f32>> = shards
                .par_iter()
                .map(|shard| shard.layers[layer].feed_forward.forward(&hn, n))
                .collect();
            let ffn = comm.reduce_sum(partials)?;
            for (h, f) in x.iter_mut().zip(&ffn) {
                *h += f;
            }
        }

        let mut h = lead.norm.forward(&x);
        let out_rows = match select {
            Some(pos) => {
                let mut selected = Vec::with_capacity(rows * dim);
                for row in 0..rows {
                    let start = (row * seqlen + pos) * dim;
                    selected.extend_from_slice(&h[start..start + dim]);
                }
                h = selected;
                rows
            }
            None => n,
        };

        let parts: Vec<Vec<f32>> = shards
            .par_iter()
            .map(|shard| shard.output.forward(&h, out_rows))
            .collect();
        Ok(comm.all_gather(&parts, out_rows)?)
    }
}

/// Llama 2 transformer sharded over a `data x model` mesh
pub struct Transformer {
    args: ModelArgs,
    mesh: Mesh,
    comm: Communicator,
    rope: RopeTable,
    shards: Vec<Arc<ShardWeights>>,
    replicas: Vec<Replica>,
}

impl Transformer {
    /// Build from per-rank weight shards
    ///
    /// Allocates one static KV cache per (device, layer).
    pub fn new(args: ModelArgs, mesh: Mesh, shards: Vec<Arc<ShardWeights>>) -> Result<Self> {
        let world = mesh.model_size();
        args.validate(world)?;
        if shards.len() != world {
            return Err(ModelError::InvalidInput(format!(
                "expected {world} weight shards, got {}",
                shards.len()
            )));
        }
        if shards.iter().any(|s| s.layers.len() != args.n_layers) {
            return Err(ModelError::InvalidInput(format!(
                "weight shards do not have {} layers",
                args.n_layers
            )));
        }

        let rows = mesh.rows_per_replica(args.max_batch_size)?;
        let local_kv_heads = args.kv_heads() / world;
        let head_dim = args.head_dim();
        let replicas = (0..mesh.data_size())
            .map(|_| Replica {
                caches: (0..world)
                    .map(|_| {
                        (0..args.n_layers)
                            .map(|_| KvCache::new(rows, args.max_seq_len, local_kv_heads, head_dim))
                            .collect()
                    })
                    .collect(),
            })
            .collect();

        let rope = RopeTable::new(head_dim, args.max_seq_len * 2, args.rope_theta);

        let transformer = Self {
            comm: Communicator::new(world),
            rope,
            shards,
            replicas,
            mesh,
            args,
        };
        tracing::info!(
            "Transformer ready on {}: {} layers, static KV cache {:.1} MB ({} x {} tokens)",
            transformer.mesh,
            transformer.args.n_layers,
            transformer.cache_memory_bytes() as f64 / 1e6,
            transformer.args.max_batch_size,
            transformer.args.max_seq_len
        );
        Ok(transformer)
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn vocab_size(&self) -> usize {
        self.shards[0].tok_embeddings.vocab_size
    }

    /// Bytes held by all KV caches across the mesh
    pub fn cache_memory_bytes(&self) -> usize {
        self.replicas
            .iter()
            .flat_map(|r| r.caches.iter().flatten())
            .map(KvCache::memory_bytes)
            .sum()
    }

    /// Zero every KV cache
    pub fn reset_caches(&mut self) {
        for cache in self
            .replicas
            .iter_mut()
            .flat_map(|r| r.caches.iter_mut().flatten())
        {
            cache.reset();
        }
    }

    /// Run the model on `tokens` written at cache positions `input_indexes`
    ///
    /// `tokens` must have exactly `max_batch_size` rows of `input_indexes.len()`
    /// tokens. With `output_index`, only the logits at that position are
    /// produced (`seq == 1`).
    pub fn forward(
        &mut self,
        tokens: &[Vec<u32>],
        input_indexes: &[usize],
        output_index: Option<usize>,
    ) -> Result<Logits> {
        let batch = self.args.max_batch_size;
        let seqlen = input_indexes.len();
        if tokens.len() != batch {
            return Err(ModelError::InvalidInput(format!(
                "forward expects the static batch of {batch} rows, got {}",
                tokens.len()
            )));
        }
        if seqlen == 0 {
            return Err(ModelError::InvalidInput("empty input_indexes".to_string()));
        }
        if let Some(row) = tokens.iter().find(|row| row.len() != seqlen) {
            return Err(ModelError::InvalidInput(format!(
                "token row of length {} does not match {seqlen} input indexes",
                row.len()
            )));
        }

        let select = match output_index {
            Some(index) => {
                let pos = index
                    .checked_sub(input_indexes[0])
                    .filter(|&p| p < seqlen)
                    .ok_or_else(|| {
                        ModelError::InvalidInput(format!(
                            "output_index {index} outside positions {}..{}",
                            input_indexes[0],
                            input_indexes[0] + seqlen
                        ))
                    })?;
                Some(pos)
            }
            None => None,
        };

        let rows = batch / self.mesh.data_size();
        let (args, comm, rope, shards) = (&self.args, &self.comm, &self.rope, &self.shards);

        let outputs = self
            .replicas
            .par_iter_mut()
            .zip(tokens.par_chunks(rows))
            .map(|(replica, chunk)| replica.forward(args, shards, comm, rope, chunk, input_indexes, select))
            .collect::<Result<Vec<_>>>()?;

        let vocab = self.vocab_size();
        tracing::debug!(
            "forward: positions {}..{}, {} replicas",
            input_indexes[0],
            input_indexes[seqlen - 1] + 1,
            outputs.len()
        );
        Ok(Logits {
            batch,
            seq: if select.is_some() { 1 } else { seqlen },
            vocab,
            data: outputs.concat(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::ModelWeights;

    fn args() -> ModelArgs {
        ModelArgs {
            dim: 16,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: Some(2),
            vocab_size: 24,
            multiple_of: 8,
            max_batch_size: 2,
            max_seq_len: 16,
            ..Default::default()
        }
    }

    fn build(mesh: Mesh) -> Transformer {
        let args = args();
        let weights = ModelWeights::random(&args, 11).unwrap();
        let shards = weights.shard(&mesh, false).unwrap();
        Transformer::new(args, mesh, shards).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let mut model = build(Mesh::single());
        let tokens = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let logits = model.forward(&tokens, &[0, 1, 2], None).unwrap();
        assert_eq!((logits.batch, logits.seq, logits.vocab), (2, 3, 24));
        assert_eq!(logits.data.len(), 2 * 3 * 24);
        assert!(logits.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_output_index_selects_position() {
        let mut model = build(Mesh::single());
        let tokens = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let full = model.forward(&tokens, &[0, 1, 2], None).unwrap();

        model.reset_caches();
        let one = model.forward(&tokens, &[0, 1, 2], Some(1)).unwrap();
        assert_eq!(one.seq, 1);
        for row in 0..2 {
            for (a, b) in one.last(row).iter().zip(full.at(row, 1)) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_static_batch_enforced() {
        let mut model = build(Mesh::single());
        assert!(model.forward(&[vec![1, 2]], &[0, 1], None).is_err());
        assert!(model.forward(&[vec![1], vec![2, 3]], &[0], None).is_err());
        assert!(model
            .forward(&[vec![1], vec![2]], &[3], Some(2))
            .is_err());
    }

    #[test]
    fn test_write_past_cache_fails() {
        let mut model = build(Mesh::single());
        assert!(model.forward(&[vec![1], vec![2]], &[16], None).is_err());
    }

    #[test]
    fn test_cache_memory() {
        let model = build(Mesh::new(2, 2).unwrap());
        // 2 replicas x 2 ranks x 2 layers, each 1 row x 16 x 1 head x 4 x 2 x 4 bytes
        assert_eq!(model.cache_memory_bytes(), 8 * 16 * 4 * 2 * 4);
    }
}
