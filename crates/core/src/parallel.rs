//! Tensor parallelism across the model axis
//!
//! # Sharding Strategy for Llama 2 on an N-way model axis
//!
//! ## Attention
//! - wq: [n_heads * head_dim, dim] -> column parallel (each rank owns n_heads/N heads)
//! - wk, wv: [n_kv_heads * head_dim, dim] -> column parallel (n_kv_heads/N kv heads)
//! - wo: [dim, n_heads * head_dim] -> row parallel, partial outputs are all-reduced
//!
//! ## Feed-forward
//! - w1, w3: [hidden, dim] -> column parallel
//! - w2: [dim, hidden] -> row parallel
//!
//! ## Embeddings and head
//! - tok_embeddings: [vocab, dim] -> split along dim, all-gathered after lookup
//! - output: [vocab, dim] -> column parallel, logits all-gathered
//! - norms: replicated

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::mesh::{Mesh, PartitionSpec};

/// Divide, failing unless the division is exact
pub fn divide_exact(numerator: usize, denominator: usize) -> Result<usize> {
    if denominator == 0 || numerator % denominator != 0 {
        return Err(CoreError::Mesh(format!(
            "{numerator} is not divisible by {denominator}"
        )));
    }
    Ok(numerator / denominator)
}

/// Range of a dimension of size `len` owned by `rank` out of `world`
pub fn shard_range(len: usize, rank: usize, world: usize) -> Range<usize> {
    let shard = len / world;
    let start = rank * shard;
    start..start + shard
}

/// Select rows `range` of a row-major `[rows, cols]` matrix
pub fn slice_rows(data: &[f32], cols: usize, range: Range<usize>) -> Vec<f32> {
    data[range.start * cols..range.end * cols].to_vec()
}

/// Select columns `range` of a row-major `[rows, cols]` matrix
pub fn slice_cols(data: &[f32], rows: usize, cols: usize, range: Range<usize>) -> Vec<f32> {
    let width = range.len();
    let mut out = Vec::with_capacity(rows * width);
    for row in data.chunks_exact(cols).take(rows) {
        out.extend_from_slice(&row[range.clone()]);
    }
    out
}

/// Transformer dimensions needed for planning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub ffn_hidden_dim: usize,
}

impl ModelDims {
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Check that every sharded dimension splits evenly across `world` ranks
    pub fn validate_world(&self, world: usize) -> Result<()> {
        divide_exact(self.n_heads, world)?;
        divide_exact(self.n_kv_heads, world)?;
        divide_exact(self.ffn_hidden_dim, world)?;
        divide_exact(self.dim, world)?;
        divide_exact(self.vocab_size, world)?;
        Ok(())
    }
}

/// Placement of one weight on one model rank
#[derive(Debug, Clone)]
pub struct ShardSpec {
    /// Checkpoint name of the weight
    pub name: String,
    /// Layout across the model axis
    pub partition: PartitionSpec,
    /// Model rank holding this shard
    pub rank: usize,
    /// Shape of the local shard
    pub shard_shape: Vec<usize>,
    /// Bytes of the local shard
    pub size: usize,
}

/// Sharding plan for a full model
#[derive(Debug)]
pub struct ShardingPlan {
    /// Mesh the plan was made for
    pub mesh: Mesh,
    /// Per-rank weight assignments along the model axis
    pub rank_assignments: Vec<Vec<ShardSpec>>,
    /// Weight bytes per model rank
    pub memory_per_rank: Vec<usize>,
}

impl ShardingPlan {
    /// Create a sharding plan for a Llama 2 model
    ///
    /// `bytes_per_param` is 4 for f32 weights and 1 for INT8.
    pub fn for_model(dims: ModelDims, mesh: Mesh, bytes_per_param: usize) -> Result<Self> {
        let world = mesh.model_size();
        dims.validate_world(world)?;

        let head_dim = dims.head_dim();
        let mut rank_assignments: Vec<Vec<ShardSpec>> = (0..world).map(|_| Vec::new()).collect();
        let mut memory_per_rank = vec![0usize; world];

        let mut add_weight = |name: &str, shape: [usize; 2], partition: PartitionSpec| {
            let shard_shape = match partition {
                PartitionSpec::Replicated => shape.to_vec(),
                PartitionSpec::Column => vec![shape[0] / world, shape[1]],
                PartitionSpec::Row | PartitionSpec::Embedding => vec![shape[0], shape[1] / world],
            };
            let size = shard_shape.iter().product::<usize>() * bytes_per_param;
            for (rank, assignments) in rank_assignments.iter_mut().enumerate() {
                assignments.push(ShardSpec {
                    name: name.to_string(),
                    partition,
                    rank,
                    shard_shape: shard_shape.clone(),
                    size,
                });
                memory_per_rank[rank] += size;
            }
        };

        add_weight("tok_embeddings.weight", [dims.vocab_size, dims.dim], PartitionSpec::Embedding);

        for layer in 0..dims.n_layers {
            let prefix = format!("layers.{layer}");
            add_weight(
                &format!("{prefix}.attention.wq.weight"),
                [dims.n_heads * head_dim, dims.dim],
                PartitionSpec::Column,
            );
            add_weight(
                &format!("{prefix}.attention.wk.weight"),
                [dims.n_kv_heads * head_dim, dims.dim],
                PartitionSpec::Column,
            );
            add_weight(
                &format!("{prefix}.attention.wv.weight"),
                [dims.n_kv_heads * head_dim, dims.dim],
                PartitionSpec::Column,
            );
            add_weight(
                &format!("{prefix}.attention.wo.weight"),
                [dims.dim, dims.n_heads * head_dim],
                PartitionSpec::Row,
            );
            add_weight(
                &format!("{prefix}.feed_forward.w1.weight"),
                [dims.ffn_hidden_dim, dims.dim],
                PartitionSpec::Column,
            );
            add_weight(
                &format!("{prefix}.feed_forward.w2.weight"),
                [dims.dim, dims.ffn_hidden_dim],
                PartitionSpec::Row,
            );
            add_weight(
                &format!("{prefix}.feed_forward.w3.weight"),
                [dims.ffn_hidden_dim, dims.dim],
                PartitionSpec::Column,
            );
            add_weight(&format!("{prefix}.attention_norm.weight"), [1, dims.dim], PartitionSpec::Replicated);
            add_weight(&format!("{prefix}.ffn_norm.weight"), [1, dims.dim], PartitionSpec::Replicated);
        }

        add_weight("norm.weight", [1, dims.dim], PartitionSpec::Replicated);
        add_weight("output.weight", [dims.vocab_size, dims.dim], PartitionSpec::Column);

        Ok(Self {
            mesh,
            rank_assignments,
            memory_per_rank,
        })
    }

    /// Memory per model rank in GB (every data replica holds the same)
    pub fn memory_per_rank_gb(&self) -> Vec<f64> {
        self.memory_per_rank
            .iter()
            .map(|&bytes| bytes as f64 / (1024.0 * 1024.0 * 1024.0))
            .collect()
    }

    /// Total weight memory across the whole mesh in GB
    pub fn total_memory_gb(&self) -> f64 {
        let per_replica: usize = self.memory_per_rank.iter().sum();
        (per_replica * self.mesh.data_size()) as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Sharding plan for {}\n", self.mesh));
        out.push_str(&format!("Total weight memory: {:.2} GB\n", self.total_memory_gb()));
        for (rank, gb) in self.memory_per_rank_gb().iter().enumerate() {
            out.push_str(&format!(
                "  model rank {rank}: {gb:.2} GB ({} weights)\n",
                self.rank_assignments[rank].len()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama2_7b() -> ModelDims {
        ModelDims {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: 32,
            vocab_size: 32000,
            ffn_hidden_dim: 11008,
        }
    }

    #[test]
    fn test_divide_exact() {
        assert_eq!(divide_exact(32, 4).unwrap(), 8);
        assert!(divide_exact(32, 3).is_err());
        assert!(divide_exact(32, 0).is_err());
    }

    #[test]
    fn test_shard_range() {
        assert_eq!(shard_range(8, 0, 2), 0..4);
        assert_eq!(shard_range(8, 1, 2), 4..8);
        assert_eq!(shard_range(8, 0, 1), 0..8);
    }

    #[test]
    fn test_slice_rows_and_cols() {
        // [[0, 1, 2, 3], [4, 5, 6, 7]]
        let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
        assert_eq!(slice_rows(&data, 4, 1..2), vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(slice_cols(&data, 2, 4, 2..4), vec![2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_plan_single_rank_matches_param_count() {
        let dims = llama2_7b();
        let plan = ShardingPlan::for_model(dims, Mesh::single(), 2).unwrap();

        // Llama 2 7B has ~6.74B parameters
        let params = plan.memory_per_rank[0] / 2;
        assert!(params > 6_700_000_000 && params < 6_800_000_000, "got {params}");
    }

    #[test]
    fn test_plan_balanced_across_ranks() {
        let plan = ShardingPlan::for_model(llama2_7b(), Mesh::new(1, 4).unwrap(), 2).unwrap();
        assert_eq!(plan.rank_assignments.len(), 4);
        let first = plan.memory_per_rank[0];
        assert!(plan.memory_per_rank.iter().all(|&m| m == first));

        let wq = plan.rank_assignments[1]
            .iter()
            .find(|s| s.name == "layers.0.attention.wq.weight")
            .unwrap();
        assert_eq!(wq.shard_shape, vec![1024, 4096]);
        assert_eq!(wq.partition, PartitionSpec::Column);
    }

    #[test]
    fn test_plan_rejects_uneven_world() {
        assert!(ShardingPlan::for_model(llama2_7b(), Mesh::new(1, 3).unwrap(), 2).is_err());
    }
}
