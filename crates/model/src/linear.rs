//! Tensor-parallel linear and embedding layers
//!
//! All weights use the checkpoint layout `[out_features, in_features]`.
//!
//! ```text
//! ColumnParallelLinear      RowParallelLinear        ParallelEmbedding
//!   W[out, in]                W[out, in]               E[vocab, dim]
//!   rank r: rows r/N          rank r: cols r/N         rank r: cols r/N
//!   y_r = x W_r^T             y_r = x_r W_r^T          e_r = E_r[token]
//!   (local output slice)      (partial, all-reduce)    (all-gather)
//! ```

use std::ops::Range;

use meshlm_core::{matmul_nt, shard_range, slice_cols, slice_rows, QuantizedMatrix};

use crate::error::{ModelError, Result};

/// Weight of a linear layer, dense or INT8
#[derive(Debug, Clone)]
pub enum LinearWeight {
    Dense {
        data: Vec<f32>,
        out_features: usize,
        in_features: usize,
    },
    Int8(QuantizedMatrix),
}

impl LinearWeight {
    pub fn dense(data: Vec<f32>, out_features: usize, in_features: usize) -> Result<Self> {
        if data.len() != out_features * in_features {
            return Err(ModelError::ShapeMismatch {
                name: "linear".to_string(),
                expected: vec![out_features, in_features],
                got: vec![data.len()],
            });
        }
        Ok(Self::Dense {
            data,
            out_features,
            in_features,
        })
    }

    /// Build from f32 data, quantizing per output channel when requested
    pub fn from_f32(data: Vec<f32>, out_features: usize, in_features: usize, quantize: bool) -> Result<Self> {
        if quantize {
            let q = QuantizedMatrix::quantize_per_channel(&data, out_features, in_features)?;
            Ok(Self::Int8(q))
        } else {
            Self::dense(data, out_features, in_features)
        }
    }

    pub fn out_features(&self) -> usize {
        match self {
            Self::Dense { out_features, .. } => *out_features,
            Self::Int8(q) => q.rows,
        }
    }

    pub fn in_features(&self) -> usize {
        match self {
            Self::Dense { in_features, .. } => *in_features,
            Self::Int8(q) => q.cols,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Int8(_))
    }

    /// `x[n, in] -> [n, out]`
    pub fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        match self {
            Self::Dense {
                data,
                out_features,
                in_features,
            } => matmul_nt(x, n, *in_features, data, *out_features),
            Self::Int8(q) => q.matmul_nt(x, n),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Dense { data, .. } => data.len() * 4,
            Self::Int8(q) => q.size_bytes(),
        }
    }
}

/// Linear layer split along the output dimension
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    pub weight: LinearWeight,
    /// Output features owned by this rank
    pub output_range: Range<usize>,
}

impl ColumnParallelLinear {
    /// Take this rank's rows of a full `[out, in]` weight
    pub fn from_full(
        full: &[f32],
        out_features: usize,
        in_features: usize,
        rank: usize,
        world: usize,
        quantize: bool,
    ) -> Result<Self> {
        let output_range = shard_range(out_features, rank, world);
        let local = slice_rows(full, in_features, output_range.clone());
        let weight = LinearWeight::from_f32(local, output_range.len(), in_features, quantize)?;
        Ok(Self {
            weight,
            output_range,
        })
    }

    /// Local output slice `[n, out / world]`
    pub fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        self.weight.forward(x, n)
    }
}

/// Linear layer split along the input dimension
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    pub weight: LinearWeight,
    /// Input features owned by this rank
    pub input_range: Range<usize>,
}

impl RowParallelLinear {
    /// Take this rank's columns of a full `[out, in]` weight
    pub fn from_full(
        full: &[f32],
        out_features: usize,
        in_features: usize,
        rank: usize,
        world: usize,
        quantize: bool,
    ) -> Result<Self> {
        let input_range = shard_range(in_features, rank, world);
        let local = slice_cols(full, out_features, in_features, input_range.clone());
        let weight = LinearWeight::from_f32(local, out_features, input_range.len(), quantize)?;
        Ok(Self {
            weight,
            input_range,
        })
    }

    /// Partial output `[n, out]` from the rank's input slice; sum across ranks
    pub fn forward(&self, x_local: &[f32], n: usize) -> Vec<f32> {
        self.weight.forward(x_local, n)
    }
}

/// Embedding table split along the embedding dimension
#[derive(Debug, Clone)]
pub struct ParallelEmbedding {
    /// `[vocab, dim / world]`
    pub table: Vec<f32>,
    pub vocab_size: usize,
    /// Embedding columns owned by this rank
    pub dim_range: Range<usize>,
}

impl ParallelEmbedding {
    pub fn from_full(full: &[f32], vocab_size: usize, dim: usize, rank: usize, world: usize) -> Self {
        let dim_range = shard_range(dim, rank, world);
        let table = slice_cols(full, vocab_size, dim, dim_range.clone());
        Self {
            table,
            vocab_size,
            dim_range,
        }
    }

    pub fn local_dim(&self) -> usize {
        self.dim_range.len()
    }

    /// Look up the local columns for each token: `[tokens, dim / world]`
    pub fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let width = self.local_dim();
        let mut out = Vec::with_capacity(tokens.len() * width);
        for &token in tokens {
            let id = token as usize;
            if id >= self.vocab_size {
                return Err(ModelError::InvalidInput(format!(
                    "token id {id} outside vocabulary of {}",
                    self.vocab_size
                )));
            }
            out.extend_from_slice(&self.table[id * width..(id + 1) * width]);
        }
        Ok(out)
    }

    pub fn size_bytes(&self) -> usize {
        self.table.len() * 4
    }
}
