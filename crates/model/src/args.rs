//! Llama 2 model hyperparameters
//!
//! Loaded from the `params.json` that ships with every checkpoint:
//!
//! ```json
//! {"dim": 4096, "multiple_of": 256, "n_heads": 32, "n_layers": 32, "norm_eps": 1e-05, "vocab_size": -1}
//! ```
//!
//! `vocab_size` is `-1` in the released files and is filled in from the
//! tokenizer at build time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use meshlm_core::ModelDims;

use crate::error::{ModelError, Result};

/// Model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Key/value heads for grouped-query attention (defaults to `n_heads`)
    pub n_kv_heads: Option<usize>,
    /// `-1` until set from the tokenizer
    pub vocab_size: i64,
    /// SwiGLU hidden size is rounded up to a multiple of this
    pub multiple_of: usize,
    pub ffn_dim_multiplier: Option<f32>,
    pub norm_eps: f32,
    pub rope_theta: f32,
    pub max_batch_size: usize,
    pub max_seq_len: usize,
    /// Store linear weights as INT8
    pub quant: bool,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: -1,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_batch_size: 32,
            max_seq_len: 2048,
            quant: false,
        }
    }
}

impl ModelArgs {
    /// Load from a `params.json` file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Number of key/value heads
    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// How many query heads share one key/value head
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.kv_heads()
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Vocabulary size, failing while it is still unset
    pub fn vocab(&self) -> Result<usize> {
        usize::try_from(self.vocab_size)
            .ok()
            .filter(|&v| v > 0)
            .ok_or_else(|| {
                ModelError::InvalidInput(format!("vocab_size is unset ({})", self.vocab_size))
            })
    }

    /// SwiGLU hidden dimension
    ///
    /// Starts at `2/3 * 4 * dim`, is scaled by `ffn_dim_multiplier` when
    /// present and rounded up to a multiple of `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let mut hidden = 2 * (4 * self.dim) / 3;
        if let Some(multiplier) = self.ffn_dim_multiplier {
            hidden = (multiplier * hidden as f32) as usize;
        }
        let multiple_of = self.multiple_of.max(1);
        multiple_of * hidden.div_ceil(multiple_of)
    }

    /// Dimensions used for sharding plans
    pub fn dims(&self) -> Result<ModelDims> {
        Ok(ModelDims {
            dim: self.dim,
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            n_kv_heads: self.kv_heads(),
            vocab_size: self.vocab()?,
            ffn_hidden_dim: self.ffn_hidden_dim(),
        })
    }

    /// Validate shapes for a model axis of `world` ranks
    pub fn validate(&self, world: usize) -> Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(ModelError::InvalidInput(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ModelError::InvalidInput(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.n_heads % kv_heads != 0 {
            return Err(ModelError::InvalidInput(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({kv_heads})",
                self.n_heads
            )));
        }
        if self.max_batch_size == 0 || self.max_seq_len == 0 {
            return Err(ModelError::InvalidInput(
                "max_batch_size and max_seq_len must be positive".to_string(),
            ));
        }
        self.dims()?.validate_world(world)?;
        Ok(())
    }
}
