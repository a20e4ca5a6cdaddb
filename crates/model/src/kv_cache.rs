//! Static KV cache
//!
//! One cache per (device, layer), allocated once at the full size
//! `[batch_rows, max_seq_len, n_local_kv_heads, head_dim]` and never resized.
//! Positions are addressed explicitly: a forward pass writes its keys and
//! values at `input_indexes`, and attention reads the whole cache under the
//! causal mask. Shapes stay fixed across prefill and decode steps.

use crate::error::{ModelError, Result};

/// Key/value cache for a single layer on a single device
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Batch rows owned by this device's data replica
    pub batch_rows: usize,
    pub max_seq_len: usize,
    /// KV heads held by this model rank
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl KvCache {
    /// Allocate a zeroed cache
    pub fn new(batch_rows: usize, max_seq_len: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        let len = batch_rows * max_seq_len * n_kv_heads * head_dim;
        Self {
            keys: vec![0.0; len],
            values: vec![0.0; len],
            batch_rows,
            max_seq_len,
            n_kv_heads,
            head_dim,
        }
    }

    #[inline]
    fn offset(&self, row: usize, pos: usize, head: usize) -> usize {
        ((row * self.max_seq_len + pos) * self.n_kv_heads + head) * self.head_dim
    }

    /// Width of one cached token (all local kv heads)
    pub fn token_width(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Write `k`/`v` of shape `[batch_rows, seqlen, n_kv_heads, head_dim]`
    /// at cache positions `input_indexes[s]`
    pub fn index_copy(&mut self, input_indexes: &[usize], k: &[f32], v: &[f32]) -> Result<()> {
        let seqlen = input_indexes.len();
        let width = self.token_width();
        let expected = self.batch_rows * seqlen * width;
        if k.len() != expected || v.len() != expected {
            return Err(ModelError::ShapeMismatch {
                name: "kv_cache".to_string(),
                expected: vec![self.batch_rows, seqlen, self.n_kv_heads, self.head_dim],
                got: vec![k.len(), v.len()],
            });
        }
        if let Some(&bad) = input_indexes.iter().find(|&&p| p >= self.max_seq_len) {
            return Err(ModelError::ContextLengthExceeded {
                max: self.max_seq_len,
                got: bad + 1,
            });
        }

        for row in 0..self.batch_rows {
            for (s, &pos) in input_indexes.iter().enumerate() {
                let src = (row * seqlen + s) * width;
                let dst = self.offset(row, pos, 0);
                self.keys[dst..dst + width].copy_from_slice(&k[src..src + width]);
                self.values[dst..dst + width].copy_from_slice(&v[src..src + width]);
            }
        }
        Ok(())
    }

    /// Cached key of one head at one position
    #[inline]
    pub fn key(&self, row: usize, pos: usize, head: usize) -> &[f32] {
        let start = self.offset(row, pos, head);
        &self.keys[start..start + self.head_dim]
    }

    /// Cached value of one head at one position
    #[inline]
    pub fn value(&self, row: usize, pos: usize, head: usize) -> &[f32] {
        let start = self.offset(row, pos, head);
        &self.values[start..start + self.head_dim]
    }

    /// Zero the cache without reallocating
    pub fn reset(&mut self) {
        self.keys.fill(0.0);
        self.values.fill(0.0);
    }

    pub fn memory_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }
}

/// Cache sizing for capacity planning
#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    pub max_batch_size: usize,
    pub max_seq_len: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl KvCacheConfig {
    /// Estimate memory usage in GB for f32 caches across the whole model
    pub fn estimate_memory_gb(&self) -> f64 {
        // K and V: 2 * layers * batch * seq * kv_heads * head_dim * 4 bytes
        let bytes = 2.0
            * self.num_layers as f64
            * self.max_batch_size as f64
            * self.max_seq_len as f64
            * self.num_kv_heads as f64
            * self.head_dim as f64
            * 4.0;

        bytes / (1024.0 * 1024.0 * 1024.0)
    }
}
