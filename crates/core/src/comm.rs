//! Collective operations across the model axis
//!
//! Communication pattern for one transformer block:
//!
//! ```text
//! Input X (replicated on all ranks)
//!     |
//!     v
//! [Column Parallel: wq, wk, wv, w1, w3]
//!     |  (no communication - each rank computes its slice)
//!     v
//! [Local Computation: attention over local heads, SwiGLU]
//!     |
//!     v
//! [Row Parallel: wo, w2]
//!     |
//!     v
//! All-Reduce (sum partial results)
//!     |
//!     v
//! Output Y (replicated on all ranks)
//! ```
//!
//! Ranks live in one process, so collectives are host-side reductions over
//! the per-rank buffers.

use crate::error::{CoreError, Result};

/// Communication operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommOp {
    /// Sum reduction across all ranks
    AllReduceSum,
    /// Concatenate per-rank slices on every rank
    AllGather,
}

/// Communicator over the ranks of one model axis
#[derive(Debug, Clone, Copy)]
pub struct Communicator {
    world: usize,
}

impl Communicator {
    pub fn new(world: usize) -> Self {
        Self { world }
    }

    /// Number of participating ranks
    pub fn world(&self) -> usize {
        self.world
    }

    fn check_participants(&self, op: CommOp, got: usize) -> Result<()> {
        if got != self.world {
            return Err(CoreError::Collective(format!(
                "{op:?}: expected {} buffers, got {got}",
                self.world
            )));
        }
        Ok(())
    }

    /// All-reduce sum: every buffer becomes the element-wise sum of all buffers
    pub fn all_reduce_sum(&self, buffers: &mut [Vec<f32>]) -> Result<()> {
        self.check_participants(CommOp::AllReduceSum, buffers.len())?;
        if self.world == 1 {
            return Ok(());
        }

        let len = buffers[0].len();
        if let Some(bad) = buffers.iter().find(|b| b.len() != len) {
            return Err(CoreError::Collective(format!(
                "all-reduce length mismatch: {} vs {}",
                len,
                bad.len()
            )));
        }

        let (first, rest) = buffers.split_at_mut(1);
        let sum = &mut first[0];
        for buffer in rest.iter() {
            for (s, v) in sum.iter_mut().zip(buffer) {
                *s += v;
            }
        }
        for buffer in rest.iter_mut() {
            buffer.copy_from_slice(&sum[..]);
        }
        Ok(())
    }

    /// All-reduce that consumes the partials and returns the single sum
    pub fn reduce_sum(&self, mut buffers: Vec<Vec<f32>>) -> Result<Vec<f32>> {
        self.all_reduce_sum(&mut buffers)?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Collective("reduce over zero ranks".to_string()))
    }

    /// All-gather along the last dimension
    ///
    /// Each shard is a row-major `[rows, width_r]` block; the result is
    /// `[rows, sum(width_r)]` with rank blocks concatenated in rank order.
    pub fn all_gather(&self, shards: &[Vec<f32>], rows: usize) -> Result<Vec<f32>> {
        self.check_participants(CommOp::AllGather, shards.len())?;
        if rows == 0 {
            return Ok(Vec::new());
        }

        let mut widths = Vec::with_capacity(shards.len());
        for shard in shards {
            if shard.len() % rows != 0 {
                return Err(CoreError::Collective(format!(
                    "all-gather shard of {} elements is not a multiple of {rows} rows",
                    shard.len()
                )));
            }
            widths.push(shard.len() / rows);
        }

        let total: usize = widths.iter().sum();
        let mut out = Vec::with_capacity(rows * total);
        for row in 0..rows {
            for (shard, &width) in shards.iter().zip(&widths) {
                out.extend_from_slice(&shard[row * width..(row + 1) * width]);
            }
        }
        Ok(out)
    }
}
