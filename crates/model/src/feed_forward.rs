//! SwiGLU feed-forward: `w2(silu(w1 x) * w3 x)`

use crate::args::ModelArgs;
use crate::error::Result;
use crate::linear::{ColumnParallelLinear, RowParallelLinear};
use crate::weights::LayerWeights;

/// Feed-forward weights of one layer on one model rank
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub w1: ColumnParallelLinear,
    pub w2: RowParallelLinear,
    pub w3: ColumnParallelLinear,
}

impl FeedForward {
    pub fn shard(layer: &LayerWeights, args: &ModelArgs, rank: usize, world: usize, quantize: bool) -> Result<Self> {
        let dim = args.dim;
        let hidden = args.ffn_hidden_dim();
        Ok(Self {
            w1: ColumnParallelLinear::from_full(&layer.w1, hidden, dim, rank, world, quantize)?,
            w2: RowParallelLinear::from_full(&layer.w2, dim, hidden, rank, world, quantize)?,
            w3: ColumnParallelLinear::from_full(&layer.w3, hidden, dim, rank, world, quantize)?,
        })
    }

    /// Partial output `[n, dim]`; sum across ranks
    pub fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        let mut gate = self.w1.forward(x, n);
        let up = self.w3.forward(x, n);
        for (g, u) in gate.iter_mut().zip(&up) {
            *g = silu(*g) * u;
        }
        self.w2.forward(&gate, n)
    }
}

#[inline]
fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::ModelWeights;

    #[test]
    fn test_silu() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
    }

    #[test]
    fn test_partials_sum_to_full() {
        let args = ModelArgs {
            dim: 8,
            n_layers: 1,
            n_heads: 2,
            vocab_size: 16,
            multiple_of: 4,
            ..Default::default()
        };
        let weights = ModelWeights::random(&args, 3).unwrap();
        let x: Vec<f32> = (0..16).map(|i| i as f32 / 10.0 - 0.8).collect();

        let full = FeedForward::shard(&weights.layers[0], &args, 0, 1, false)
            .unwrap()
            .forward(&x, 2);
        let r0 = FeedForward::shard(&weights.layers[0], &args, 0, 2, false).unwrap();
        let r1 = FeedForward::shard(&weights.layers[0], &args, 1, 2, false).unwrap();
        let summed: Vec<f32> = r0
            .forward(&x, 2)
            .iter()
            .zip(r1.forward(&x, 2))
            .map(|(a, b)| a + b)
            .collect();

        for (a, b) in full.iter().zip(&summed) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
