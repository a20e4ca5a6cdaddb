//! RMS normalization

use rayon::prelude::*;

/// `y = x / sqrt(mean(x^2) + eps) * weight`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RmsNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    /// Normalize each `dim`-sized row of `x`
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let dim = self.dim();
        let mut out = vec![0.0f32; x.len()];
        out.par_chunks_mut(dim.max(1))
            .zip(x.par_chunks(dim.max(1)))
            .for_each(|(out_row, x_row)| {
                let mean_sq = x_row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
                let inv = 1.0 / (mean_sq + self.eps).sqrt();
                for ((o, &v), &w) in out_row.iter_mut().zip(x_row).zip(&self.weight) {
                    *o = v * inv * w;
                }
            });
        out
    }
}
