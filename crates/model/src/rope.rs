//! Rotary Position Embedding (RoPE)
//!
//! RoPE encodes position by rotating consecutive feature pairs of every head.
//! For position m and pair i with frequency θ_i = theta^(-2i/head_dim):
//!   (x[2i], x[2i+1]) <- (x[2i] + j·x[2i+1]) · e^(j·m·θ_i)
//!
//! The table covers `2 * max_seq_len` positions.

use crate::error::{ModelError, Result};

/// Precomputed rotation table: cos/sin of shape `[end, head_dim / 2]`
#[derive(Debug, Clone)]
pub struct RopeTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    head_dim: usize,
    end: usize,
}

impl RopeTable {
    pub fn new(head_dim: usize, end: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let inv_freq: Vec<f64> = (0..half)
            .map(|i| 1.0 / (theta as f64).powf((2 * i) as f64 / head_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(end * half);
        let mut sin = Vec::with_capacity(end * half);
        for pos in 0..end {
            for &freq in &inv_freq {
                let angle = pos as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        Self {
            cos,
            sin,
            head_dim,
            end,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of positions covered
    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Rotate every head of one token in place
    ///
    /// `x` holds `n_heads * head_dim` values, heads contiguous.
    pub fn apply(&self, x: &mut [f32], position: usize) -> Result<()> {
        if position >= self.end {
            return Err(ModelError::InvalidInput(format!(
                "position {position} outside rotary table of {} positions",
                self.end
            )));
        }

        let half = self.head_dim / 2;
        let cos = &self.cos[position * half..(position + 1) * half];
        let sin = &self.sin[position * half..(position + 1) * half];

        for head in x.chunks_exact_mut(self.head_dim) {
            for (i, pair) in head.chunks_exact_mut(2).enumerate() {
                let (re, im) = (pair[0], pair[1]);
                pair[0] = re * cos[i] - im * sin[i];
                pair[1] = re * sin[i] + im * cos[i];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RopeTable::new(8, 16, 10000.0);
        let mut x: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let original = x.clone();
        rope.apply(&mut x, 0).unwrap();
        assert_eq!(x, original);
    }

    #[test]
    fn test_rotation_preserves_pair_norm() {
        let rope = RopeTable::new(4, 32, 10000.0);
        let mut x = vec![1.0, 2.0, -3.0, 0.5];
        rope.apply(&mut x, 7).unwrap();

        let n0 = (x[0] * x[0] + x[1] * x[1]).sqrt();
        let n1 = (x[2] * x[2] + x[3] * x[3]).sqrt();
        assert!((n0 - 5.0f32.sqrt()).abs() < 1e-5);
        assert!((n1 - 9.25f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_first_pair_rotates_by_position() {
        // pair 0 has frequency 1, so position 1 rotates by one radian
        let rope = RopeTable::new(2, 4, 10000.0);
        let mut x = vec![1.0, 0.0];
        rope.apply(&mut x, 1).unwrap();
        assert!((x[0] - 1.0f32.cos()).abs() < 1e-6);
        assert!((x[1] - 1.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_position_out_of_range() {
        let rope = RopeTable::new(4, 8, 10000.0);
        let mut x = vec![0.0; 4];
        assert!(rope.apply(&mut x, 8).is_err());
    }
}
