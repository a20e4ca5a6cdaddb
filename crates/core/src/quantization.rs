//! INT8 weight quantization
//!
//! Per-channel symmetric INT8 quantization for linear weights:
//! - Weights are stored as INT8 with one FP32 scale per output channel
//! - Activations stay in FP32
//! - Rows are dequantized on the fly inside the matmul
//!
//! Memory savings: FP32 (4 bytes) -> INT8 (1 byte) + scales

use rayon::prelude::*;

use crate::error::{CoreError, Result};
use crate::tensor::dot;

/// Quantized `[rows, cols]` matrix with one scale per row
#[derive(Debug, Clone)]
pub struct QuantizedMatrix {
    /// INT8 weights, row-major
    pub data: Vec<i8>,
    /// Scale per row (output channel)
    pub scales: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl QuantizedMatrix {
    /// Quantize a row-major f32 matrix per output channel
    ///
    /// - scale = max_abs(row) / 127 (1.0 for an all-zero row)
    /// - q = round(w / scale) clamped to [-128, 127]
    pub fn quantize_per_channel(data: &[f32], rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(CoreError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![data.len()],
            });
        }

        let results: Vec<(f32, Vec<i8>)> = data
            .par_chunks(cols.max(1))
            .map(|row| {
                let max_abs = row.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
                let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
                let quantized = row
                    .iter()
                    .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
                    .collect();
                (scale, quantized)
            })
            .collect();

        let mut scales = Vec::with_capacity(rows);
        let mut quantized = Vec::with_capacity(rows * cols);
        for (scale, row) in results {
            scales.push(scale);
            quantized.extend(row);
        }

        Ok(Self {
            data: quantized,
            scales,
            rows,
            cols,
        })
    }

    /// Dequantize one row into `out`
    pub fn dequantize_row_into(&self, row: usize, out: &mut [f32]) {
        let scale = self.scales[row];
        let start = row * self.cols;
        for (o, &q) in out.iter_mut().zip(&self.data[start..start + self.cols]) {
            *o = q as f32 * scale;
        }
    }

    /// Dequantize the full matrix
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        for (row, chunk) in out.chunks_exact_mut(self.cols.max(1)).enumerate() {
            self.dequantize_row_into(row, chunk);
        }
        out
    }

    /// `x[n, cols] @ self^T -> [n, rows]`
    pub fn matmul_nt(&self, x: &[f32], n: usize) -> Vec<f32> {
        debug_assert_eq!(x.len(), n * self.cols);

        // Each output channel is dequantized once and reused for all n inputs.
        let columns: Vec<Vec<f32>> = (0..self.rows)
            .into_par_iter()
            .map(|row| {
                let mut w = vec![0.0f32; self.cols];
                self.dequantize_row_into(row, &mut w);
                x.chunks_exact(self.cols).map(|xr| dot(xr, &w)).collect()
            })
            .collect();

        let mut out = vec![0.0f32; n * self.rows];
        for (row, column) in columns.iter().enumerate() {
            for (i, &v) in column.iter().enumerate() {
                out[i * self.rows + row] = v;
            }
        }
        out
    }

    /// Storage in bytes (weights + scales)
    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * 4
    }
}
