//! Tensor data types and dense f32 kernels

use half::{bf16, f16};
use rayon::prelude::*;

use crate::error::{CoreError, Result};

/// Tensor data type as stored in a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    /// Map a safetensors dtype onto a supported one
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            other => Err(CoreError::UnsupportedDtype(format!("{other:?}"))),
        }
    }
}

/// Decode little-endian bytes of the given dtype into f32 values
pub fn decode_f32(bytes: &[u8], dtype: DType) -> Result<Vec<f32>> {
    if bytes.len() % dtype.size_bytes() != 0 {
        return Err(CoreError::ShapeMismatch {
            expected: vec![bytes.len() / dtype.size_bytes() * dtype.size_bytes()],
            got: vec![bytes.len()],
        });
    }

    let values = match dtype {
        DType::F32 => bytes
            .par_chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        DType::F16 => bytes
            .par_chunks_exact(2)
            .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        DType::BF16 => bytes
            .par_chunks_exact(2)
            .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
    };
    Ok(values)
}

/// Tensor shape utilities
pub mod shape {
    /// Calculate the product of dimensions
    pub fn numel(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    /// Compute strides for row-major layout
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}

/// `x[rows, in] @ w[out, in]^T -> [rows, out]`
///
/// Weights use the `[out_features, in_features]` layout of the checkpoints.
pub fn matmul_nt(x: &[f32], rows: usize, in_features: usize, w: &[f32], out_features: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), rows * in_features);
    debug_assert_eq!(w.len(), out_features * in_features);

    let mut out = vec![0.0f32; rows * out_features];
    out.par_chunks_mut(out_features.max(1))
        .zip(x.par_chunks(in_features.max(1)))
        .for_each(|(out_row, x_row)| {
            for (o, w_row) in out_row.iter_mut().zip(w.chunks_exact(in_features)) {
                *o = dot(x_row, w_row);
            }
        });
    out
}

/// Dot product of two equal-length slices
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(shape::compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(shape::compute_strides(&[]), Vec::<usize>::new());
        assert_eq!(shape::numel(&[2, 3, 4]), 24);
    }

    #[test]
    fn test_decode_dtypes() {
        let f32_bytes: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(decode_f32(&f32_bytes, DType::F32).unwrap(), vec![1.5, -2.0]);

        let bf16_bytes: Vec<u8> = [0x3F80u16, 0xBF80].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(decode_f32(&bf16_bytes, DType::BF16).unwrap(), vec![1.0, -1.0]);

        let f16_bytes: Vec<u8> = [f16::from_f32(0.5).to_bits()]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(decode_f32(&f16_bytes, DType::F16).unwrap(), vec![0.5]);

        assert!(decode_f32(&[0u8; 3], DType::F32).is_err());
    }

    #[test]
    fn test_matmul_nt() {
        // x = [[1, 2], [3, 4]], w = [[1, 0], [0, 1], [1, 1]]
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let w = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let y = matmul_nt(&x, 2, 2, &w, 3);
        assert_eq!(y, vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);
    }
}
