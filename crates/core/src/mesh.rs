//! Logical device mesh
//!
//! The mesh is a 2-D grid `[data, model]`. The data axis partitions the
//! static batch into replicas, the model axis partitions weights
//! (tensor parallelism). Device ids are assigned row-major.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::MeshConfig;
use crate::error::{CoreError, Result};
use crate::parallel::shard_range;

/// Flat device index within the mesh
pub type DeviceId = usize;

/// How a weight is laid out across the model axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSpec {
    /// Full copy on every rank
    Replicated,
    /// Split along the output dimension (rows of `[out, in]`)
    Column,
    /// Split along the input dimension (columns of `[out, in]`)
    Row,
    /// Embedding table split along the embedding dimension
    Embedding,
}

/// Device mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mesh {
    data: usize,
    model: usize,
}

impl Mesh {
    /// Create a mesh with the given axis sizes
    pub fn new(data: usize, model: usize) -> Result<Self> {
        if data == 0 || model == 0 {
            return Err(CoreError::Mesh(format!(
                "mesh axes must be non-zero, got {data}x{model}"
            )));
        }
        Ok(Self { data, model })
    }

    /// Single-device mesh
    pub fn single() -> Self {
        Self { data: 1, model: 1 }
    }

    /// Build from configuration
    pub fn from_config(config: &MeshConfig) -> Result<Self> {
        Self::new(config.data, config.model)
    }

    /// Number of data-parallel replicas
    pub fn data_size(&self) -> usize {
        self.data
    }

    /// Number of model-parallel ranks
    pub fn model_size(&self) -> usize {
        self.model
    }

    /// Total number of devices
    pub fn size(&self) -> usize {
        self.data * self.model
    }

    /// Device at `(data_idx, model_idx)`
    pub fn device(&self, data_idx: usize, model_idx: usize) -> Result<DeviceId> {
        if data_idx >= self.data || model_idx >= self.model {
            return Err(CoreError::Mesh(format!(
                "device ({data_idx}, {model_idx}) outside {}x{} mesh",
                self.data, self.model
            )));
        }
        Ok(data_idx * self.model + model_idx)
    }

    /// Coordinates `(data_idx, model_idx)` of a device
    pub fn coords(&self, device: DeviceId) -> Result<(usize, usize)> {
        if device >= self.size() {
            return Err(CoreError::Mesh(format!(
                "device {device} outside mesh of {} devices",
                self.size()
            )));
        }
        Ok((device / self.model, device % self.model))
    }

    /// All device ids in row-major order
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> {
        0..self.size()
    }

    /// Batch rows handled by each data replica
    pub fn rows_per_replica(&self, batch: usize) -> Result<usize> {
        if batch % self.data != 0 {
            return Err(CoreError::Mesh(format!(
                "batch size {batch} is not divisible by the data axis ({})",
                self.data
            )));
        }
        Ok(batch / self.data)
    }

    /// Batch rows owned by a data replica
    pub fn replica_rows(&self, batch: usize, data_idx: usize) -> Result<Range<usize>> {
        self.rows_per_replica(batch)?;
        Ok(shard_range(batch, data_idx, self.data))
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::single()
    }
}

impl std::fmt::Display for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mesh[data={}, model={}]", self.data, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_coords() {
        let mesh = Mesh::new(2, 4).unwrap();
        assert_eq!(mesh.size(), 8);
        assert_eq!(mesh.device(1, 2).unwrap(), 6);
        assert_eq!(mesh.coords(6).unwrap(), (1, 2));
        assert!(mesh.device(2, 0).is_err());
        assert!(mesh.coords(8).is_err());

        for d in mesh.devices() {
            let (i, j) = mesh.coords(d).unwrap();
            assert_eq!(mesh.device(i, j).unwrap(), d);
        }
    }

    #[test]
    fn test_replica_rows() {
        let mesh = Mesh::new(2, 1).unwrap();
        assert_eq!(mesh.rows_per_replica(8).unwrap(), 4);
        assert_eq!(mesh.replica_rows(8, 1).unwrap(), 4..8);
        assert!(mesh.rows_per_replica(7).is_err());
    }

    #[test]
    fn test_zero_axis_rejected() {
        assert!(Mesh::new(0, 2).is_err());
        assert!(Mesh::from_config(&MeshConfig { data: 1, model: 0 }).is_err());
    }
}
