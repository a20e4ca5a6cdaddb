//! MeshLM Core - device mesh and tensor-parallel primitives
//!
//! This crate provides the infrastructure shared by the model crate:
//!
//! - **Configuration**: runtime, mesh and generation settings (TOML + env)
//! - **Device mesh**: a 2-D `data x model` grid of simulated devices
//! - **Sharding**: column/row partitioning of weight matrices
//! - **Collectives**: all-reduce and all-gather across the model axis
//! - **Quantization**: per-channel INT8 weight storage
//!
//! # Mesh Layout
//!
//! ```text
//!              model axis (weights sharded) ->
//!            +----------+----------+----------+
//!  data  0   | dev 0    | dev 1    | dev 2    |   batch rows [0, B/D)
//!  axis  1   | dev 3    | dev 4    | dev 5    |   batch rows [B/D, 2B/D)
//!            +----------+----------+----------+
//! ```
//!
//! Devices on the same row hold different weight shards and the same batch
//! rows; devices on the same column hold the same weight shard.

pub mod comm;
pub mod config;
pub mod error;
pub mod mesh;
pub mod parallel;
pub mod quantization;
pub mod tensor;

pub use comm::{CommOp, Communicator};
pub use config::{GenerationConfig, MeshConfig, RuntimeConfig};
pub use error::{CoreError, Result};
pub use mesh::{DeviceId, Mesh, PartitionSpec};
pub use parallel::{
    divide_exact, shard_range, slice_cols, slice_rows, ModelDims, ShardSpec, ShardingPlan,
};
pub use quantization::QuantizedMatrix;
pub use tensor::{decode_f32, dot, matmul_nt, DType};
