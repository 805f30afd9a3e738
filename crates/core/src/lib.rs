//! ShardLayer Core - device mesh, collectives and kernels for tensor-parallel
//! decoder layers
//!
//! This crate provides the substrate a decoder layer runs on:
//! - **Device mesh**: N emulated accelerators with L1 and DRAM pools,
//!   per-device task dispatch with a join at every stage
//! - **Collectives**: all-gather along the hidden dimension, as a device-link
//!   ring or host-mediated emulation
//! - **Layouts**: interleaved and core-sharded placements, including the
//!   slice-at-a-time partial transitions used by long prefill
//! - **Kernels**: RMS normalization and residual adds
//!
//! # Shapes
//!
//! | Mode    | Activation slice per device | Replicated (post all-gather) |
//! |---------|-----------------------------|------------------------------|
//! | prefill | `[1, 1, seq, hidden/N]`     | `[1, 1, seq, hidden]`        |
//! | decode  | `[1, 1, batch, hidden/N]`   | `[1, 1, batch, hidden]`      |

pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod model;
pub mod parallel;
pub mod tensor;

pub use comm::{AllGatherStrategy, Communicator};
pub use config::{LayerConfig, LayernormSliceParams, LlmMode, NORM_SLICE_ROWS};
pub use device::{Device, DeviceMesh, DeviceTensor};
pub use error::{LayerError, Result};
pub use kernel::ComputeKernelConfig;
pub use memory::{DevicePool, MemoryBudget};
pub use model::DecoderDims;
pub use tensor::{
    nearest_32, CoreGrid, DType, HostTensor, MemoryConfig, MemorySpace, ShardOrientation,
    ShardSpec, TensorLayout, TILE,
};
