//! RMS normalization of replicated activations
//!
//! Decode normalizes the whole (small) activation at once after moving it
//! onto a core-sharded L1 placement. Prefill activations can be thousands of
//! rows, so they are normalized in 128-row chunks: each chunk is copied into
//! a block-sharded L1 tensor, normalized there, written into its rows of a
//! DRAM output, and released before the next chunk is staged. Peak L1 use
//! is therefore set by the chunk size, not the sequence length.
//!
//! Normalization is row-wise, so chunked and whole-tensor results are
//! identical.

use std::ops::Range;

use shardlayer_core::kernel::rms_norm;
use shardlayer_core::layout::{
    interleaved_to_sharded, interleaved_to_sharded_partial, sharded_to_interleaved_partial,
};
use shardlayer_core::{
    ComputeKernelConfig, CoreGrid, DType, DeviceMesh, DeviceTensor, LayerError, MemoryConfig,
    Result, ShardOrientation, TensorLayout, NORM_SLICE_ROWS,
};

/// How a prefill activation is cut into normalization chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicePlan {
    pub num_slices: usize,
    pub slice_rows: usize,
}

impl SlicePlan {
    pub fn for_rows(rows: usize) -> Result<Self> {
        if rows == 0 || rows % NORM_SLICE_ROWS != 0 {
            return Err(LayerError::Precondition(format!(
                "{rows} rows: expected multiple of {NORM_SLICE_ROWS}"
            )));
        }
        Ok(Self {
            num_slices: rows / NORM_SLICE_ROWS,
            slice_rows: NORM_SLICE_ROWS,
        })
    }

    /// Row range of every chunk, in order
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.num_slices).map(move |i| i * self.slice_rows..(i + 1) * self.slice_rows)
    }
}

/// Numeric settings shared by both norms of a layer
#[derive(Debug, Clone, Copy)]
pub struct NormParams {
    pub eps: f32,
    pub out_dtype: DType,
    pub compute: ComputeKernelConfig,
}

fn weight_for<'a>(weights: &'a [DeviceTensor], device_id: usize) -> Result<&'a DeviceTensor> {
    weights.get(device_id).ok_or_else(|| {
        LayerError::Precondition(format!("no norm weight for device {device_id}"))
    })
}

/// Reshard each replica onto `sharded` and normalize it whole.
///
/// Consumes the replicas; outputs are placed with `output`.
pub fn rms_norm_full(
    mesh: &DeviceMesh,
    replicated: Vec<DeviceTensor>,
    weights: &[DeviceTensor],
    sharded: MemoryConfig,
    output: MemoryConfig,
    params: NormParams,
) -> Result<Vec<DeviceTensor>> {
    mesh.dispatch("rms_norm", replicated, |device, x| {
        let weight = weight_for(weights, device.device_id())?;
        let staged = interleaved_to_sharded(&x, sharded)?;
        drop(x);
        rms_norm(&staged, weight, params.eps, output, params.out_dtype, params.compute)
    })
}

/// Normalize each replica 128 rows at a time into a preallocated `output`.
///
/// Chunks are block-sharded over `grid`. Consumes the replicas.
pub fn sliced_rms_norm(
    mesh: &DeviceMesh,
    replicated: Vec<DeviceTensor>,
    weights: &[DeviceTensor],
    grid: CoreGrid,
    output: MemoryConfig,
    params: NormParams,
) -> Result<Vec<DeviceTensor>> {
    mesh.dispatch("sliced_rms_norm", replicated, |device, x| {
        let weight = weight_for(weights, device.device_id())?;
        let plan = SlicePlan::for_rows(x.rows())?;
        if plan.slice_rows % grid.y != 0 || x.cols() % grid.x != 0 {
            return Err(LayerError::Config(format!(
                "layernorm grid {}x{} does not divide a {}x{} chunk",
                grid.x,
                grid.y,
                plan.slice_rows,
                x.cols()
            )));
        }
        let shard_shape = [plan.slice_rows / grid.y, x.cols() / grid.x];

        let mut out = DeviceTensor::zeros(device, x.shape(), params.out_dtype, output)?;
        for (i, rows) in plan.ranges().enumerate() {
            let slice = interleaved_to_sharded_partial(
                &x,
                grid,
                shard_shape,
                plan.num_slices,
                i,
                TensorLayout::BlockSharded,
                ShardOrientation::RowMajor,
            )?;
            let placement = *slice.memory_config();
            let normed = rms_norm(&slice, weight, params.eps, placement, params.out_dtype, params.compute)?;
            drop(slice);
            sharded_to_interleaved_partial(&normed, &mut out, plan.num_slices, i)?;
            tracing::trace!(device = device.device_id(), ?rows, "norm chunk written");
        }
        Ok(out)
    })
}
