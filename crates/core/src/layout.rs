//! Layout transitions between interleaved and core-sharded placements
//!
//! All transitions read their input and produce a new tensor in a fresh
//! allocation; the caller decides when to release the input. The logical
//! element order never changes, only the placement tag and the pool the
//! bytes are charged to.
//!
//! The partial variants move one horizontal slice `i` of `n` at a time:
//!
//! ```text
//! interleaved [rows, cols] (DRAM)
//!   rows [i*rows/n, (i+1)*rows/n)  --interleaved_to_sharded_partial-->  [rows/n, cols] (L1, sharded)
//!   [rows/n, cols] (L1)  --sharded_to_interleaved_partial-->  same rows of a preallocated output
//! ```

use crate::device::DeviceTensor;
use crate::error::{LayerError, Result};
use crate::parallel::slice_rows;
use crate::tensor::{CoreGrid, MemoryConfig, ShardOrientation, TensorLayout};

/// Reshard onto a core grid
pub fn interleaved_to_sharded(x: &DeviceTensor, memory: MemoryConfig) -> Result<DeviceTensor> {
    if !memory.is_sharded() {
        return Err(LayerError::Config(format!(
            "interleaved_to_sharded target must be sharded, got {:?}",
            memory.layout
        )));
    }
    x.to_memory(memory)
}

/// Gather core shards into an interleaved placement
pub fn sharded_to_interleaved(x: &DeviceTensor, memory: MemoryConfig) -> Result<DeviceTensor> {
    if memory.is_sharded() {
        return Err(LayerError::Config(format!(
            "sharded_to_interleaved target must be interleaved, got {:?}",
            memory.layout
        )));
    }
    x.to_memory(memory)
}

fn slice_bounds(rows: usize, num_slices: usize, slice_index: usize) -> Result<(usize, usize)> {
    if num_slices == 0 || rows % num_slices != 0 {
        return Err(LayerError::Precondition(format!(
            "{rows} rows cannot be cut into {num_slices} equal slices"
        )));
    }
    if slice_index >= num_slices {
        return Err(LayerError::Precondition(format!(
            "slice index {slice_index} out of range for {num_slices} slices"
        )));
    }
    let slice_rows = rows / num_slices;
    Ok((slice_index * slice_rows, (slice_index + 1) * slice_rows))
}

/// Copy rows of slice `slice_index` of `num_slices` into an L1 sharded tensor
/// of shape `[1, 1, rows / num_slices, cols]`.
pub fn interleaved_to_sharded_partial(
    x: &DeviceTensor,
    grid: CoreGrid,
    shard_shape: [usize; 2],
    num_slices: usize,
    slice_index: usize,
    layout: TensorLayout,
    orientation: ShardOrientation,
) -> Result<DeviceTensor> {
    if x.is_sharded() {
        return Err(LayerError::Precondition(
            "partial resharding reads from an interleaved tensor".to_string(),
        ));
    }
    let (start, end) = slice_bounds(x.rows(), num_slices, slice_index)?;
    let memory = MemoryConfig::l1_sharded(layout, grid)
        .with_shard_shape(shard_shape)
        .with_orientation(orientation);
    if !memory.is_sharded() {
        return Err(LayerError::Config(
            "partial resharding needs a sharded layout".to_string(),
        ));
    }
    let data = slice_rows(x.data(), x.cols(), start, end).to_vec();
    DeviceTensor::from_data(
        x.device(),
        [1, 1, end - start, x.cols()],
        x.dtype(),
        data,
        memory,
    )
}

/// Write a sharded slice back into rows of slice `slice_index` of `out`.
///
/// Rows outside the slice are left untouched. Values are rounded to the
/// output's element type.
pub fn sharded_to_interleaved_partial(
    slice: &DeviceTensor,
    out: &mut DeviceTensor,
    num_slices: usize,
    slice_index: usize,
) -> Result<()> {
    if out.is_sharded() {
        return Err(LayerError::Precondition(
            "partial write-back target must be interleaved".to_string(),
        ));
    }
    if slice.device_id() != out.device_id() {
        return Err(LayerError::Precondition(format!(
            "slice on device {} cannot be written to device {}",
            slice.device_id(),
            out.device_id()
        )));
    }
    let (start, end) = slice_bounds(out.rows(), num_slices, slice_index)?;
    if slice.rows() != end - start || slice.cols() != out.cols() {
        return Err(LayerError::shape_mismatch(
            &[end - start, out.cols()],
            &[slice.rows(), slice.cols()],
        ));
    }
    let cols = out.cols();
    let dtype = out.dtype();
    let dst = &mut out.data_mut()[start * cols..end * cols];
    for (d, s) in dst.iter_mut().zip(slice.data()) {
        *d = dtype.round(*s);
    }
    Ok(())
}
