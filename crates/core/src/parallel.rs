//! Tensor-parallel slicing helpers
//!
//! Activations are split along the hidden (last) dimension into N
//! contiguous, equal slices; slice `i` lives on device `i`. Row helpers cut
//! the flattened 2-D view into contiguous row ranges, which is how prefill
//! normalization walks the sequence.

use crate::error::{LayerError, Result};
use crate::tensor::HostTensor;

/// Range `[start, end)` of shard `shard_id` along `shard_dim`
pub fn calculate_shard_indices(
    full_shape: &[usize],
    shard_dim: usize,
    shard_id: usize,
    num_shards: usize,
) -> (usize, usize) {
    let dim_size = full_shape[shard_dim];
    let shard_size = dim_size / num_shards;
    let start = shard_id * shard_size;
    let end = start + shard_size;
    (start, end)
}

/// Copy columns `[start, end)` of every row of a `rows x cols` buffer
pub fn slice_columns(data: &[f32], cols: usize, start: usize, end: usize) -> Vec<f32> {
    let rows = if cols == 0 { 0 } else { data.len() / cols };
    let mut out = Vec::with_capacity(rows * (end - start));
    for row in data.chunks_exact(cols) {
        out.extend_from_slice(&row[start..end]);
    }
    out
}

/// Split a host tensor along its last dim into `num_shards` equal slices
pub fn split_columns(host: &HostTensor, num_shards: usize) -> Result<Vec<HostTensor>> {
    let shape = host.shape();
    if num_shards == 0 || shape[3] % num_shards != 0 {
        return Err(LayerError::Precondition(format!(
            "hidden size {} must be divisible by {} devices",
            shape[3], num_shards
        )));
    }
    let width = shape[3] / num_shards;
    (0..num_shards)
        .map(|i| {
            let (start, end) = calculate_shard_indices(&shape, 3, i, num_shards);
            HostTensor::new(
                [shape[0], shape[1], shape[2], width],
                host.dtype(),
                slice_columns(host.data(), shape[3], start, end),
            )
        })
        .collect()
}

/// Interleave row-major buffers column-wise: row `r` of the output is row
/// `r` of every part, in part order.
pub fn concat_column_data(parts: &[&[f32]], rows: usize, part_cols: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(rows * part_cols * parts.len());
    for r in 0..rows {
        for part in parts {
            out.extend_from_slice(&part[r * part_cols..(r + 1) * part_cols]);
        }
    }
    out
}

/// Join host tensors of identical shape along their last dim
pub fn concat_columns(parts: &[HostTensor]) -> Result<HostTensor> {
    let first = parts
        .first()
        .ok_or_else(|| LayerError::Precondition("nothing to concatenate".to_string()))?;
    let shape = first.shape();
    if let Some(bad) = parts.iter().find(|p| p.shape() != shape) {
        return Err(LayerError::shape_mismatch(&shape, &bad.shape()));
    }
    let data: Vec<&[f32]> = parts.iter().map(HostTensor::data).collect();
    HostTensor::new(
        [shape[0], shape[1], shape[2], shape[3] * parts.len()],
        first.dtype(),
        concat_column_data(&data, first.rows(), shape[3]),
    )
}

/// Rows `[start, end)` of the flattened 2-D view
pub fn slice_rows(data: &[f32], cols: usize, start: usize, end: usize) -> &[f32] {
    &data[start * cols..end * cols]
}
