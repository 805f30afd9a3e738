//! Device kernels used by the decoder layer
//!
//! - RMS normalization over the last dim (sharded inputs only)
//! - element-wise add, both allocating and in place
//! - small dense helpers (matmul, SiLU, row softmax) for the reference
//!   sublayers
//!
//! Kernels run on the device the input lives on and charge their outputs to
//! that device's pool. Results are rounded to the output element type.

use serde::{Deserialize, Serialize};

use crate::device::DeviceTensor;
use crate::error::{LayerError, Result};
use crate::tensor::{DType, MemoryConfig, TILE};

/// Precision knobs for compute kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeKernelConfig {
    /// Accumulate reductions in fp32; otherwise the running sum is rounded
    /// to bf16 after every tile
    pub fp32_dest_acc: bool,
}

impl Default for ComputeKernelConfig {
    fn default() -> Self {
        Self {
            fp32_dest_acc: true,
        }
    }
}

fn same_device(a: &DeviceTensor, b: &DeviceTensor, op: &str) -> Result<()> {
    if a.device_id() != b.device_id() {
        return Err(LayerError::Precondition(format!(
            "{op}: operands on devices {} and {}",
            a.device_id(),
            b.device_id()
        )));
    }
    Ok(())
}

fn sum_of_squares(row: &[f32], compute: ComputeKernelConfig) -> f32 {
    if compute.fp32_dest_acc {
        return row.iter().map(|v| v * v).sum();
    }
    let mut acc = 0.0f32;
    for tile in row.chunks(TILE) {
        let partial: f32 = tile.iter().map(|v| v * v).sum();
        acc = DType::Bf16.round(acc + partial);
    }
    acc
}

/// RMS normalization: `out = x * rsqrt(mean(x^2) + eps) * weight`
///
/// `weight` holds one value per column of `x` in any shape. The input must be
/// core-sharded.
pub fn rms_norm(
    x: &DeviceTensor,
    weight: &DeviceTensor,
    eps: f32,
    output: MemoryConfig,
    out_dtype: DType,
    compute: ComputeKernelConfig,
) -> Result<DeviceTensor> {
    if !x.is_sharded() {
        return Err(LayerError::Precondition(
            "rms_norm input must be sharded across cores".to_string(),
        ));
    }
    same_device(x, weight, "rms_norm")?;
    let cols = x.cols();
    if weight.numel() != cols {
        return Err(LayerError::shape_mismatch(&[cols], &[weight.numel()]));
    }

    let w = weight.data();
    let mut out = Vec::with_capacity(x.numel());
    for r in 0..x.rows() {
        let row = x.row(r);
        let mean = sum_of_squares(row, compute) / cols as f32;
        let scale = 1.0 / (mean + eps).sqrt();
        out.extend(row.iter().zip(w).map(|(v, g)| v * scale * g));
    }
    DeviceTensor::from_data(x.device(), x.shape(), out_dtype, out, output)
}

/// `a + b` into a new tensor with the given placement and element type
pub fn add(
    a: &DeviceTensor,
    b: &DeviceTensor,
    output: MemoryConfig,
    out_dtype: DType,
) -> Result<DeviceTensor> {
    same_device(a, b, "add")?;
    if a.shape() != b.shape() {
        return Err(LayerError::shape_mismatch(&a.shape(), &b.shape()));
    }
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
    DeviceTensor::from_data(a.device(), a.shape(), out_dtype, data, output)
}

/// `a += b`, keeping `a`'s storage, placement and element type
pub fn add_in_place(a: &mut DeviceTensor, b: &DeviceTensor) -> Result<()> {
    same_device(a, b, "add_in_place")?;
    if a.shape() != b.shape() {
        return Err(LayerError::shape_mismatch(&a.shape(), &b.shape()));
    }
    let dtype = a.dtype();
    for (x, y) in a.data_mut().iter_mut().zip(b.data()) {
        *x = dtype.round(*x + y);
    }
    Ok(())
}

/// Row-major `[m, k] x [k, n]`
pub fn matmul_f32(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    if a.len() != m * k || b.len() != k * n {
        return Err(LayerError::shape_mismatch(
            &[m * k, k * n],
            &[a.len(), b.len()],
        ));
    }
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        let dst = &mut out[i * n..(i + 1) * n];
        for (p, &av) in row.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            let brow = &b[p * n..(p + 1) * n];
            for (d, &bv) in dst.iter_mut().zip(brow) {
                *d += av * bv;
            }
        }
    }
    Ok(out)
}

/// SiLU activation: `x * sigmoid(x)`
pub fn silu(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v /= 1.0 + (-*v).exp();
    }
}

/// Numerically stable softmax over each row of width `cols`
pub fn softmax_rows(x: &mut [f32], cols: usize) {
    for row in x.chunks_mut(cols) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
}
