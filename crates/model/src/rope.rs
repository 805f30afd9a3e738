//! Rotary position embedding tables
//!
//! Frequencies follow `theta^(-2i / head_dim)` for `i < head_dim / 2`. Each
//! frequency rotates the pair `(x[2i], x[2i+1])`:
//!
//! ```text
//! x'[2i]   = x[2i] cos - x[2i+1] sin
//! x'[2i+1] = x[2i] sin + x[2i+1] cos
//! ```
//!
//! Prefill consumes gathered `cos` / `sin` tables with each value repeated
//! for both members of its pair; decode consumes the same rotation as a
//! `head_dim x head_dim` matrix `R` applied as `x . R`.

use shardlayer_core::{DType, HostTensor, LayerError, Result};

/// Precomputed cos/sin for positions `0..end`
#[derive(Debug, Clone)]
pub struct RopeFrequencies {
    head_dim: usize,
    end: usize,
    /// `[end, head_dim / 2]`
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeFrequencies {
    pub fn new(head_dim: usize, end: usize, theta: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(LayerError::Config(format!(
                "rotary head dim {head_dim} must be even"
            )));
        }
        let half = head_dim / 2;
        let freqs: Vec<f64> = (0..half)
            .map(|i| 1.0 / (theta as f64).powf((2 * i) as f64 / head_dim as f64))
            .collect();
        let mut cos = Vec::with_capacity(end * half);
        let mut sin = Vec::with_capacity(end * half);
        for pos in 0..end {
            for f in &freqs {
                let angle = pos as f64 * f;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        Ok(Self {
            head_dim,
            end,
            cos,
            sin,
        })
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

    fn check_range(&self, start: usize, count: usize) -> Result<()> {
        if start + count > self.end {
            return Err(LayerError::Precondition(format!(
                "positions {start}..{} exceed the {} precomputed rotary positions",
                start + count,
                self.end
            )));
        }
        Ok(())
    }

    /// Pair-duplicated `cos` and `sin` for positions `start..start + seq_len`,
    /// each `[1, 1, seq_len, head_dim]`.
    pub fn gather_cos_sin(
        &self,
        start: usize,
        seq_len: usize,
        dtype: DType,
    ) -> Result<(HostTensor, HostTensor)> {
        self.check_range(start, seq_len)?;
        let half = self.head_dim / 2;
        let shape = [1, 1, seq_len, self.head_dim];
        let pick = |table: &[f32]| {
            HostTensor::from_fn(shape, dtype, |[_, _, p, d]| table[(start + p) * half + d / 2])
        };
        Ok((pick(&self.cos), pick(&self.sin)))
    }

    /// Rotation matrix for one position, `[1, 1, head_dim, head_dim]`
    pub fn rotation_matrix(&self, pos: usize, dtype: DType) -> Result<HostTensor> {
        self.check_range(pos, 1)?;
        let half = self.head_dim / 2;
        let cos = &self.cos[pos * half..(pos + 1) * half];
        let sin = &self.sin[pos * half..(pos + 1) * half];
        let shape = [1, 1, self.head_dim, self.head_dim];
        Ok(HostTensor::from_fn(shape, dtype, |[_, _, r, c]| {
            if r / 2 != c / 2 {
                return 0.0;
            }
            let j = r / 2;
            match (r % 2, c % 2) {
                (0, 0) | (1, 1) => cos[j],
                (0, 1) => sin[j],
                _ => -sin[j],
            }
        }))
    }
}

/// Rotate one `head_dim` vector in place with gathered, pair-duplicated rows
pub fn apply_rotary_pairs(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    for i in 0..x.len() / 2 {
        let (a, b) = (x[2 * i], x[2 * i + 1]);
        let (c, s) = (cos[2 * i], sin[2 * i]);
        x[2 * i] = a * c - b * s;
        x[2 * i + 1] = a * s + b * c;
    }
}

/// `x . R` for one `head_dim` vector and a row-major `head_dim x head_dim` R
pub fn apply_rotation_matrix(x: &[f32], rot: &[f32]) -> Vec<f32> {
    let d = x.len();
    (0..d)
        .map(|c| (0..d).map(|r| x[r] * rot[r * d + c]).sum())
        .collect()
}
