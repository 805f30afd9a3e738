//! Tensor types for the emulated device mesh
//!
//! Every device tensor is rank-4. Layout functions work on the flattened 2-D
//! view `rows = dims[0] * dims[1] * dims[2]`, `cols = dims[3]`.
//!
//! | Placement            | Space | Shard shape                         |
//! |----------------------|-------|-------------------------------------|
//! | interleaved          | L1/DRAM | none                              |
//! | height sharded       | L1    | `[rows / cores, cols]`              |
//! | width sharded        | L1    | `[rows, cols / cores]`              |
//! | block sharded        | L1    | `[rows / grid.y, cols / grid.x]`    |

use std::fmt;

use half::bf16;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};

/// Tile edge; padded dimensions are multiples of this
pub const TILE: usize = 32;

/// Round up to the next multiple of 32
pub fn nearest_32(x: usize) -> usize {
    x.div_ceil(TILE) * TILE
}

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    Bf16,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bf16 => 2,
        }
    }

    /// Round a value to what this dtype can represent
    #[inline]
    pub fn round(&self, v: f32) -> f32 {
        match self {
            DType::F32 => v,
            DType::Bf16 => bf16::from_f32(v).to_f32(),
        }
    }

    pub fn round_slice(&self, values: &mut [f32]) {
        if *self == DType::Bf16 {
            for v in values.iter_mut() {
                *v = bf16::from_f32(*v).to_f32();
            }
        }
    }

    /// Stable numeric id used in cache files
    pub fn tag(&self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::Bf16 => 1,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::Bf16),
            _ => None,
        }
    }
}

/// Device memory space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    /// Small, fast, per-core memory
    L1,
    /// Bulk device memory
    Dram,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::L1 => write!(f, "L1"),
            MemorySpace::Dram => write!(f, "DRAM"),
        }
    }
}

/// How a tensor's rows and columns are distributed over memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// Pages spread round-robin over all banks
    Interleaved,
    HeightSharded,
    WidthSharded,
    BlockSharded,
}

impl TensorLayout {
    pub fn is_sharded(&self) -> bool {
        !matches!(self, TensorLayout::Interleaved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardOrientation {
    #[default]
    RowMajor,
    ColMajor,
}

/// Rectangular grid of cores, `x` columns by `y` rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreGrid {
    pub x: usize,
    pub y: usize,
}

impl CoreGrid {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    pub fn num_cores(&self) -> usize {
        self.x * self.y
    }
}

/// Resolved sharding of one tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub layout: TensorLayout,
    pub grid: CoreGrid,
    /// `[height, width]` of each shard
    pub shape: [usize; 2],
    pub orientation: ShardOrientation,
}

impl ShardSpec {
    /// Number of shards the tensor is cut into
    pub fn num_shards(&self, rows: usize, cols: usize) -> usize {
        (rows / self.shape[0]) * (cols / self.shape[1])
    }
}

/// Placement of a tensor: layout, memory space and (for sharded layouts) the
/// core grid and shard shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub layout: TensorLayout,
    pub space: MemorySpace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<CoreGrid>,
    /// Explicit shard shape; derived from the tensor shape when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_shape: Option<[usize; 2]>,
    #[serde(default)]
    pub orientation: ShardOrientation,
}

impl MemoryConfig {
    /// Interleaved in bulk memory
    pub const fn dram() -> Self {
        Self {
            layout: TensorLayout::Interleaved,
            space: MemorySpace::Dram,
            grid: None,
            shard_shape: None,
            orientation: ShardOrientation::RowMajor,
        }
    }

    /// Interleaved in fast memory
    pub const fn l1() -> Self {
        Self {
            layout: TensorLayout::Interleaved,
            space: MemorySpace::L1,
            grid: None,
            shard_shape: None,
            orientation: ShardOrientation::RowMajor,
        }
    }

    /// Sharded over a core grid in fast memory
    pub const fn l1_sharded(layout: TensorLayout, grid: CoreGrid) -> Self {
        Self {
            layout,
            space: MemorySpace::L1,
            grid: Some(grid),
            shard_shape: None,
            orientation: ShardOrientation::RowMajor,
        }
    }

    pub fn with_shard_shape(mut self, shape: [usize; 2]) -> Self {
        self.shard_shape = Some(shape);
        self
    }

    pub fn with_orientation(mut self, orientation: ShardOrientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn is_sharded(&self) -> bool {
        self.layout.is_sharded()
    }

    /// Check the placement is self-consistent, independent of any tensor
    pub fn validate(&self) -> Result<()> {
        if !self.is_sharded() {
            return Ok(());
        }
        if self.space != MemorySpace::L1 {
            return Err(LayerError::Config(format!(
                "{:?} placement must live in L1, not {}",
                self.layout, self.space
            )));
        }
        match self.grid {
            Some(grid) if grid.num_cores() > 0 => {}
            _ => {
                return Err(LayerError::Config(format!(
                    "{:?} placement needs a non-empty core grid",
                    self.layout
                )))
            }
        }
        if let Some([h, w]) = self.shard_shape {
            if h == 0 || w == 0 {
                return Err(LayerError::Config("shard shape must be non-zero".to_string()));
            }
        }
        Ok(())
    }

    /// Resolve the shard spec this placement gives a `rows x cols` tensor.
    ///
    /// Returns `None` for interleaved placements.
    pub fn resolve_shard(&self, rows: usize, cols: usize) -> Result<Option<ShardSpec>> {
        self.validate()?;
        let grid = match (self.layout, self.grid) {
            (TensorLayout::Interleaved, _) | (_, None) => return Ok(None),
            (_, Some(grid)) => grid,
        };
        let cores = grid.num_cores();

        let shape = match self.shard_shape {
            Some(shape) => shape,
            None => {
                let derived = match self.layout {
                    TensorLayout::HeightSharded => (rows % cores == 0).then(|| [rows / cores, cols]),
                    TensorLayout::WidthSharded => (cols % cores == 0).then(|| [rows, cols / cores]),
                    TensorLayout::BlockSharded => (rows % grid.y == 0 && cols % grid.x == 0)
                        .then(|| [rows / grid.y, cols / grid.x]),
                    TensorLayout::Interleaved => None,
                };
                derived.ok_or_else(|| {
                    LayerError::Config(format!(
                        "{:?} over {}x{} cores does not divide a {}x{} tensor",
                        self.layout, grid.x, grid.y, rows, cols
                    ))
                })?
            }
        };

        let [h, w] = shape;
        if rows % h != 0 || cols % w != 0 {
            return Err(LayerError::Config(format!(
                "shard shape [{h}, {w}] does not tile a {rows}x{cols} tensor"
            )));
        }
        let spec = ShardSpec {
            layout: self.layout,
            grid,
            shape,
            orientation: self.orientation,
        };
        let shards = spec.num_shards(rows, cols);
        let fits = match self.layout {
            TensorLayout::HeightSharded => w == cols && shards <= cores,
            TensorLayout::WidthSharded => h == rows && shards <= cores,
            TensorLayout::BlockSharded => rows / h <= grid.y && cols / w <= grid.x,
            TensorLayout::Interleaved => true,
        };
        if !fits {
            return Err(LayerError::Config(format!(
                "{:?} shard [{h}, {w}] of a {rows}x{cols} tensor needs {shards} shards, grid has {cores} cores",
                self.layout
            )));
        }
        Ok(Some(spec))
    }
}

/// Dense host tensor, row-major over a rank-4 shape
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: [usize; 4],
    dtype: DType,
    data: Vec<f32>,
}

impl HostTensor {
    /// Wrap host data, rounding it to `dtype`
    pub fn new(shape: [usize; 4], dtype: DType, mut data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(LayerError::Precondition(format!(
                "tensor of shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        dtype.round_slice(&mut data);
        Ok(Self { shape, dtype, data })
    }

    pub fn zeros(shape: [usize; 4], dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Build a tensor element by element from its 4-D index
    pub fn from_fn(shape: [usize; 4], dtype: DType, mut f: impl FnMut([usize; 4]) -> f32) -> Self {
        let mut data = Vec::with_capacity(shape.iter().product());
        for a in 0..shape[0] {
            for b in 0..shape[1] {
                for c in 0..shape[2] {
                    for d in 0..shape[3] {
                        data.push(dtype.round(f([a, b, c, d])));
                    }
                }
            }
        }
        Self { shape, dtype, data }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rows(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    pub fn cols(&self) -> usize {
        self.shape[3]
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    pub fn get(&self, idx: [usize; 4]) -> f32 {
        self.data[offset(&self.shape, idx)]
    }

    /// Reinterpret with a new shape of the same element count
    pub fn reshape(mut self, shape: [usize; 4]) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(LayerError::shape_mismatch(&self.shape, &shape));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Convert to another element type
    pub fn to_dtype(&self, dtype: DType) -> Self {
        let mut data = self.data.clone();
        dtype.round_slice(&mut data);
        Self {
            shape: self.shape,
            dtype,
            data,
        }
    }

    /// Tile the tensor `reps[i]` times along each dim
    pub fn repeat(&self, reps: [usize; 4]) -> Self {
        let s = self.shape;
        let out_shape = [s[0] * reps[0], s[1] * reps[1], s[2] * reps[2], s[3] * reps[3]];
        HostTensor::from_fn(out_shape, self.dtype, |[a, b, c, d]| {
            self.get([a % s[0], b % s[1], c % s[2], d % s[3]])
        })
    }

    /// Maximum absolute elementwise difference
    pub fn max_abs_diff(&self, other: &HostTensor) -> f32 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

#[inline]
pub(crate) fn offset(shape: &[usize; 4], idx: [usize; 4]) -> usize {
    ((idx[0] * shape[1] + idx[1]) * shape[2] + idx[2]) * shape[3] + idx[3]
}
