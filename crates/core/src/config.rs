//! Layer configuration
//!
//! A [`LayerConfig`] is built once per model instance and never mutated. It
//! carries the execution mode, where each stage places its output, the
//! element types of weights and activations, and collective settings.
//!
//! Environment overrides:
//!
//! | Variable                       | Field |
//! |--------------------------------|-------|
//! | `SHARDLAYER_MODE`              | `mode` (`prefill` or `decode`) |
//! | `SHARDLAYER_CACHE_DIR`         | `cache_dir` |
//! | `SHARDLAYER_ALL_GATHER_LINKS`  | `all_gather_num_links` |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::comm::AllGatherStrategy;
use crate::error::{LayerError, Result};
use crate::kernel::ComputeKernelConfig;
use crate::model::DecoderDims;
use crate::tensor::{CoreGrid, DType, MemoryConfig, TensorLayout, TILE};

/// Rows normalized per chunk during prefill
pub const NORM_SLICE_ROWS: usize = 128;

/// Execution mode of a layer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum LlmMode {
    /// Whole prompt for one user
    Prefill,
    /// One token for each user in the batch
    Decode,
}

impl fmt::Display for LlmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmMode::Prefill => write!(f, "prefill"),
            LlmMode::Decode => write!(f, "decode"),
        }
    }
}

impl FromStr for LlmMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "prefill" => Ok(LlmMode::Prefill),
            "decode" => Ok(LlmMode::Decode),
            _ => Err(LayerError::Config(format!("Unknown llm_mode: {s}"))),
        }
    }
}

impl TryFrom<String> for LlmMode {
    type Error = LayerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Core grid used for each prefill normalization chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayernormSliceParams {
    pub num_cores_x: usize,
    pub num_cores_y: usize,
}

impl LayernormSliceParams {
    pub fn grid(&self) -> CoreGrid {
        CoreGrid::new(self.num_cores_x, self.num_cores_y)
    }
}

/// Immutable configuration of one decoder layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub mode: LlmMode,

    // Placements
    pub dram: MemoryConfig,
    pub l1: MemoryConfig,
    /// Residual stream between layers (decode)
    pub word_embedding_output: MemoryConfig,
    pub all_gather_output: MemoryConfig,
    /// Gathered activations resharded for normalization (decode)
    pub all_gather_sharded: MemoryConfig,
    pub ln_attn_output: MemoryConfig,
    pub ln_mlp_output: MemoryConfig,
    pub attn_add_output: MemoryConfig,
    pub mlp_add_output: MemoryConfig,
    pub attn_mask: MemoryConfig,

    // Precision
    pub ln_attn_weights_dtype: DType,
    pub ln_mlp_weights_dtype: DType,
    pub activation_dtype: DType,
    pub ln_output_dtype: DType,
    pub ln_compute: ComputeKernelConfig,

    // Collectives
    pub all_gather_num_links: usize,
    pub all_gather_strategy: AllGatherStrategy,

    pub layernorm: LayernormSliceParams,

    /// Directory holding cached weights and tables
    pub cache_dir: PathBuf,
}

/// Largest divisor of `tiles` that is at most `max`
fn fit_cores(tiles: usize, max: usize) -> usize {
    (1..=max.min(tiles).max(1))
        .rev()
        .find(|d| tiles % d == 0)
        .unwrap_or(1)
}

/// Lay `cores` out as a grid at most 8 wide
fn grid_for(cores: usize) -> CoreGrid {
    let x = fit_cores(cores, 8);
    CoreGrid::new(x, cores / x)
}

fn width_sharded(cols: usize) -> MemoryConfig {
    let cores = fit_cores(cols / TILE, 32);
    MemoryConfig::l1_sharded(TensorLayout::WidthSharded, grid_for(cores))
}

impl LayerConfig {
    /// Default placements for `mode` on `num_devices` devices
    pub fn for_mode(mode: LlmMode, dims: &DecoderDims, num_devices: usize) -> Result<Self> {
        dims.validate(num_devices)?;
        let hidden = dims.hidden_size;
        let shard_cols = dims.hidden_per_device(num_devices);
        if shard_cols % TILE != 0 {
            return Err(LayerError::Config(format!(
                "per-device hidden size {shard_cols} must be a multiple of {TILE}"
            )));
        }

        let dram = MemoryConfig::dram();
        let l1 = MemoryConfig::l1();
        let residual = width_sharded(shard_cols);
        let replicated = width_sharded(hidden);

        let (word_embedding_output, all_gather_output, ln_output, add_output, attn_mask) =
            match mode {
                LlmMode::Decode => (
                    residual,
                    l1,
                    replicated,
                    residual,
                    MemoryConfig::l1_sharded(TensorLayout::HeightSharded, CoreGrid::new(8, 4)),
                ),
                LlmMode::Prefill => (dram, dram, dram, dram, dram),
            };

        Ok(Self {
            mode,
            dram,
            l1,
            word_embedding_output,
            all_gather_output,
            all_gather_sharded: replicated,
            ln_attn_output: ln_output,
            ln_mlp_output: ln_output,
            attn_add_output: add_output,
            mlp_add_output: add_output,
            attn_mask,
            ln_attn_weights_dtype: DType::Bf16,
            ln_mlp_weights_dtype: DType::Bf16,
            activation_dtype: DType::Bf16,
            ln_output_dtype: DType::Bf16,
            ln_compute: ComputeKernelConfig::default(),
            all_gather_num_links: 1,
            all_gather_strategy: AllGatherStrategy::DeviceLink,
            layernorm: LayernormSliceParams {
                num_cores_x: fit_cores(hidden / TILE, 8),
                num_cores_y: fit_cores(NORM_SLICE_ROWS / TILE, 4),
            },
            cache_dir: PathBuf::from("tensor_cache"),
        })
    }

    /// Defaults for the mode named in `SHARDLAYER_MODE` (decode when unset),
    /// then the remaining environment overrides.
    pub fn from_env(dims: &DecoderDims, num_devices: usize) -> Result<Self> {
        let mode = match std::env::var("SHARDLAYER_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => LlmMode::Decode,
        };
        Self::for_mode(mode, dims, num_devices)?.with_env_overrides()
    }

    /// Apply cache-dir and link-count overrides from the environment
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("SHARDLAYER_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Ok(links) = std::env::var("SHARDLAYER_ALL_GATHER_LINKS") {
            self.all_gather_num_links = links.parse().map_err(|_| {
                LayerError::Config(format!("SHARDLAYER_ALL_GATHER_LINKS={links} is not a count"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Use one element type for weights, activations and norm outputs
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.ln_attn_weights_dtype = dtype;
        self.ln_mlp_weights_dtype = dtype;
        self.activation_dtype = dtype;
        self.ln_output_dtype = dtype;
        self
    }

    pub fn with_all_gather(mut self, strategy: AllGatherStrategy, num_links: usize) -> Self {
        self.all_gather_strategy = strategy;
        self.all_gather_num_links = num_links;
        self
    }

    /// Check that every placement is usable by the stage that consumes it
    pub fn validate(&self) -> Result<()> {
        let placements = [
            ("dram", &self.dram),
            ("l1", &self.l1),
            ("word_embedding_output", &self.word_embedding_output),
            ("all_gather_output", &self.all_gather_output),
            ("all_gather_sharded", &self.all_gather_sharded),
            ("ln_attn_output", &self.ln_attn_output),
            ("ln_mlp_output", &self.ln_mlp_output),
            ("attn_add_output", &self.attn_add_output),
            ("mlp_add_output", &self.mlp_add_output),
            ("attn_mask", &self.attn_mask),
        ];
        for (name, placement) in placements {
            placement
                .validate()
                .map_err(|e| LayerError::Config(format!("{name}: {e}")))?;
        }
        if self.dram.is_sharded() || self.l1.is_sharded() {
            return Err(LayerError::Config(
                "dram and l1 placements must be interleaved".to_string(),
            ));
        }
        if self.all_gather_output.is_sharded() {
            return Err(LayerError::Config(
                "all_gather_output must be interleaved".to_string(),
            ));
        }
        if self.all_gather_num_links == 0 {
            return Err(LayerError::Config(
                "all_gather_num_links must be at least 1".to_string(),
            ));
        }
        match self.mode {
            LlmMode::Decode => {
                if !self.word_embedding_output.is_sharded() {
                    return Err(LayerError::Config(
                        "decode residual placement must be sharded".to_string(),
                    ));
                }
                if !self.all_gather_sharded.is_sharded() {
                    return Err(LayerError::Config(
                        "decode all_gather_sharded placement must be sharded".to_string(),
                    ));
                }
                if !self.ln_attn_output.is_sharded() || !self.ln_mlp_output.is_sharded() {
                    return Err(LayerError::Config(
                        "decode normalization output must be sharded".to_string(),
                    ));
                }
                if self.attn_add_output != self.word_embedding_output
                    || self.mlp_add_output != self.word_embedding_output
                {
                    return Err(LayerError::Config(
                        "decode residual adds are in place; their placement must match word_embedding_output"
                            .to_string(),
                    ));
                }
            }
            LlmMode::Prefill => {
                if self.layernorm.num_cores_x == 0 || self.layernorm.num_cores_y == 0 {
                    return Err(LayerError::Config(
                        "layernorm core grid must be non-empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// An unrecognized `mode` is a configuration error, as from `FromStr`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let table: toml::Table = toml::from_str(&content)?;
        if let Some(mode) = table.get("mode").and_then(toml::Value::as_str) {
            mode.parse::<LlmMode>()?;
        }
        let config: Self = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
