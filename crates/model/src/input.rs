//! Mode-dependent input preparation
//!
//! Turns a host activation `[1, batch, seq, hidden]` into the per-device
//! tensors a [`DecoderLayer`](crate::decoder::DecoderLayer) consumes:
//!
//! | Mode    | Shards                                   | Rotation                 | Mask |
//! |---------|------------------------------------------|--------------------------|------|
//! | prefill | `[1, 1, seq, hidden/N]` DRAM interleaved | cos, sin `[1, 1, seq, head_dim]` | `[1, local_heads, seq, seq]` causal |
//! | decode  | `[1, 1, batch, hidden/N]` word-embedding placement | `R` `[1, 1, head_dim, head_dim]` | `[batch, local_heads, 32, padded_kv_len]` |
//!
//! Rotation tables and masks are cached twice: the host content on disk
//! under `{cache_dir}/{key}.bin`, and the uploaded device tensors in memory.
//! The first caller of a key builds it; concurrent callers of the same key
//! wait for that build and share the result.
//!
//! Cached device tensors live in DRAM. A decode mask is resharded into the
//! `attn_mask` placement for each call, and that copy belongs to the call's
//! [`PreparedInputs`]. Decode advances one position per token, so preparing
//! a position evicts the in-memory tables of every other decode position.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use half::bf16;
use once_cell::sync::OnceCell;

use shardlayer_core::layout::interleaved_to_sharded;
use shardlayer_core::{
    nearest_32, DType, DecoderDims, DeviceMesh, DeviceTensor, HostTensor, LayerConfig, LayerError,
    LlmMode, MemoryConfig, Result, NORM_SLICE_ROWS, TILE,
};

use crate::rope::RopeFrequencies;
use crate::weight_cache::TensorStore;

/// Additive mask value for hidden positions; the most negative finite bf16
pub fn mask_value() -> f32 {
    bf16::MIN.to_f32()
}

/// Longest prompt a single prefill call accepts
pub const MAX_PREFILL_SEQ_LEN: usize = 2048;

/// Smallest multiple of 32 covering positions `0..=start_pos`
pub fn padded_kv_len(start_pos: usize) -> usize {
    nearest_32(start_pos + 1)
}

/// `[1, 1, 32, padded_kv_len]` with columns past `start_pos` hidden
pub fn decode_mask_base(start_pos: usize, dtype: DType) -> HostTensor {
    let mask = mask_value();
    HostTensor::from_fn([1, 1, TILE, padded_kv_len(start_pos)], dtype, |[_, _, _, c]| {
        if c > start_pos {
            mask
        } else {
            0.0
        }
    })
}

/// `[1, 1, seq, seq]`, hiding every column to the right of the diagonal
pub fn prefill_mask_base(seq_len: usize, dtype: DType) -> HostTensor {
    let mask = mask_value();
    HostTensor::from_fn([1, 1, seq_len, seq_len], dtype, |[_, _, r, c]| {
        if c > r {
            mask
        } else {
            0.0
        }
    })
}

/// Cache keys of the tables each mode uses
pub mod keys {
    fn prefill(kind: &str, start_pos: usize, seq_len: usize) -> String {
        if start_pos == 0 {
            format!("{kind}_prefill_{seq_len}")
        } else {
            format!("{kind}_prefill_{start_pos}_{seq_len}")
        }
    }

    pub fn cos_prefill(start_pos: usize, seq_len: usize) -> String {
        prefill("cos_gathered", start_pos, seq_len)
    }

    pub fn sin_prefill(start_pos: usize, seq_len: usize) -> String {
        prefill("sin_gathered", start_pos, seq_len)
    }

    pub fn mask_prefill(seq_len: usize) -> String {
        format!("attn_mask_prefill_{seq_len}")
    }

    pub fn rot_mat_decode(start_pos: usize) -> String {
        format!("rot_mat_decode_{start_pos}")
    }

    pub fn mask_decode(start_pos: usize) -> String {
        format!("attn_mask_decode_{start_pos}")
    }

    /// Position a decode table key was built for
    pub fn decode_position(key: &str) -> Option<usize> {
        let rest = key
            .strip_prefix("rot_mat_decode_")
            .or_else(|| key.strip_prefix("attn_mask_decode_"))?;
        rest.split('/').next()?.parse().ok()
    }
}

type Entry = Arc<OnceCell<Arc<Vec<DeviceTensor>>>>;

/// Keyed, write-once cache of per-device tensors
#[derive(Default)]
pub struct TensorCache {
    entries: DashMap<String, Entry>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl TensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tensors under `key`, building them with `init` on first use.
    ///
    /// Only one caller runs `init` for a key; a failed build leaves the key
    /// empty.
    pub fn get_or_try_init<F>(&self, key: &str, init: F) -> Result<Arc<Vec<DeviceTensor>>>
    where
        F: FnOnce() -> Result<Vec<DeviceTensor>>,
    {
        // Clone the cell out so the shard lock is not held while building
        let cell: Entry = Arc::clone(&*self.entries.entry(key.to_string()).or_default());
        let mut built = false;
        let value = cell.get_or_try_init(|| {
            built = true;
            init().map(Arc::new)
        })?;
        if built {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::clone(value))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|cell| cell.get().is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop one key's device tensors once no caller holds them
    pub fn evict(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every key `keep` rejects
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for TensorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorCache")
            .field("entries", &self.entries.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

/// Rotary tables for one forward call, shared with the cache
#[derive(Debug, Clone)]
pub enum RotationTables {
    Prefill {
        cos: Arc<Vec<DeviceTensor>>,
        sin: Arc<Vec<DeviceTensor>>,
    },
    Decode {
        rot_mats: Arc<Vec<DeviceTensor>>,
    },
}

impl RotationTables {
    pub fn mode(&self) -> LlmMode {
        match self {
            RotationTables::Prefill { .. } => LlmMode::Prefill,
            RotationTables::Decode { .. } => LlmMode::Decode,
        }
    }
}

/// Everything one forward call consumes
#[derive(Debug)]
pub struct PreparedInputs {
    /// Activation shards, one per device
    pub xs: Vec<DeviceTensor>,
    pub start_pos: usize,
    pub rotation: RotationTables,
    /// Attention masks, one per device. Prefill masks are shared with the
    /// cache; decode masks are this call's own copies in `attn_mask`.
    pub masks: Arc<Vec<DeviceTensor>>,
}

/// Builds sharded inputs, rotation tables and masks for one layer mode
pub struct InputPreparer {
    mesh: Arc<DeviceMesh>,
    config: LayerConfig,
    dims: DecoderDims,
    rope: RopeFrequencies,
    store: TensorStore,
    cache: TensorCache,
}

impl fmt::Debug for InputPreparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPreparer")
            .field("mode", &self.config.mode)
            .field("num_devices", &self.mesh.num_devices())
            .field("cache", &self.cache)
            .finish()
    }
}

impl InputPreparer {
    pub fn new(mesh: Arc<DeviceMesh>, config: LayerConfig, dims: DecoderDims) -> Result<Self> {
        dims.validate(mesh.num_devices())?;
        config.validate()?;
        let rope = RopeFrequencies::new(dims.head_dim(), 2 * dims.max_seq_len, dims.rope_theta)?;
        let store = TensorStore::new(&config.cache_dir);
        tracing::info!(
            mode = %config.mode,
            num_devices = mesh.num_devices(),
            cache_dir = %config.cache_dir.display(),
            "input preparer ready"
        );
        Ok(Self {
            mesh,
            config,
            dims,
            rope,
            store,
            cache: TensorCache::new(),
        })
    }

    pub fn mode(&self) -> LlmMode {
        self.config.mode
    }

    pub fn cache(&self) -> &TensorCache {
        &self.cache
    }

    pub fn store(&self) -> &TensorStore {
        &self.store
    }

    /// Shard `x` (`[1, batch, seq, hidden]`) and fetch the tables for `start_pos`.
    ///
    /// Shape checks run before anything is placed on a device.
    pub fn prepare(&self, x: &HostTensor, start_pos: usize) -> Result<PreparedInputs> {
        let [lead, batch, seq_len, hidden] = x.shape();
        if lead != 1 || hidden != self.dims.hidden_size {
            return Err(LayerError::Precondition(format!(
                "expected input [1, batch, seq, {}], got {:?}",
                self.dims.hidden_size,
                x.shape()
            )));
        }
        match self.config.mode {
            LlmMode::Prefill => self.prepare_prefill(x, batch, seq_len, start_pos),
            LlmMode::Decode => self.prepare_decode(x, batch, seq_len, start_pos),
        }
    }

    fn prepare_prefill(
        &self,
        x: &HostTensor,
        batch: usize,
        seq_len: usize,
        start_pos: usize,
    ) -> Result<PreparedInputs> {
        if batch != 1 {
            return Err(LayerError::Precondition(format!(
                "prefill runs one user at a time, got batch {batch}"
            )));
        }
        if seq_len == 0 || seq_len % NORM_SLICE_ROWS != 0 || seq_len > MAX_PREFILL_SEQ_LEN {
            return Err(LayerError::Precondition(format!(
                "prefill seq_len {seq_len}: expected multiple of {NORM_SLICE_ROWS} in (0, {MAX_PREFILL_SEQ_LEN}]"
            )));
        }
        if start_pos + seq_len > self.rope.len() {
            return Err(LayerError::Precondition(format!(
                "positions {start_pos}..{} exceed the rotary table",
                start_pos + seq_len
            )));
        }

        let dtype = self.config.activation_dtype;
        let host = x.to_dtype(dtype).reshape([1, 1, seq_len, self.dims.hidden_size])?;
        let xs = self.mesh.shard_columns(&host, self.config.dram)?;

        let table_shape = [1, 1, seq_len, self.dims.head_dim()];
        let cos = self.cached_replicated(
            &keys::cos_prefill(start_pos, seq_len),
            table_shape,
            self.config.dram,
            || Ok(self.rope.gather_cos_sin(start_pos, seq_len, dtype)?.0),
        )?;
        let sin = self.cached_replicated(
            &keys::sin_prefill(start_pos, seq_len),
            table_shape,
            self.config.dram,
            || Ok(self.rope.gather_cos_sin(start_pos, seq_len, dtype)?.1),
        )?;

        let local_heads = self.dims.local_heads(self.mesh.num_devices());
        let mask_key = keys::mask_prefill(seq_len);
        let masks = self.cache.get_or_try_init(&mask_key, || {
            let base = self.cached_host(&mask_key, [1, 1, seq_len, seq_len], || {
                Ok(prefill_mask_base(seq_len, dtype))
            })?;
            let full = base.repeat([1, local_heads, 1, 1]);
            self.mesh.replicate(&full, self.config.attn_mask)
        })?;

        Ok(PreparedInputs {
            xs,
            start_pos,
            rotation: RotationTables::Prefill { cos, sin },
            masks,
        })
    }

    fn prepare_decode(
        &self,
        x: &HostTensor,
        batch: usize,
        seq_len: usize,
        start_pos: usize,
    ) -> Result<PreparedInputs> {
        if seq_len != 1 {
            return Err(LayerError::Precondition(format!(
                "decode takes one token per user, got seq_len {seq_len}"
            )));
        }
        if batch == 0 || batch > self.dims.max_batch_size {
            return Err(LayerError::Precondition(format!(
                "decode batch {batch} must be in 1..={}",
                self.dims.max_batch_size
            )));
        }
        if start_pos >= self.rope.len() {
            return Err(LayerError::Precondition(format!(
                "start_pos {start_pos} exceeds the rotary table"
            )));
        }

        // [1, batch, 1, hidden] -> [1, 1, batch, hidden]; users become rows
        let dtype = self.config.activation_dtype;
        let host = x.to_dtype(dtype).reshape([1, 1, batch, self.dims.hidden_size])?;
        let staged = self.mesh.shard_columns(&host, self.config.dram)?;
        let target = self.config.word_embedding_output;
        let xs = self.mesh.dispatch("reshard_input", staged, |_, x| {
            interleaved_to_sharded(&x, target)
        })?;

        let stale = self.cache.len();
        self.cache
            .retain(|key| keys::decode_position(key).map_or(true, |pos| pos == start_pos));
        if self.cache.len() < stale {
            tracing::trace!(start_pos, evicted = stale - self.cache.len(), "evicted decode tables");
        }

        let head_dim = self.dims.head_dim();
        let rot_mats = self.cached_replicated(
            &keys::rot_mat_decode(start_pos),
            [1, 1, head_dim, head_dim],
            self.config.dram,
            || self.rope.rotation_matrix(start_pos, dtype),
        )?;

        let padded = padded_kv_len(start_pos);
        let local_heads = self.dims.local_heads(self.mesh.num_devices());
        let mask_key = keys::mask_decode(start_pos);
        let memory_key = format!("{mask_key}/batch{batch}");
        let mut placement = self.config.attn_mask;
        if placement.is_sharded() {
            let rows = batch * local_heads * TILE;
            let cores = placement.grid.map(|g| g.num_cores()).unwrap_or(1);
            if rows % cores != 0 {
                return Err(LayerError::Config(format!(
                    "attn_mask grid of {cores} cores cannot split {rows} mask rows"
                )));
            }
            placement = placement.with_shard_shape([rows / cores, padded]);
        }
        let cached = self.cache.get_or_try_init(&memory_key, || {
            let base = self.cached_host(&mask_key, [1, 1, TILE, padded], || {
                Ok(decode_mask_base(start_pos, dtype))
            })?;
            let full = base.repeat([batch, 1, 1, 1]).repeat([1, local_heads, 1, 1]);
            self.mesh.replicate(&full, self.config.dram)
        })?;
        let masks = self.mesh.dispatch(
            "reshard_mask",
            cached.iter().collect::<Vec<_>>(),
            |_, mask| {
                if placement.is_sharded() {
                    interleaved_to_sharded(mask, placement)
                } else {
                    mask.to_memory(placement)
                }
            },
        )?;

        Ok(PreparedInputs {
            xs,
            start_pos,
            rotation: RotationTables::Decode { rot_mats },
            masks: Arc::new(masks),
        })
    }

    /// Device copies of a host table, shared through the in-memory cache
    fn cached_replicated<F>(
        &self,
        key: &str,
        shape: [usize; 4],
        memory: MemoryConfig,
        build: F,
    ) -> Result<Arc<Vec<DeviceTensor>>>
    where
        F: FnOnce() -> Result<HostTensor>,
    {
        self.cache.get_or_try_init(key, || {
            let host = self.cached_host(key, shape, build)?;
            self.mesh.replicate(&host, memory)
        })
    }

    /// Host content of `key` from disk, or built and written to disk
    fn cached_host<F>(&self, key: &str, shape: [usize; 4], build: F) -> Result<HostTensor>
    where
        F: FnOnce() -> Result<HostTensor>,
    {
        let dtype = self.config.activation_dtype;
        if self.store.exists(key) {
            tracing::debug!(key, "table loaded from disk");
            return Ok(self.store.load(key, shape)?.to_dtype(dtype));
        }
        tracing::debug!(key, "building table");
        let host = build()?;
        if host.shape() != shape {
            return Err(LayerError::shape_mismatch(&shape, &host.shape()));
        }
        self.store.save(key, &host)?;
        Ok(host)
    }
}
