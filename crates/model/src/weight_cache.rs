//! On-disk cache for norm weights and input tables
//!
//! One file per tensor. Norm weights are stored once per device:
//! `{cache_dir}/{weight_name}{device}_{num_devices}.bin`; tables are stored
//! under their cache key: `{cache_dir}/{key}.bin`.
//!
//! File layout (little endian):
//!
//! | Field    | Size        |
//! |----------|-------------|
//! | magic    | 8 bytes `SHLAYER\0` |
//! | version  | u32         |
//! | dtype    | u32 (0 = f32, 1 = bf16) |
//! | shape    | 4 x u64     |
//! | checksum | u64, FNV-1a over the payload |
//! | payload  | numel x (4 bytes f32 / 2 bytes bf16) |
//!
//! Anything that fails to decode to the expected shape is reported as
//! cache corruption; it is never silently rebuilt.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use half::bf16;
use tempfile::NamedTempFile;

use shardlayer_core::{
    DType, DeviceMesh, DeviceTensor, HostTensor, LayerError, MemoryConfig, Result, TILE,
};

/// Cache file format version - increment when format changes
const CACHE_VERSION: u32 = 1;

/// Magic bytes to identify cache files
const CACHE_MAGIC: &[u8; 8] = b"SHLAYER\x00";

const HEADER_BYTES: usize = 8 + 4 + 4 + 4 * 8 + 8;

/// Path of one device's copy of a cached weight
pub fn weight_cache_path(
    cache_dir: &Path,
    name: &str,
    device: usize,
    num_devices: usize,
) -> PathBuf {
    cache_dir.join(format!("{name}{device}_{num_devices}.bin"))
}

/// Directory of cached host tensors
#[derive(Debug, Clone)]
pub struct TensorStore {
    dir: PathBuf,
}

impl TensorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    /// FNV-1a hash
    pub fn compute_checksum(data: &[u8]) -> u64 {
        const FNV_OFFSET: u64 = 14695981039346656037;
        const FNV_PRIME: u64 = 1099511628211;

        let mut hash = FNV_OFFSET;
        for &byte in data {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Write `tensor` under `key`, returning the bytes written
    pub fn save(&self, key: &str, tensor: &HostTensor) -> Result<u64> {
        fs::create_dir_all(&self.dir)?;

        let payload: Vec<u8> = match tensor.dtype() {
            DType::F32 => tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::Bf16 => tensor
                .data()
                .iter()
                .flat_map(|v| bf16::from_f32(*v).to_bits().to_le_bytes())
                .collect(),
        };

        // Each writer gets its own sibling file; the rename publishes it whole
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(&mut tmp);
            writer.write_all(CACHE_MAGIC)?;
            writer.write_all(&CACHE_VERSION.to_le_bytes())?;
            writer.write_all(&tensor.dtype().tag().to_le_bytes())?;
            for dim in tensor.shape() {
                writer.write_all(&(dim as u64).to_le_bytes())?;
            }
            writer.write_all(&Self::compute_checksum(&payload).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.flush()?;
        }
        tmp.persist(self.path(key)).map_err(|e| e.error)?;

        tracing::debug!(key, bytes = HEADER_BYTES + payload.len(), "cached tensor");
        Ok((HEADER_BYTES + payload.len()) as u64)
    }

    /// Read `key`, which must decode to `expected` shape
    pub fn load(&self, key: &str, expected: [usize; 4]) -> Result<HostTensor> {
        let bytes = fs::read(self.path(key))?;
        let corrupt = |reason: String| LayerError::CacheCorruption {
            name: key.to_string(),
            reason,
        };

        if bytes.len() < HEADER_BYTES {
            return Err(corrupt(format!("{} bytes is shorter than the header", bytes.len())));
        }
        let mut cursor = Cursor { bytes: &bytes, pos: 0 };
        if cursor.take(8) != CACHE_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = cursor.u32();
        if version != CACHE_VERSION {
            return Err(corrupt(format!(
                "version {version}, expected {CACHE_VERSION}"
            )));
        }
        let tag = cursor.u32();
        let dtype = DType::from_tag(tag).ok_or_else(|| corrupt(format!("unknown dtype {tag}")))?;
        let mut shape = [0usize; 4];
        for dim in shape.iter_mut() {
            *dim = cursor.u64() as usize;
        }
        if shape != expected {
            return Err(corrupt(format!("shape {shape:?}, expected {expected:?}")));
        }
        let checksum = cursor.u64();
        let payload = cursor.rest();

        let numel: usize = shape.iter().product();
        if payload.len() != numel * dtype.size_bytes() {
            return Err(corrupt(format!(
                "payload is {} bytes, shape needs {}",
                payload.len(),
                numel * dtype.size_bytes()
            )));
        }
        if Self::compute_checksum(payload) != checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let data = match dtype {
            DType::F32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::Bf16 => payload
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        };
        HostTensor::new(shape, dtype, data)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u32(&mut self) -> u32 {
        let b = self.take(4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8));
        u64::from_le_bytes(b)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// Host weights keyed by their full name
#[derive(Debug, Default, Clone)]
pub struct StateDict {
    tensors: HashMap<String, HostTensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&HostTensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| LayerError::MissingWeight(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Names of the two norm weights of layer `layer_num`
pub fn norm_weight_names(base_url: &str, layer_num: usize) -> (String, String) {
    (
        format!("{base_url}.{layer_num}.attention_norm.weight"),
        format!("{base_url}.{layer_num}.ffn_norm.weight"),
    )
}

/// Per-device RMSNorm weights of one layer
pub struct NormWeights {
    pub attention: Vec<DeviceTensor>,
    pub ffn: Vec<DeviceTensor>,
}

impl std::fmt::Debug for NormWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormWeights")
            .field("num_devices", &self.attention.len())
            .finish()
    }
}

/// Options for [`NormWeights::load_or_build`]
#[derive(Debug, Clone, Copy)]
pub struct NormWeightSpec<'a> {
    pub base_url: &'a str,
    pub layer_num: usize,
    pub hidden_size: usize,
    pub attention_dtype: DType,
    pub ffn_dtype: DType,
    pub memory: MemoryConfig,
}

impl NormWeights {
    /// Load both norms for every device from the cache, or build them from
    /// `state_dict` and populate the cache.
    ///
    /// The ffn norm of the last device is the existence probe for the whole
    /// set: when it is present every shard of both norms is read from disk.
    pub fn load_or_build(
        mesh: &DeviceMesh,
        store: &TensorStore,
        state_dict: &StateDict,
        spec: NormWeightSpec<'_>,
    ) -> Result<Self> {
        let n = mesh.num_devices();
        if spec.hidden_size % TILE != 0 {
            return Err(LayerError::Config(format!(
                "norm weight of {} elements cannot be tiled by {TILE}",
                spec.hidden_size
            )));
        }
        let shape = [1, 1, spec.hidden_size / TILE, TILE];
        let (attn_name, ffn_name) = norm_weight_names(spec.base_url, spec.layer_num);
        let key = |name: &str, device: usize| format!("{name}{device}_{n}");

        let probe = key(&ffn_name, n - 1);
        if store.exists(&probe) {
            tracing::info!(layer = spec.layer_num, probe = %probe, "loading norm weights from cache");
            let load = |name: &str, dtype: DType| {
                mesh.dispatch_each("load_norm_weight", |device| {
                    let host = store.load(&key(name, device.device_id()), shape)?;
                    DeviceTensor::from_host(device, &host.to_dtype(dtype), spec.memory)
                })
            };
            return Ok(Self {
                attention: load(&attn_name, spec.attention_dtype)?,
                ffn: load(&ffn_name, spec.ffn_dtype)?,
            });
        }

        tracing::info!(layer = spec.layer_num, "building norm weights from state dict");
        let build = |name: &str, dtype: DType| -> Result<Vec<DeviceTensor>> {
            let source = state_dict.get(name)?;
            if source.numel() != spec.hidden_size {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![spec.hidden_size],
                    got: source.shape().to_vec(),
                });
            }
            let host = source.to_dtype(dtype).reshape(shape)?;
            for device in 0..n {
                store.save(&key(name, device), &host)?;
            }
            mesh.replicate(&host, spec.memory)
        };
        // ffn last, so the probe file only appears once everything else is written
        let attention = build(&attn_name, spec.attention_dtype)?;
        let ffn = build(&ffn_name, spec.ffn_dtype)?;
        Ok(Self { attention, ffn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlayer_core::MemoryBudget;
    use std::env;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("shardlayer-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_cache_tensor_roundtrip() {
        let dir = temp_dir("roundtrip");
        let store = TensorStore::new(&dir);
        let t = HostTensor::from_fn([1, 2, 3, 4], DType::Bf16, |[a, b, c, d]| {
            (a + b * 10 + c * 100 + d) as f32 * 0.5
        });
        store.save("rot_mat_decode_5", &t).unwrap();
        assert!(store.exists("rot_mat_decode_5"));
        assert_eq!(store.load("rot_mat_decode_5", [1, 2, 3, 4]).unwrap(), t);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_concurrent_saves_publish_whole_files() {
        let dir = temp_dir("concurrent");
        let store = TensorStore::new(&dir);
        std::thread::scope(|s| {
            for writer in 0..8 {
                let store = &store;
                s.spawn(move || {
                    let t = HostTensor::new([1, 1, 64, 64], DType::F32, vec![writer as f32; 4096])
                        .unwrap();
                    store.save("shared", &t).unwrap();
                });
            }
        });

        let loaded = store.load("shared", [1, 1, 64, 64]).unwrap();
        let first = loaded.data()[0];
        assert!(loaded.data().iter().all(|&v| v == first));
        let files: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_shape_mismatch_is_corruption() {
        let dir = temp_dir("shape");
        let store = TensorStore::new(&dir);
        store.save("t", &HostTensor::zeros([1, 1, 2, 2], DType::F32)).unwrap();
        let err = store.load("t", [1, 1, 4, 1]).unwrap_err();
        assert!(matches!(err, LayerError::CacheCorruption { ref name, .. } if name == "t"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = temp_dir("truncated");
        let store = TensorStore::new(&dir);
        store.save("t", &HostTensor::zeros([1, 1, 8, 8], DType::F32)).unwrap();
        let bytes = fs::read(store.path("t")).unwrap();
        fs::write(store.path("t"), &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            store.load("t", [1, 1, 8, 8]),
            Err(LayerError::CacheCorruption { .. })
        ));
        fs::write(store.path("t"), b"junk").unwrap();
        assert!(matches!(
            store.load("t", [1, 1, 8, 8]),
            Err(LayerError::CacheCorruption { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_norm_weights_probe() {
        let dir = temp_dir("norms");
        let store = TensorStore::new(&dir);
        let mesh = DeviceMesh::new(2, MemoryBudget::default()).unwrap();
        let hidden = 64;
        let (attn, ffn) = norm_weight_names("layers", 3);
        assert_eq!(ffn, "layers.3.ffn_norm.weight");

        let mut sd = StateDict::new();
        sd.insert(&attn, HostTensor::from_fn([1, 1, 1, hidden], DType::F32, |[_, _, _, c]| c as f32));
        sd.insert(&ffn, HostTensor::from_fn([1, 1, 1, hidden], DType::F32, |[_, _, _, c]| -(c as f32)));
        let spec = NormWeightSpec {
            base_url: "layers",
            layer_num: 3,
            hidden_size: hidden,
            attention_dtype: DType::F32,
            ffn_dtype: DType::F32,
            memory: MemoryConfig::dram(),
        };

        let built = NormWeights::load_or_build(&mesh, &store, &sd, spec).unwrap();
        assert_eq!(built.attention.len(), 2);
        assert_eq!(built.ffn[1].shape(), [1, 1, 2, 32]);
        assert!(weight_cache_path(&dir, &ffn, 1, 2).is_file());

        // Second load comes from disk; an empty state dict proves it
        let loaded = NormWeights::load_or_build(&mesh, &store, &StateDict::new(), spec).unwrap();
        for (a, b) in built.ffn.iter().zip(&loaded.ffn) {
            assert_eq!(a.data(), b.data());
        }
        assert_eq!(loaded.attention[0].get([0, 0, 1, 3]), 35.0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_weight() {
        let dir = temp_dir("missing");
        let store = TensorStore::new(&dir);
        let mesh = DeviceMesh::new(1, MemoryBudget::default()).unwrap();
        let spec = NormWeightSpec {
            base_url: "layers",
            layer_num: 0,
            hidden_size: 32,
            attention_dtype: DType::Bf16,
            ffn_dtype: DType::Bf16,
            memory: MemoryConfig::dram(),
        };
        let err = NormWeights::load_or_build(&mesh, &store, &StateDict::new(), spec).unwrap_err();
        assert!(matches!(err, LayerError::MissingWeight(_)));
        let _ = fs::remove_dir_all(&dir);
    }
}
