//! Dense reference sublayers
//!
//! [`ReferenceAttention`] and [`ReferenceMlp`] are small, exact
//! implementations of the two sublayers with seeded random weights. They
//! exist to drive a [`DecoderLayer`](crate::decoder::DecoderLayer) end to end
//! and to check that prefill and decode agree.
//!
//! Sharding:
//! - attention: device `d` owns heads `d * local_heads..(d + 1) * local_heads`
//!   (column slices of `wq`, `wk`, `wv`) and a `[hidden/N, hidden/N]` output
//!   projection block
//! - mlp: device `d` owns a column slice of the gate and up projections and
//!   a `[intermediate/N, hidden/N]` down projection block
//!
//! Both return `[1, 1, rows, hidden/N]` on every device, so no collective is
//! needed after either sublayer.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use shardlayer_core::kernel::{matmul_f32, silu, softmax_rows};
use shardlayer_core::{
    DType, DecoderDims, Device, DeviceMesh, DeviceTensor, HostTensor, LayerConfig, LayerError,
    MemoryConfig, Result,
};

use crate::input::RotationTables;
use crate::kv_cache::KvCache;
use crate::rope::{apply_rotary_pairs, apply_rotation_matrix};
use crate::sublayer::{Attention, FeedForward, Step};

fn random_matrix(rng: &mut ChaCha8Rng, rows: usize, cols: usize) -> HostTensor {
    let scale = 1.0 / (rows as f32).sqrt();
    HostTensor::from_fn([1, 1, rows, cols], DType::F32, |_| rng.gen_range(-scale..scale))
}

fn upload_columns(mesh: &DeviceMesh, host: &HostTensor) -> Result<Vec<DeviceTensor>> {
    mesh.shard_columns(host, MemoryConfig::dram())
}

/// `x [rows, w.rows] . w`
fn project(x: &[f32], rows: usize, w: &DeviceTensor) -> Result<Vec<f32>> {
    matmul_f32(x, w.data(), rows, w.rows(), w.cols())
}

fn check_mesh(what: &str, shards: usize, mesh: &DeviceMesh) -> Result<()> {
    if shards != mesh.num_devices() {
        return Err(LayerError::Precondition(format!(
            "{what} was built for {shards} devices, mesh has {}",
            mesh.num_devices()
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct AttentionShard {
    wq: DeviceTensor,
    wk: DeviceTensor,
    wv: DeviceTensor,
    wo: DeviceTensor,
    cache: KvCache,
}

/// Multi-head self-attention with rotary embeddings and a KV cache
#[derive(Debug)]
pub struct ReferenceAttention {
    local_heads: usize,
    head_dim: usize,
    output: MemoryConfig,
    dtype: DType,
    shards: Vec<AttentionShard>,
}

impl ReferenceAttention {
    pub fn new(
        mesh: &DeviceMesh,
        dims: &DecoderDims,
        config: &LayerConfig,
        seed: u64,
    ) -> Result<Self> {
        let n = mesh.num_devices();
        dims.validate(n)?;
        let hidden = dims.hidden_size;
        let width = dims.hidden_per_device(n);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let wq = upload_columns(mesh, &random_matrix(&mut rng, hidden, hidden))?;
        let wk = upload_columns(mesh, &random_matrix(&mut rng, hidden, hidden))?;
        let wv = upload_columns(mesh, &random_matrix(&mut rng, hidden, hidden))?;
        let wo_blocks: Vec<HostTensor> =
            (0..n).map(|_| random_matrix(&mut rng, width, width)).collect();
        let wo = mesh.dispatch("upload_wo", wo_blocks, |device, block| {
            DeviceTensor::from_host(device, &block, MemoryConfig::dram())
        })?;

        let shards = wq
            .into_iter()
            .zip(wk)
            .zip(wv)
            .zip(wo)
            .map(|(((wq, wk), wv), wo)| AttentionShard {
                wq,
                wk,
                wv,
                wo,
                cache: KvCache::new(width, dims.max_batch_size, dims.max_seq_len),
            })
            .collect();

        Ok(Self {
            local_heads: dims.local_heads(n),
            head_dim: dims.head_dim(),
            output: config.dram,
            dtype: config.activation_dtype,
            shards,
        })
    }

    /// KV cache of one device
    pub fn kv_cache(&self, device_id: usize) -> Option<&KvCache> {
        self.shards.get(device_id).map(|s| &s.cache)
    }

    /// Forget every cached key and value
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.cache.clear();
        }
    }

    fn width(&self) -> usize {
        self.local_heads * self.head_dim
    }

    /// Scaled dot-product attention of `q` (`[rows, width]`) against
    /// `kv_len` cached positions, one head at a time.
    fn attend<M>(
        &self,
        q: &[f32],
        rows: usize,
        (keys, values): (&[f32], &[f32]),
        kv_len: usize,
        mask: M,
    ) -> Vec<f32>
    where
        M: Fn(usize, usize, usize) -> f32,
    {
        let (hd, width) = (self.head_dim, self.width());
        let scale = 1.0 / (hd as f32).sqrt();
        let mut out = vec![0.0f32; rows * width];
        let mut scores = vec![0.0f32; rows * kv_len];
        for h in 0..self.local_heads {
            let head = h * hd..(h + 1) * hd;
            for r in 0..rows {
                let qh = &q[r * width..][head.clone()];
                for c in 0..kv_len {
                    let kh = &keys[c * width..][head.clone()];
                    let dot: f32 = qh.iter().zip(kh).map(|(a, b)| a * b).sum();
                    scores[r * kv_len + c] = dot * scale + mask(h, r, c);
                }
            }
            softmax_rows(&mut scores, kv_len);
            for r in 0..rows {
                for c in 0..kv_len {
                    let p = scores[r * kv_len + c];
                    let vh = &values[c * width..][head.clone()];
                    for (o, v) in out[r * width..][head.clone()].iter_mut().zip(vh) {
                        *o += p * v;
                    }
                }
            }
        }
        out
    }

    fn finish(
        &self,
        device: &Device,
        shard: &AttentionShard,
        attn: &[f32],
        rows: usize,
    ) -> Result<DeviceTensor> {
        let out = project(attn, rows, &shard.wo)?;
        DeviceTensor::from_data(device, [1, 1, rows, self.width()], self.dtype, out, self.output)
    }

    fn prefill_device(
        &self,
        device: &Device,
        x: &DeviceTensor,
        (cos, sin): (&DeviceTensor, &DeviceTensor),
        mask: &DeviceTensor,
        start_pos: usize,
        user_id: usize,
    ) -> Result<DeviceTensor> {
        let shard = &self.shards[device.device_id()];
        let (rows, hd, width) = (x.rows(), self.head_dim, self.width());
        let mut q = project(x.data(), rows, &shard.wq)?;
        let mut k = project(x.data(), rows, &shard.wk)?;
        let v = project(x.data(), rows, &shard.wv)?;
        for r in 0..rows {
            for h in 0..self.local_heads {
                let head = r * width + h * hd..r * width + (h + 1) * hd;
                apply_rotary_pairs(&mut q[head.clone()], cos.row(r), sin.row(r));
                apply_rotary_pairs(&mut k[head], cos.row(r), sin.row(r));
            }
        }

        shard.cache.write(user_id, start_pos, &k, &v)?;
        let kv_len = start_pos + rows;
        let (keys, values) = shard.cache.read(user_id, kv_len)?;
        let attn = self.attend(&q, rows, (&keys, &values), kv_len, |h, r, c| {
            if c < start_pos {
                0.0
            } else {
                mask.get([0, h, r, c - start_pos])
            }
        });
        self.finish(device, shard, &attn, rows)
    }

    fn decode_device(
        &self,
        device: &Device,
        x: &DeviceTensor,
        rot: &DeviceTensor,
        mask: &DeviceTensor,
        start_pos: usize,
    ) -> Result<DeviceTensor> {
        let shard = &self.shards[device.device_id()];
        let (batch, hd, width) = (x.rows(), self.head_dim, self.width());
        let q = project(x.data(), batch, &shard.wq)?;
        let k = project(x.data(), batch, &shard.wk)?;
        let v = project(x.data(), batch, &shard.wv)?;
        let rotate = |m: &[f32]| -> Vec<f32> {
            m.chunks(hd)
                .flat_map(|head| apply_rotation_matrix(head, rot.data()))
                .collect()
        };
        let (q, k) = (rotate(&q), rotate(&k));

        let kv_len = start_pos + 1;
        let mut attn = Vec::with_capacity(batch * width);
        for user in 0..batch {
            let row = user * width..(user + 1) * width;
            shard.cache.write(user, start_pos, &k[row.clone()], &v[row.clone()])?;
            let (keys, values) = shard.cache.read(user, kv_len)?;
            attn.extend(self.attend(&q[row], 1, (&keys, &values), kv_len, |h, _, c| {
                mask.get([user, h, 0, c])
            }));
        }
        self.finish(device, shard, &attn, batch)
    }
}

impl Attention for ReferenceAttention {
    fn forward(
        &self,
        mesh: &DeviceMesh,
        normed: Vec<DeviceTensor>,
        rotation: &RotationTables,
        masks: &[DeviceTensor],
        step: Step,
    ) -> Result<Vec<DeviceTensor>> {
        check_mesh("attention", self.shards.len(), mesh)?;
        match (step, rotation) {
            (Step::Prefill { start_pos, user_id }, RotationTables::Prefill { cos, sin }) => {
                mesh.dispatch("attention_prefill", normed, |device, x| {
                    let d = device.device_id();
                    let tables = (&cos[d], &sin[d]);
                    self.prefill_device(device, &x, tables, &masks[d], start_pos, user_id)
                })
            }
            (Step::Decode { start_pos }, RotationTables::Decode { rot_mats }) => {
                mesh.dispatch("attention_decode", normed, |device, x| {
                    let d = device.device_id();
                    self.decode_device(device, &x, &rot_mats[d], &masks[d], start_pos)
                })
            }
            (step, rotation) => Err(LayerError::Config(format!(
                "{} step with {} rotation tables",
                step.mode(),
                rotation.mode()
            ))),
        }
    }
}

#[derive(Debug)]
struct MlpShard {
    gate: DeviceTensor,
    up: DeviceTensor,
    down: DeviceTensor,
}

/// Gated SiLU feed-forward network
#[derive(Debug)]
pub struct ReferenceMlp {
    output: MemoryConfig,
    dtype: DType,
    shards: Vec<MlpShard>,
}

impl ReferenceMlp {
    pub fn new(
        mesh: &DeviceMesh,
        dims: &DecoderDims,
        config: &LayerConfig,
        seed: u64,
    ) -> Result<Self> {
        let n = mesh.num_devices();
        dims.validate(n)?;
        let hidden = dims.hidden_size;
        let local = dims.intermediate_size / n;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let gate = upload_columns(mesh, &random_matrix(&mut rng, hidden, dims.intermediate_size))?;
        let up = upload_columns(mesh, &random_matrix(&mut rng, hidden, dims.intermediate_size))?;
        let down_blocks: Vec<HostTensor> = (0..n)
            .map(|_| random_matrix(&mut rng, local, dims.hidden_per_device(n)))
            .collect();
        let down = mesh.dispatch("upload_down", down_blocks, |device, block| {
            DeviceTensor::from_host(device, &block, MemoryConfig::dram())
        })?;

        let shards = gate
            .into_iter()
            .zip(up)
            .zip(down)
            .map(|((gate, up), down)| MlpShard { gate, up, down })
            .collect();
        Ok(Self {
            output: config.dram,
            dtype: config.activation_dtype,
            shards,
        })
    }
}

impl FeedForward for ReferenceMlp {
    fn forward(&self, mesh: &DeviceMesh, normed: Vec<DeviceTensor>) -> Result<Vec<DeviceTensor>> {
        check_mesh("mlp", self.shards.len(), mesh)?;
        mesh.dispatch("mlp", normed, |device, x| {
            let shard = &self.shards[device.device_id()];
            let rows = x.rows();
            let mut h = project(x.data(), rows, &shard.gate)?;
            let up = project(x.data(), rows, &shard.up)?;
            drop(x);
            silu(&mut h);
            for (a, b) in h.iter_mut().zip(&up) {
                *a *= b;
            }
            let out = project(&h, rows, &shard.down)?;
            let cols = shard.down.cols();
            DeviceTensor::from_data(device, [1, 1, rows, cols], self.dtype, out, self.output)
        })
    }
}
