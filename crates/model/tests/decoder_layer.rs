//! End-to-end tests of the decoder layer over an emulated device mesh

use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use shardlayer_core::layout::{interleaved_to_sharded_partial, sharded_to_interleaved_partial};
use shardlayer_core::{
    AllGatherStrategy, Communicator, CoreGrid, DType, DecoderDims, DeviceMesh, DeviceTensor,
    HostTensor, LayerConfig, LayerError, LlmMode, MemoryBudget, MemoryConfig, MemorySpace,
    ShardOrientation, TensorLayout,
};
use shardlayer_model::input::{decode_mask_base, mask_value, padded_kv_len};
use shardlayer_model::weight_cache::{norm_weight_names, weight_cache_path};
use shardlayer_model::{
    DecoderLayer, InputPreparer, LayerStage, LayerWeights, ReferenceAttention, ReferenceMlp,
    ResidualAccumulator, RotationTables, SlicePlan, StateDict, Step,
};

type RefLayer = DecoderLayer<ReferenceAttention, ReferenceMlp>;

const BASE_URL: &str = "layers";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_dims() -> DecoderDims {
    DecoderDims {
        hidden_size: 64,
        n_heads: 4,
        intermediate_size: 128,
        max_seq_len: 256,
        max_batch_size: 4,
        norm_eps: 1e-5,
        rope_theta: 10000.0,
    }
}

fn random_host(shape: [usize; 4], seed: u64) -> HostTensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    HostTensor::from_fn(shape, DType::F32, |_| rng.gen_range(-1.0..1.0))
}

fn norm_state_dict(hidden: usize, layers: usize) -> StateDict {
    let mut sd = StateDict::new();
    for layer in 0..layers {
        let (attn, ffn) = norm_weight_names(BASE_URL, layer);
        sd.insert(
            attn,
            HostTensor::from_fn([1, 1, 1, hidden], DType::F32, |[_, _, _, c]| {
                1.0 + ((c + layer) % 5) as f32 / 10.0
            }),
        );
        sd.insert(
            ffn,
            HostTensor::from_fn([1, 1, 1, hidden], DType::F32, |[_, _, _, c]| {
                0.75 + ((c * 3 + layer) % 7) as f32 / 20.0
            }),
        );
    }
    sd
}

fn config(mode: LlmMode, dims: &DecoderDims, n: usize, dir: &TempDir) -> LayerConfig {
    LayerConfig::for_mode(mode, dims, n)
        .unwrap()
        .with_dtype(DType::F32)
        .with_cache_dir(dir.path())
}

fn build_layer(
    mesh: &Arc<DeviceMesh>,
    config: &LayerConfig,
    dims: &DecoderDims,
    sd: &StateDict,
    layer_num: usize,
) -> RefLayer {
    let attn = ReferenceAttention::new(mesh, dims, config, 100 + layer_num as u64).unwrap();
    let mlp = ReferenceMlp::new(mesh, dims, config, 200 + layer_num as u64).unwrap();
    let weights = LayerWeights {
        state_dict: sd,
        base_url: BASE_URL,
        layer_num,
    };
    DecoderLayer::new(Arc::clone(mesh), config.clone(), *dims, weights, attn, mlp).unwrap()
}

fn mesh(n: usize) -> Arc<DeviceMesh> {
    Arc::new(DeviceMesh::new(n, MemoryBudget::default()).unwrap())
}

fn rows(x: &HostTensor, start: usize, len: usize) -> HostTensor {
    let cols = x.shape()[3];
    HostTensor::from_fn([1, 1, len, cols], DType::F32, |[_, _, r, c]| {
        x.get([0, 0, start + r, c])
    })
}

fn rot_mats(rotation: &RotationTables) -> &Arc<Vec<DeviceTensor>> {
    match rotation {
        RotationTables::Decode { rot_mats } => rot_mats,
        other => panic!("expected decode tables, got {other:?}"),
    }
}

fn cos_sin(rotation: &RotationTables) -> (&Arc<Vec<DeviceTensor>>, &Arc<Vec<DeviceTensor>>) {
    match rotation {
        RotationTables::Prefill { cos, sin } => (cos, sin),
        other => panic!("expected prefill tables, got {other:?}"),
    }
}

#[test]
fn test_prefill_shape_invariant() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Prefill, &dims, 2, &dir);
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();

    let inputs = prep.prepare(&random_host([1, 1, 256, 64], 1), 0).unwrap();
    let in_shapes: Vec<_> = inputs.xs.iter().map(|x| x.shape()).collect();
    let out = layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::prefill(0))
        .unwrap();

    assert_eq!(out.len(), 2);
    for (o, s) in out.iter().zip(&in_shapes) {
        assert_eq!(o.shape(), *s);
        assert_eq!(o.shape(), [1, 1, 256, 32]);
        assert_eq!(o.memory_config().space, MemorySpace::Dram);
        assert!(o.data().iter().all(|v| v.is_finite()));
    }
}

#[test]
fn test_decode_shape_invariant() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Decode, &dims, 2, &dir);
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg.clone(), dims).unwrap();

    let inputs = prep.prepare(&random_host([1, 4, 1, 64], 2), 0).unwrap();
    let out = layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::decode(0))
        .unwrap();
    assert_eq!(out.len(), 2);
    for o in &out {
        assert_eq!(o.shape(), [1, 1, 4, 32]);
        assert_eq!(o.memory_config(), &cfg.word_embedding_output);
    }
}

#[test]
fn test_decode_token_by_token_matches_prefill() {
    init_tracing();
    let dims = small_dims();
    let sd = norm_state_dict(64, 1);
    let seq = 128;
    let x = random_host([1, 1, seq, 64], 3);

    let prefill_dir = TempDir::new().unwrap();
    let prefill_mesh = mesh(2);
    let prefill_cfg = config(LlmMode::Prefill, &dims, 2, &prefill_dir);
    let prefill_layer = build_layer(&prefill_mesh, &prefill_cfg, &dims, &sd, 0);
    let prep = InputPreparer::new(Arc::clone(&prefill_mesh), prefill_cfg, dims).unwrap();
    let inputs = prep.prepare(&x, 0).unwrap();
    let out = prefill_layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::prefill(0))
        .unwrap();
    let expected = prefill_mesh.gather_to_host(&out).unwrap();

    let decode_dir = TempDir::new().unwrap();
    let decode_mesh = mesh(2);
    let decode_cfg = config(LlmMode::Decode, &dims, 2, &decode_dir);
    let decode_layer = build_layer(&decode_mesh, &decode_cfg, &dims, &sd, 0);
    let prep = InputPreparer::new(Arc::clone(&decode_mesh), decode_cfg, dims).unwrap();

    for pos in 0..seq {
        let token = HostTensor::from_fn([1, 1, 1, 64], DType::F32, |[_, _, _, c]| {
            x.get([0, 0, pos, c])
        });
        let inputs = prep.prepare(&token, pos).unwrap();
        let out = decode_layer
            .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::decode(pos))
            .unwrap();
        let got = decode_mesh.gather_to_host(&out).unwrap();
        for c in 0..64 {
            let (a, b) = (got.get([0, 0, 0, c]), expected.get([0, 0, pos, c]));
            assert!((a - b).abs() < 1e-4, "pos {pos} col {c}: decode {a} prefill {b}");
        }
    }
}

#[test]
fn test_all_gather_strategies_agree() {
    for n in [1, 2, 4] {
        let mesh = DeviceMesh::new(n, MemoryBudget::default()).unwrap();
        let host = random_host([1, 1, 64, 32 * n], 10 + n as u64);
        let gather = |strategy, links| {
            let comm = Communicator::new(strategy, links).unwrap();
            let shards = mesh.shard_columns(&host, MemoryConfig::dram()).unwrap();
            comm.all_gather(&mesh, shards, MemoryConfig::l1()).unwrap()
        };
        let emulated = gather(AllGatherStrategy::Emulated, 1);
        for links in [1, 3] {
            let ring = gather(AllGatherStrategy::DeviceLink, links);
            for (a, b) in ring.iter().zip(&emulated) {
                assert_eq!(a.data(), b.data(), "n={n} links={links}");
                assert_eq!(a.to_host(), host);
            }
        }
    }
}

#[test]
fn test_layer_output_independent_of_strategy() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let sd = norm_state_dict(64, 1);
    let mesh = mesh(2);
    let base = config(LlmMode::Decode, &dims, 2, &dir);
    let prep = InputPreparer::new(Arc::clone(&mesh), base.clone(), dims).unwrap();
    let x = random_host([1, 3, 1, 64], 4);

    let mut outputs = Vec::new();
    let strategies = [
        (AllGatherStrategy::DeviceLink, 2),
        (AllGatherStrategy::Emulated, 1),
    ];
    for (strategy, links) in strategies {
        let cfg = base.clone().with_all_gather(strategy, links);
        let layer = build_layer(&mesh, &cfg, &dims, &sd, 0);
        let inputs = prep.prepare(&x, 0).unwrap();
        let out = layer
            .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::decode(0))
            .unwrap();
        outputs.push(mesh.gather_to_host(&out).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_tables_and_weights_reload_from_disk() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Decode, &dims, 2, &dir);
    let x = HostTensor::zeros([1, 2, 1, 64], DType::F32);

    let first = InputPreparer::new(Arc::clone(&mesh), cfg.clone(), dims).unwrap();
    let a = first.prepare(&x, 37).unwrap();
    let again = first.prepare(&x, 37).unwrap();
    assert_eq!(first.cache().hits(), 2);
    assert!(Arc::ptr_eq(rot_mats(&a.rotation), rot_mats(&again.rotation)));
    for (m, n) in a.masks.iter().zip(again.masks.iter()) {
        assert_eq!(m.data(), n.data());
    }

    // A fresh preparer over the same directory reads what the first wrote
    let second = InputPreparer::new(Arc::clone(&mesh), cfg.clone(), dims).unwrap();
    assert!(second.store().exists("attn_mask_decode_37"));
    assert!(second.store().exists("rot_mat_decode_37"));
    let b = second.prepare(&x, 37).unwrap();
    for (m, n) in a.masks.iter().zip(b.masks.iter()) {
        assert_eq!(m.data(), n.data());
        assert_eq!(m.shape(), [2, 2, 32, 64]);
    }
    for (r, q) in rot_mats(&a.rotation).iter().zip(rot_mats(&b.rotation).iter()) {
        assert_eq!(r.data(), q.data());
        assert_eq!(r.shape(), [1, 1, 16, 16]);
    }

    // Norm weights: the second layer is built without a state dict
    let built = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let loaded = build_layer(&mesh, &cfg, &dims, &StateDict::new(), 0);
    for (w, v) in built.norms().ffn.iter().zip(&loaded.norms().ffn) {
        assert_eq!(w.data(), v.data());
        assert_eq!(w.shape(), [1, 1, 2, 32]);
    }
}

#[test]
fn test_prefill_continues_from_cached_prefix() {
    init_tracing();
    let dims = small_dims();
    let sd = norm_state_dict(64, 1);
    let x = random_host([1, 1, 256, 64], 14);

    let whole_dir = TempDir::new().unwrap();
    let whole_mesh = mesh(2);
    let whole_cfg = config(LlmMode::Prefill, &dims, 2, &whole_dir);
    let whole_layer = build_layer(&whole_mesh, &whole_cfg, &dims, &sd, 0);
    let prep = InputPreparer::new(Arc::clone(&whole_mesh), whole_cfg, dims).unwrap();
    let inputs = prep.prepare(&x, 0).unwrap();
    let out = whole_layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::prefill(0))
        .unwrap();
    let expected = whole_mesh.gather_to_host(&out).unwrap();

    let dir = TempDir::new().unwrap();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Prefill, &dims, 2, &dir);
    let layer = build_layer(&mesh, &cfg, &dims, &sd, 0);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg.clone(), dims).unwrap();
    let head = prep.prepare(&rows(&x, 0, 128), 0).unwrap();
    layer
        .forward(head.xs, &head.rotation, &head.masks, Step::prefill(0))
        .unwrap();
    let tail = prep.prepare(&rows(&x, 128, 128), 128).unwrap();
    assert!(prep.store().exists("cos_gathered_prefill_128_128"));
    assert!(prep.store().exists("sin_gathered_prefill_128_128"));
    let (cos, sin) = cos_sin(&tail.rotation);
    let (cos, sin) = (Arc::clone(cos), Arc::clone(sin));
    let out = layer
        .forward(tail.xs, &tail.rotation, &tail.masks, Step::prefill(128))
        .unwrap();
    let got = mesh.gather_to_host(&out).unwrap();

    // The tail attends over the cached prefix without a mask
    for r in 0..128 {
        for c in 0..64 {
            let (a, b) = (got.get([0, 0, r, c]), expected.get([0, 0, 128 + r, c]));
            assert!((a - b).abs() < 1e-4, "row {} col {c}: chunked {a} whole {b}", 128 + r);
        }
    }

    // Offset tables: shared on a second call, identical after a reload
    let again = prep.prepare(&rows(&x, 128, 128), 128).unwrap();
    let (cos_again, sin_again) = cos_sin(&again.rotation);
    assert!(Arc::ptr_eq(&cos, cos_again));
    assert!(Arc::ptr_eq(&sin, sin_again));
    let reloaded = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let fresh = reloaded.prepare(&rows(&x, 128, 128), 128).unwrap();
    let (cos_fresh, sin_fresh) = cos_sin(&fresh.rotation);
    for d in 0..2 {
        assert_eq!(cos[d].data(), cos_fresh[d].data());
        assert_eq!(sin[d].data(), sin_fresh[d].data());
        assert_eq!(cos[d].shape(), [1, 1, 128, 16]);
    }
    // position 128 is not position 0
    let start = prep.prepare(&rows(&x, 0, 128), 0).unwrap();
    let (cos_zero, _) = cos_sin(&start.rotation);
    assert_ne!(cos_zero[0].data(), cos[0].data());
}

#[test]
fn test_residual_adds_associate_in_bf16() {
    let mesh = DeviceMesh::new(2, MemoryBudget::default()).unwrap();
    let acc = ResidualAccumulator::new(&mesh);
    let hosts: Vec<HostTensor> = (0..3)
        .map(|i| random_host([1, 1, 32, 64], 20 + i).to_dtype(DType::Bf16))
        .collect();
    let shard = |h: &HostTensor| mesh.shard_columns(h, MemoryConfig::dram()).unwrap();

    let r = acc
        .add(shard(&hosts[0]), shard(&hosts[1]), MemoryConfig::dram(), DType::Bf16)
        .unwrap();
    let r = acc
        .add(r, shard(&hosts[2]), MemoryConfig::dram(), DType::Bf16)
        .unwrap();
    let got = mesh.gather_to_host(&r).unwrap();

    let exact = HostTensor::from_fn([1, 1, 32, 64], DType::F32, |idx| {
        hosts.iter().map(|h| h.get(idx)).sum()
    });
    assert!(got.max_abs_diff(&exact) < 0.05);
}

#[test]
fn test_decode_mask_shapes_at_70b_width() {
    let dir = TempDir::new().unwrap();
    let dims = DecoderDims::llama2_70b();
    let mesh = mesh(2);
    let cfg = LayerConfig::for_mode(LlmMode::Decode, &dims, 2)
        .unwrap()
        .with_cache_dir(dir.path());
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let batch = 2;
    let start_pos = 127;

    assert_eq!(padded_kv_len(start_pos), 128);
    let repeated = decode_mask_base(start_pos, DType::Bf16).repeat([batch, 1, 1, 1]);
    assert_eq!(repeated.shape(), [batch, 1, 32, 128]);

    let inputs = prep
        .prepare(&HostTensor::zeros([1, batch, 1, 8192], DType::Bf16), start_pos)
        .unwrap();
    assert_eq!(dims.local_heads(2), 32);
    for mask in inputs.masks.iter() {
        assert_eq!(mask.shape(), [batch, 32, 32, 128]);
        assert_eq!(mask.shard_spec().map(|s| s.shape[1]), Some(128));
        // position 127 is the last visible column; nothing is hidden
        assert_eq!(mask.get([1, 31, 0, 127]), 0.0);
    }
    for x in &inputs.xs {
        assert_eq!(x.shape(), [1, 1, batch, 4096]);
    }

    let inputs = prep
        .prepare(&HostTensor::zeros([1, batch, 1, 8192], DType::Bf16), 100)
        .unwrap();
    assert_eq!(inputs.masks[0].get([0, 0, 0, 101]), mask_value());
}

#[test]
fn test_decode_streams_hundreds_of_positions_at_70b_width() {
    let dir = TempDir::new().unwrap();
    let dims = DecoderDims::llama2_70b();
    let mesh = mesh(2);
    let cfg = LayerConfig::for_mode(LlmMode::Decode, &dims, 2)
        .unwrap()
        .with_cache_dir(dir.path());
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let batch = 8;
    let x = HostTensor::zeros([1, batch, 1, 8192], DType::Bf16);

    for pos in 0..320 {
        let inputs = prep
            .prepare(&x, pos)
            .unwrap_or_else(|e| panic!("start_pos {pos}: {e}"));
        assert_eq!(inputs.masks[1].shape(), [batch, 32, 32, padded_kv_len(pos)]);
        drop(inputs);
        assert_eq!(mesh.used(MemorySpace::L1), vec![0, 0], "start_pos {pos}");
        assert_eq!(prep.cache().len(), 2, "start_pos {pos}");
    }
}

#[test]
fn test_prefill_256_rows_is_two_chunks() {
    let plan = SlicePlan::for_rows(256).unwrap();
    assert_eq!(plan.num_slices, 2);

    let mesh = DeviceMesh::new(1, MemoryBudget::default()).unwrap();
    let device = mesh.device(0).unwrap();
    let host = random_host([1, 1, 256, 64], 5);
    let source = DeviceTensor::from_host(device, &host, MemoryConfig::dram()).unwrap();
    let sentinel = 777.0;
    let mut out = DeviceTensor::from_data(
        device,
        [1, 1, 256, 64],
        DType::F32,
        vec![sentinel; 256 * 64],
        MemoryConfig::dram(),
    )
    .unwrap();

    let chunk = interleaved_to_sharded_partial(
        &source,
        CoreGrid::new(2, 4),
        [32, 32],
        plan.num_slices,
        1,
        TensorLayout::BlockSharded,
        ShardOrientation::RowMajor,
    )
    .unwrap();
    sharded_to_interleaved_partial(&chunk, &mut out, plan.num_slices, 1).unwrap();

    for r in 0..128 {
        assert!(out.row(r).iter().all(|&v| v == sentinel), "row {r} was overwritten");
    }
    for r in 128..256 {
        assert_eq!(out.row(r), source.row(r));
    }
}

#[test]
fn test_stacked_layers_return_memory_to_baseline() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let layers = 8;
    let sd = norm_state_dict(64, layers);

    for mode in [LlmMode::Decode, LlmMode::Prefill] {
        let mesh = mesh(2);
        let cfg = config(mode, &dims, 2, &dir);
        let stack: Vec<RefLayer> = (0..layers)
            .map(|i| build_layer(&mesh, &cfg, &dims, &sd, i))
            .collect();
        let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
        let (x, step) = match mode {
            LlmMode::Decode => (random_host([1, 4, 1, 64], 6), Step::decode(0)),
            LlmMode::Prefill => (random_host([1, 1, 128, 64], 6), Step::prefill(0)),
        };
        let inputs = prep.prepare(&x, 0).unwrap();
        let l1 = mesh.used(MemorySpace::L1);
        let dram = mesh.used(MemorySpace::Dram);

        let mut xs = inputs.xs;
        for layer in &stack {
            xs = layer
                .forward(xs, &inputs.rotation, &inputs.masks, step)
                .unwrap();
            assert_eq!(mesh.used(MemorySpace::L1), l1, "{mode} layer {}", layer.layer_num());
            assert_eq!(mesh.used(MemorySpace::Dram), dram, "{mode} layer {}", layer.layer_num());
        }
        drop(xs);
        assert!(mesh.used(MemorySpace::Dram).iter().zip(&dram).all(|(a, b)| a <= b));
    }
}

#[test]
fn test_stage_order() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Decode, &dims, 2, &dir);
    let seen = Arc::new(Mutex::new(Vec::<LayerStage>::new()));
    let sink = Arc::clone(&seen);
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0)
        .with_stage_observer(Arc::new(move |_: usize, stage: LayerStage| {
            sink.lock().unwrap().push(stage)
        }));
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let inputs = prep.prepare(&random_host([1, 1, 1, 64], 7), 0).unwrap();
    layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::decode(0))
        .unwrap();

    use LayerStage::*;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Idle,
            PreparingInput,
            Normalizing,
            Attending,
            Residual1,
            Replicating,
            Normalizing2,
            FeedForwarding,
            Residual2,
            Done
        ]
    );
}

/// Pool usage of device 0 in `space` as each stage is entered
fn usage_by_stage(mode: LlmMode, space: MemorySpace) -> Vec<(LayerStage, usize)> {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(mode, &dims, 2, &dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sink, watched) = (Arc::clone(&seen), Arc::clone(&mesh));
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0)
        .with_stage_observer(Arc::new(move |_: usize, stage: LayerStage| {
            sink.lock().unwrap().push((stage, watched.used(space)[0]))
        }));
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let (x, step) = match mode {
        LlmMode::Decode => (random_host([1, 4, 1, 64], 15), Step::decode(0)),
        LlmMode::Prefill => (random_host([1, 1, 128, 64], 15), Step::prefill(0)),
    };
    let inputs = prep.prepare(&x, 0).unwrap();
    layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, step)
        .unwrap();
    let usage = seen.lock().unwrap().clone();
    usage
}

#[test]
fn test_all_gather_runs_before_each_norm_stage() {
    let cases = [
        (LlmMode::Decode, MemorySpace::L1),
        (LlmMode::Prefill, MemorySpace::Dram),
    ];
    for (mode, space) in cases {
        let usage = usage_by_stage(mode, space);
        let at = |stage: LayerStage| {
            usage
                .iter()
                .find(|(s, _)| *s == stage)
                .map(|(_, used)| *used)
                .unwrap()
        };
        // the gathered replicas exist once normalization starts
        assert!(at(LayerStage::Normalizing) > at(LayerStage::PreparingInput), "{mode}");
        assert!(at(LayerStage::Normalizing2) > at(LayerStage::Replicating), "{mode}");
    }
}

#[test]
fn test_step_must_match_mode() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Decode, &dims, 2, &dir);
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let inputs = prep.prepare(&random_host([1, 1, 1, 64], 8), 0).unwrap();
    let err = layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::prefill(0))
        .unwrap_err();
    assert!(matches!(err, LayerError::Config(_)));
}

#[test]
fn test_wrong_shard_count() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Decode, &dims, 2, &dir);
    let layer = build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let mut inputs = prep.prepare(&random_host([1, 1, 1, 64], 9), 0).unwrap();
    inputs.xs.pop();
    let err = layer
        .forward(inputs.xs, &inputs.rotation, &inputs.masks, Step::decode(0))
        .unwrap_err();
    assert!(matches!(err, LayerError::Precondition(_)));
}

#[test]
fn test_collective_rejects_partial_participation() {
    let mesh = DeviceMesh::new(4, MemoryBudget::default()).unwrap();
    let comm = Communicator::new(AllGatherStrategy::DeviceLink, 1).unwrap();

    let mut shards = mesh
        .shard_columns(&random_host([1, 1, 32, 128], 11), MemoryConfig::dram())
        .unwrap();
    shards.pop();
    let err = comm.all_gather(&mesh, shards, MemoryConfig::dram()).unwrap_err();
    assert!(matches!(err, LayerError::Synchronization { .. }));

    let mut shards = mesh
        .shard_columns(&random_host([1, 1, 32, 128], 12), MemoryConfig::dram())
        .unwrap();
    shards.swap(0, 1);
    let err = comm.all_gather(&mesh, shards, MemoryConfig::dram()).unwrap_err();
    assert!(matches!(err, LayerError::Synchronization { .. }));
}

#[test]
fn test_prefill_rejects_unaligned_sequence() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Prefill, &dims, 2, &dir);
    let prep = InputPreparer::new(Arc::clone(&mesh), cfg, dims).unwrap();
    let err = prep.prepare(&random_host([1, 1, 100, 64], 13), 0).unwrap_err();
    match err {
        LayerError::Precondition(msg) => {
            assert!(msg.contains("expected multiple of 128"), "{msg}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(mesh.used(MemorySpace::Dram), vec![0, 0]);
}

#[test]
fn test_unknown_mode() {
    let err = "sideways".parse::<LlmMode>().unwrap_err();
    assert!(matches!(err, LayerError::Config(ref m) if m == "Unknown llm_mode: sideways"));
}

#[test]
fn test_missing_and_corrupt_weights() {
    let dir = TempDir::new().unwrap();
    let dims = small_dims();
    let mesh = mesh(2);
    let cfg = config(LlmMode::Prefill, &dims, 2, &dir);
    let attn = ReferenceAttention::new(&mesh, &dims, &cfg, 1).unwrap();
    let mlp = ReferenceMlp::new(&mesh, &dims, &cfg, 2).unwrap();
    let empty = StateDict::new();
    let err = DecoderLayer::new(
        Arc::clone(&mesh),
        cfg.clone(),
        dims,
        LayerWeights {
            state_dict: &empty,
            base_url: BASE_URL,
            layer_num: 0,
        },
        attn,
        mlp,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LayerError::MissingWeight(ref name) if name == "layers.0.attention_norm.weight"
    ));

    build_layer(&mesh, &cfg, &dims, &norm_state_dict(64, 1), 0);
    let (_, ffn) = norm_weight_names(BASE_URL, 0);
    std::fs::write(weight_cache_path(dir.path(), &ffn, 1, 2), b"not a tensor").unwrap();
    let attn = ReferenceAttention::new(&mesh, &dims, &cfg, 1).unwrap();
    let mlp = ReferenceMlp::new(&mesh, &dims, &cfg, 2).unwrap();
    let err = DecoderLayer::new(
        Arc::clone(&mesh),
        cfg,
        dims,
        LayerWeights {
            state_dict: &empty,
            base_url: BASE_URL,
            layer_num: 0,
        },
        attn,
        mlp,
    )
    .unwrap_err();
    assert!(matches!(err, LayerError::CacheCorruption { .. }));
}
