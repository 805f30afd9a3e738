//! Tensor-parallel decoder layer
//!
//! One [`DecoderLayer`] runs a single transformer block over N devices. The
//! residual stream arrives sharded along the hidden dimension; before each
//! normalization it is all-gathered so every device normalizes the full
//! activation, and each sublayer hands back a `hidden / N` slice that is
//! added to the residual slice on the same device.
//!
//! # Decode (one token per user)
//!
//! ```text
//! x (L1 sharded) -> sharded_to_interleaved (L1) -> all_gather (L1)
//!   -> interleaved_to_sharded -> rms_norm -> attention -> x += attn
//!   -> sharded_to_interleaved (L1) -> all_gather (L1)
//!   -> interleaved_to_sharded -> rms_norm -> mlp -> x += mlp
//! ```
//!
//! # Prefill (one user, 128-row multiples)
//!
//! ```text
//! x (DRAM) -> clone -> all_gather (DRAM) -> sliced rms_norm (128 rows per chunk)
//!   -> attention -> h = x + attn
//!   -> clone -> all_gather (DRAM) -> sliced rms_norm -> mlp -> out = h + mlp
//! ```
//!
//! Every intermediate is consumed by the stage after it, so a forward call
//! leaves nothing behind in the device pools except its output.

use std::fmt;
use std::sync::Arc;

use shardlayer_core::layout::sharded_to_interleaved;
use shardlayer_core::{
    Communicator, DecoderDims, DeviceMesh, DeviceTensor, LayerConfig, LayerError, LlmMode,
    MemoryConfig, Result,
};

use crate::input::RotationTables;
use crate::norm::{rms_norm_full, sliced_rms_norm, NormParams};
use crate::residual::ResidualAccumulator;
use crate::sublayer::{Attention, FeedForward, Step};
use crate::weight_cache::{NormWeightSpec, NormWeights, StateDict, TensorStore};

/// Where a forward call currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerStage {
    Idle,
    PreparingInput,
    Normalizing,
    Attending,
    Residual1,
    Replicating,
    Normalizing2,
    FeedForwarding,
    Residual2,
    Done,
}

/// Callback told about every stage transition: `(layer_num, stage)`
pub type StageObserver = Arc<dyn Fn(usize, LayerStage) + Send + Sync>;

/// Naming of a layer's weights in the state dict and cache
#[derive(Debug, Clone)]
pub struct LayerWeights<'a> {
    pub state_dict: &'a StateDict,
    /// Prefix of every weight name, e.g. `layers`
    pub base_url: &'a str,
    pub layer_num: usize,
}

/// One decoder block sharded over a device mesh
pub struct DecoderLayer<A, F> {
    mesh: Arc<DeviceMesh>,
    config: LayerConfig,
    dims: DecoderDims,
    layer_num: usize,
    comm: Communicator,
    norms: NormWeights,
    attention: A,
    feed_forward: F,
    observer: Option<StageObserver>,
}

impl<A, F> fmt::Debug for DecoderLayer<A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("layer_num", &self.layer_num)
            .field("mode", &self.config.mode)
            .field("num_devices", &self.mesh.num_devices())
            .field("comm", &self.comm)
            .finish()
    }
}

impl<A: Attention, F: FeedForward> DecoderLayer<A, F> {
    /// Build the layer and load its norm weights onto every device.
    ///
    /// Norm weights come from the cache directory when present, otherwise
    /// from `weights.state_dict`, which then populates the cache.
    pub fn new(
        mesh: Arc<DeviceMesh>,
        config: LayerConfig,
        dims: DecoderDims,
        weights: LayerWeights<'_>,
        attention: A,
        feed_forward: F,
    ) -> Result<Self> {
        let n = mesh.num_devices();
        dims.validate(n)?;
        config.validate()?;
        let comm = Communicator::new(config.all_gather_strategy, config.all_gather_num_links)?;

        let store = TensorStore::new(&config.cache_dir);
        let norms = NormWeights::load_or_build(
            &mesh,
            &store,
            weights.state_dict,
            NormWeightSpec {
                base_url: weights.base_url,
                layer_num: weights.layer_num,
                hidden_size: dims.hidden_size,
                attention_dtype: config.ln_attn_weights_dtype,
                ffn_dtype: config.ln_mlp_weights_dtype,
                memory: config.dram,
            },
        )?;

        tracing::info!(
            layer = weights.layer_num,
            mode = %config.mode,
            num_devices = n,
            strategy = ?config.all_gather_strategy,
            "decoder layer ready"
        );

        Ok(Self {
            mesh,
            config,
            dims,
            layer_num: weights.layer_num,
            comm,
            norms,
            attention,
            feed_forward,
            observer: None,
        })
    }

    pub fn with_stage_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn layer_num(&self) -> usize {
        self.layer_num
    }

    pub fn norms(&self) -> &NormWeights {
        &self.norms
    }

    pub fn attention(&self) -> &A {
        &self.attention
    }

    pub fn feed_forward(&self) -> &F {
        &self.feed_forward
    }

    fn enter(&self, stage: LayerStage) {
        tracing::debug!(layer = self.layer_num, ?stage, "stage");
        if let Some(observer) = &self.observer {
            observer(self.layer_num, stage);
        }
    }

    fn norm_params(&self) -> NormParams {
        NormParams {
            eps: self.dims.norm_eps,
            out_dtype: self.config.ln_output_dtype,
            compute: self.config.ln_compute,
        }
    }

    /// Run the layer over `xs`, one activation slice per device.
    ///
    /// `step` must match the configured mode. Returns new slices with the
    /// same shapes as the input.
    pub fn forward(
        &self,
        xs: Vec<DeviceTensor>,
        rotation: &RotationTables,
        masks: &[DeviceTensor],
        step: Step,
    ) -> Result<Vec<DeviceTensor>> {
        self.enter(LayerStage::Idle);
        if step.mode() != self.config.mode || rotation.mode() != self.config.mode {
            return Err(LayerError::Config(format!(
                "layer {} is configured for {}, called with a {} step and {} tables",
                self.layer_num,
                self.config.mode,
                step.mode(),
                rotation.mode()
            )));
        }

        let n = self.mesh.num_devices();
        if xs.len() != n || masks.len() != n {
            return Err(LayerError::Precondition(format!(
                "expected {n} activation and mask shards, got {} and {}",
                xs.len(),
                masks.len()
            )));
        }
        let shape = xs[0].shape();
        if shape[3] != self.dims.hidden_per_device(n) {
            return Err(LayerError::Precondition(format!(
                "activation slices must have {} columns, got {}",
                self.dims.hidden_per_device(n),
                shape[3]
            )));
        }
        if let Some(bad) = xs.iter().find(|x| x.shape() != shape) {
            return Err(LayerError::shape_mismatch(&shape, &bad.shape()));
        }

        let out = match self.config.mode {
            LlmMode::Decode => self.forward_decode(xs, rotation, masks, step)?,
            LlmMode::Prefill => self.forward_prefill(xs, rotation, masks, step)?,
        };
        self.enter(LayerStage::Done);
        Ok(out)
    }

    /// Interleave the residual and all-gather it into fast memory
    fn decode_replicated(&self, residual: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let l1 = self.config.l1;
        let interleaved = self.mesh.dispatch(
            "sharded_to_interleaved",
            residual.iter().collect::<Vec<_>>(),
            |_, x| sharded_to_interleaved(x, l1),
        )?;
        self.comm
            .all_gather(&self.mesh, interleaved, self.config.all_gather_output)
    }

    /// Reshard the gathered residual and normalize it
    fn decode_normed(
        &self,
        gathered: Vec<DeviceTensor>,
        weights: &[DeviceTensor],
        output: MemoryConfig,
    ) -> Result<Vec<DeviceTensor>> {
        rms_norm_full(
            &self.mesh,
            gathered,
            weights,
            self.config.all_gather_sharded,
            output,
            self.norm_params(),
        )
    }

    fn forward_decode(
        &self,
        xs: Vec<DeviceTensor>,
        rotation: &RotationTables,
        masks: &[DeviceTensor],
        step: Step,
    ) -> Result<Vec<DeviceTensor>> {
        let acc = ResidualAccumulator::new(&self.mesh);
        let mut residual = xs;

        self.enter(LayerStage::PreparingInput);
        if let Some(x) = residual
            .iter()
            .find(|x| x.memory_config() != &self.config.word_embedding_output)
        {
            return Err(LayerError::Precondition(format!(
                "decode input on device {} must be in the word-embedding placement",
                x.device_id()
            )));
        }
        let gathered = self.decode_replicated(&residual)?;

        self.enter(LayerStage::Normalizing);
        let normed =
            self.decode_normed(gathered, &self.norms.attention, self.config.ln_attn_output)?;

        self.enter(LayerStage::Attending);
        let attn_outs = self
            .attention
            .forward(&self.mesh, normed, rotation, masks, step)?;

        self.enter(LayerStage::Residual1);
        acc.add_in_place(&mut residual, attn_outs, &self.config.attn_add_output)?;

        self.enter(LayerStage::Replicating);
        let gathered = self.decode_replicated(&residual)?;

        self.enter(LayerStage::Normalizing2);
        let normed = self.decode_normed(gathered, &self.norms.ffn, self.config.ln_mlp_output)?;

        self.enter(LayerStage::FeedForwarding);
        let mlp_outs = self.feed_forward.forward(&self.mesh, normed)?;

        self.enter(LayerStage::Residual2);
        acc.add_in_place(&mut residual, mlp_outs, &self.config.mlp_add_output)?;
        Ok(residual)
    }

    /// Clone the residual and all-gather the copy into DRAM
    fn prefill_replicated(&self, residual: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let dram = self.config.dram;
        let copies = self
            .mesh
            .dispatch("clone", residual.iter().collect::<Vec<_>>(), |_, x| {
                x.to_memory(dram)
            })?;
        self.comm
            .all_gather(&self.mesh, copies, self.config.all_gather_output)
    }

    fn forward_prefill(
        &self,
        xs: Vec<DeviceTensor>,
        rotation: &RotationTables,
        masks: &[DeviceTensor],
        step: Step,
    ) -> Result<Vec<DeviceTensor>> {
        let acc = ResidualAccumulator::new(&self.mesh);
        let grid = self.config.layernorm.grid();
        let dtype = self.config.activation_dtype;

        self.enter(LayerStage::PreparingInput);
        let gathered = self.prefill_replicated(&xs)?;

        self.enter(LayerStage::Normalizing);
        let normed = sliced_rms_norm(
            &self.mesh,
            gathered,
            &self.norms.attention,
            grid,
            self.config.ln_attn_output,
            self.norm_params(),
        )?;

        self.enter(LayerStage::Attending);
        let attn_outs = self
            .attention
            .forward(&self.mesh, normed, rotation, masks, step)?;

        self.enter(LayerStage::Residual1);
        let hidden = acc.add(xs, attn_outs, self.config.attn_add_output, dtype)?;

        self.enter(LayerStage::Replicating);
        let gathered = self.prefill_replicated(&hidden)?;

        self.enter(LayerStage::Normalizing2);
        let normed = sliced_rms_norm(
            &self.mesh,
            gathered,
            &self.norms.ffn,
            grid,
            self.config.ln_mlp_output,
            self.norm_params(),
        )?;

        self.enter(LayerStage::FeedForwarding);
        let mlp_outs = self.feed_forward.forward(&self.mesh, normed)?;

        self.enter(LayerStage::Residual2);
        acc.add(hidden, mlp_outs, self.config.mlp_add_output, dtype)
    }
}
