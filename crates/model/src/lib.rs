//! Tensor-parallel decoder layer
//!
//! This crate provides:
//! - [`DecoderLayer`]: one transformer block over N devices, in prefill or
//!   decode mode
//! - [`InputPreparer`]: sharded activations, rotary tables and attention
//!   masks, cached on disk and in memory
//! - Chunked RMS normalization for long prefill sequences
//! - Residual accumulation with explicit buffer release
//! - Norm weight caching keyed by layer and device
//! - Dense reference attention and feed-forward sublayers

pub mod decoder;
pub mod input;
pub mod kv_cache;
pub mod norm;
pub mod reference;
pub mod residual;
pub mod rope;
pub mod sublayer;
pub mod weight_cache;

pub use decoder::{DecoderLayer, LayerStage, LayerWeights, StageObserver};
pub use input::{InputPreparer, PreparedInputs, RotationTables, TensorCache};
pub use kv_cache::KvCache;
pub use norm::{NormParams, SlicePlan};
pub use reference::{ReferenceAttention, ReferenceMlp};
pub use residual::ResidualAccumulator;
pub use rope::RopeFrequencies;
pub use sublayer::{Attention, FeedForward, Step};
pub use weight_cache::{NormWeights, StateDict, TensorStore};

pub use shardlayer_core::{LayerError, Result};
