//! Sublayer interfaces the decoder layer drives
//!
//! Attention and feed-forward are pluggable. Both receive the normalized,
//! replicated activation (`hidden` columns on every device) and return
//! per-device outputs with `hidden / N` columns, ready to be added to the
//! residual slice on the same device.

use shardlayer_core::{DeviceMesh, DeviceTensor, LlmMode, Result};

use crate::input::RotationTables;

/// Per-call arguments; only the fields a mode uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A whole prompt for one user
    Prefill { start_pos: usize, user_id: usize },
    /// One token for every user in the batch, all at `start_pos`
    Decode { start_pos: usize },
}

impl Step {
    /// Prefill for user 0
    pub fn prefill(start_pos: usize) -> Self {
        Step::Prefill {
            start_pos,
            user_id: 0,
        }
    }

    pub fn decode(start_pos: usize) -> Self {
        Step::Decode { start_pos }
    }

    pub fn mode(&self) -> LlmMode {
        match self {
            Step::Prefill { .. } => LlmMode::Prefill,
            Step::Decode { .. } => LlmMode::Decode,
        }
    }

    pub fn start_pos(&self) -> usize {
        match *self {
            Step::Prefill { start_pos, .. } | Step::Decode { start_pos } => start_pos,
        }
    }
}

/// Self-attention over the local heads of each device
pub trait Attention: Send + Sync {
    /// `normed` is consumed; `masks[i]` and the rotation tables belong to
    /// device `i`.
    fn forward(
        &self,
        mesh: &DeviceMesh,
        normed: Vec<DeviceTensor>,
        rotation: &RotationTables,
        masks: &[DeviceTensor],
        step: Step,
    ) -> Result<Vec<DeviceTensor>>;
}

/// Position-wise feed-forward network
pub trait FeedForward: Send + Sync {
    fn forward(&self, mesh: &DeviceMesh, normed: Vec<DeviceTensor>) -> Result<Vec<DeviceTensor>>;
}
