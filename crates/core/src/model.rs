//! Decoder-layer dimensions

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::tensor::TILE;

/// Shape parameters of one decoder layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecoderDims {
    /// Hidden dimension
    pub hidden_size: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Intermediate (FFN) dimension
    pub intermediate_size: usize,
    /// Maximum sequence length
    pub max_seq_len: usize,
    /// Maximum users per decode step
    pub max_batch_size: usize,
    /// RMS norm epsilon
    pub norm_eps: f32,
    /// RoPE theta base
    pub rope_theta: f32,
}

impl DecoderDims {
    /// Llama 2 70B
    pub fn llama2_70b() -> Self {
        Self {
            hidden_size: 8192,
            n_heads: 64,
            intermediate_size: 28672,
            max_seq_len: 4096,
            max_batch_size: 32,
            norm_eps: 1e-5,
            rope_theta: 10000.0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    /// Heads owned by each of `num_devices` devices
    pub fn local_heads(&self, num_devices: usize) -> usize {
        self.n_heads / num_devices
    }

    /// Columns of an activation slice on one device
    pub fn hidden_per_device(&self, num_devices: usize) -> usize {
        self.hidden_size / num_devices
    }

    /// Check the dims can be split over `num_devices`
    pub fn validate(&self, num_devices: usize) -> Result<()> {
        if num_devices == 0 {
            return Err(LayerError::Config("num_devices must be positive".to_string()));
        }
        if self.hidden_size == 0 || self.hidden_size % TILE != 0 {
            return Err(LayerError::Config(format!(
                "hidden size {} must be a positive multiple of {TILE}",
                self.hidden_size
            )));
        }
        if self.hidden_size % num_devices != 0 || self.n_heads % num_devices != 0 {
            return Err(LayerError::Config(format!(
                "hidden size {} and {} heads must both divide over {} devices",
                self.hidden_size, self.n_heads, num_devices
            )));
        }
        if self.n_heads == 0 || self.hidden_size % self.n_heads != 0 || self.head_dim() % 2 != 0 {
            return Err(LayerError::Config(format!(
                "head dim of {} / {} must be an even integer",
                self.hidden_size, self.n_heads
            )));
        }
        if self.intermediate_size % num_devices != 0 {
            return Err(LayerError::Config(format!(
                "intermediate size {} must divide over {} devices",
                self.intermediate_size, num_devices
            )));
        }
        if self.max_batch_size == 0 || self.max_seq_len == 0 {
            return Err(LayerError::Config(
                "max_batch_size and max_seq_len must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
