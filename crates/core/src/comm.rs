//! Collective communication across the device mesh
//!
//! The decoder layer needs one collective: **all-gather** along the hidden
//! dimension, turning N interleaved slices `[.., hidden/N]` into N identical
//! replicas `[.., hidden]` ahead of each normalization.
//!
//! Two strategies produce bit-identical results:
//!
//! | Strategy      | Data path |
//! |---------------|-----------|
//! | `DeviceLink`  | ring over device links, N-1 steps, each chunk striped over `num_links` |
//! | `Emulated`    | copy every slice to the host, concatenate, upload to every device |
//!
//! ```text
//! step 0:  d0 -> d1 : c0     d1 -> d2 : c1   ...   d(N-1) -> d0 : c(N-1)
//! step 1:  d0 -> d1 : c(N-1) d1 -> d2 : c0   ...
//! ...
//! after N-1 steps every device holds c0..c(N-1)
//! ```
//!
//! Every collective is a barrier: all N devices must contribute a slice, in
//! device order, or the call fails with a synchronization error and no
//! output is produced.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceMesh, DeviceTensor};
use crate::error::{LayerError, Result};
use crate::parallel::concat_column_data;
use crate::tensor::MemoryConfig;

/// How the all-gather moves data between devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllGatherStrategy {
    /// Device-to-device ring over physical links
    #[default]
    DeviceLink,
    /// Host-mediated gather and redistribute
    Emulated,
}

/// Executes collectives on a mesh
#[derive(Debug, Clone, Copy)]
pub struct Communicator {
    strategy: AllGatherStrategy,
    num_links: usize,
}

impl Communicator {
    pub fn new(strategy: AllGatherStrategy, num_links: usize) -> Result<Self> {
        if num_links == 0 {
            return Err(LayerError::Config(
                "all-gather needs at least one link".to_string(),
            ));
        }
        Ok(Self {
            strategy,
            num_links,
        })
    }

    pub fn strategy(&self) -> AllGatherStrategy {
        self.strategy
    }

    pub fn num_links(&self) -> usize {
        self.num_links
    }

    /// Gather `shards` along the last dim onto every device.
    ///
    /// Consumes the input slices. The output replicas are placed with
    /// `output`, which must be interleaved.
    pub fn all_gather(
        &self,
        mesh: &DeviceMesh,
        shards: Vec<DeviceTensor>,
        output: MemoryConfig,
    ) -> Result<Vec<DeviceTensor>> {
        let n = mesh.num_devices();
        check_participation(n, &shards)?;
        if output.is_sharded() {
            return Err(LayerError::Config(format!(
                "all_gather output must be interleaved, got {:?}",
                output.layout
            )));
        }

        let first = &shards[0];
        let [a, b, c, width] = first.shape();
        let rows = first.rows();
        let dtype = first.dtype();
        let out_shape = [a, b, c, width * n];

        tracing::debug!(
            strategy = ?self.strategy,
            num_devices = n,
            bytes_per_shard = first.size_bytes(),
            "all_gather"
        );

        let chunks: Vec<Vec<f32>> = match self.strategy {
            AllGatherStrategy::DeviceLink => self.ring_gather(&shards)?,
            AllGatherStrategy::Emulated => {
                let host: Vec<&[f32]> = shards.iter().map(DeviceTensor::data).collect();
                let gathered = concat_column_data(&host, rows, width);
                vec![gathered; n]
            }
        };

        let out = mesh.dispatch("all_gather", chunks, |device, data| {
            DeviceTensor::from_data(device, out_shape, dtype, data, output)
        })?;
        drop(shards);
        Ok(out)
    }

    /// Ring all-gather; returns the gathered payload for each device
    fn ring_gather(&self, shards: &[DeviceTensor]) -> Result<Vec<Vec<f32>>> {
        let n = shards.len();
        let rows = shards[0].rows();
        let width = shards[0].cols();

        // slots[d][k] holds chunk k once device d has received it
        let mut slots: Vec<Vec<Option<Vec<f32>>>> = shards
            .iter()
            .enumerate()
            .map(|(d, shard)| {
                let mut row = vec![None; n];
                row[d] = Some(shard.data().to_vec());
                row
            })
            .collect();

        for step in 0..n.saturating_sub(1) {
            // Every device forwards the chunk it received last step
            let outgoing: Vec<(usize, Vec<Vec<f32>>)> = slots
                .par_iter()
                .enumerate()
                .map(|(d, held)| {
                    let k = (d + n - step) % n;
                    let chunk = held[k].as_deref().ok_or_else(|| LayerError::Synchronization {
                        op: "all_gather",
                        reason: format!("device {d} is missing chunk {k} at ring step {step}"),
                    })?;
                    Ok((k, self.stripe(chunk)))
                })
                .collect::<Result<_>>()?;

            for (d, (k, links)) in outgoing.into_iter().enumerate() {
                let next = (d + 1) % n;
                slots[next][k] = Some(links.concat());
            }
            tracing::trace!(step, "ring step complete");
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(d, held)| {
                let chunks = held
                    .into_iter()
                    .enumerate()
                    .map(|(k, chunk)| {
                        chunk.ok_or_else(|| LayerError::Synchronization {
                            op: "all_gather",
                            reason: format!("device {d} never received chunk {k}"),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let parts: Vec<&[f32]> = chunks.iter().map(Vec::as_slice).collect();
                Ok(concat_column_data(&parts, rows, width))
            })
            .collect()
    }

    /// Split one chunk transfer across the configured links
    fn stripe(&self, chunk: &[f32]) -> Vec<Vec<f32>> {
        let per_link = chunk.len().div_ceil(self.num_links).max(1);
        chunk.chunks(per_link).map(<[f32]>::to_vec).collect()
    }
}

/// All N devices contribute one slice each, in device order, with identical
/// shape and tag.
fn check_participation(n: usize, shards: &[DeviceTensor]) -> Result<()> {
    if shards.len() != n {
        return Err(LayerError::Synchronization {
            op: "all_gather",
            reason: format!("expected {} participating devices, got {}", n, shards.len()),
        });
    }
    for (i, shard) in shards.iter().enumerate() {
        if shard.device_id() != i {
            return Err(LayerError::Synchronization {
                op: "all_gather",
                reason: format!("slot {} holds a slice from device {}", i, shard.device_id()),
            });
        }
    }
    let first = &shards[0];
    for shard in shards {
        if shard.is_sharded() {
            return Err(LayerError::Precondition(
                "all_gather input must be interleaved".to_string(),
            ));
        }
        if shard.shape() != first.shape() {
            return Err(LayerError::shape_mismatch(&first.shape(), &shard.shape()));
        }
        if shard.dtype() != first.dtype()
            || shard.memory_config().space != first.memory_config().space
        {
            return Err(LayerError::Precondition(format!(
                "all_gather slices disagree: device {} is {:?}/{}, device 0 is {:?}/{}",
                shard.device_id(),
                shard.dtype(),
                shard.memory_config().space,
                first.dtype(),
                first.memory_config().space
            )));
        }
    }
    Ok(())
}
