//! Residual accumulation
//!
//! The accumulator takes ownership of each sublayer output and releases it
//! as soon as it has been added. The residual stream itself stays with the
//! caller.

use shardlayer_core::kernel::{add, add_in_place};
use shardlayer_core::{DType, DeviceMesh, DeviceTensor, LayerError, MemoryConfig, Result};

#[derive(Debug, Clone, Copy)]
pub struct ResidualAccumulator<'a> {
    mesh: &'a DeviceMesh,
}

impl<'a> ResidualAccumulator<'a> {
    pub fn new(mesh: &'a DeviceMesh) -> Self {
        Self { mesh }
    }

    fn check_counts(&self, residual: usize, outputs: usize) -> Result<()> {
        let n = self.mesh.num_devices();
        if residual != n || outputs != n {
            return Err(LayerError::Precondition(format!(
                "residual add needs {n} shards on each side, got {residual} and {outputs}"
            )));
        }
        Ok(())
    }

    /// `residual += outputs` on the residual's own storage.
    ///
    /// The residual must already sit in `expected`; the outputs are consumed.
    pub fn add_in_place(
        &self,
        residual: &mut [DeviceTensor],
        outputs: Vec<DeviceTensor>,
        expected: &MemoryConfig,
    ) -> Result<()> {
        self.check_counts(residual.len(), outputs.len())?;
        if let Some(r) = residual.iter().find(|r| r.memory_config() != expected) {
            return Err(LayerError::Config(format!(
                "in-place residual on device {} is {:?}/{}, configured {:?}/{}",
                r.device_id(),
                r.memory_config().layout,
                r.memory_config().space,
                expected.layout,
                expected.space
            )));
        }
        let pairs: Vec<(&mut DeviceTensor, DeviceTensor)> =
            residual.iter_mut().zip(outputs).collect();
        self.mesh.dispatch("residual_add_in_place", pairs, |_, (r, out)| {
            add_in_place(r, &out)
        })?;
        Ok(())
    }

    /// `residual + outputs` into new tensors placed with `output`.
    ///
    /// Consumes both the old residual and the outputs.
    pub fn add(
        &self,
        residual: Vec<DeviceTensor>,
        outputs: Vec<DeviceTensor>,
        output: MemoryConfig,
        dtype: DType,
    ) -> Result<Vec<DeviceTensor>> {
        self.check_counts(residual.len(), outputs.len())?;
        let pairs: Vec<(DeviceTensor, DeviceTensor)> = residual.into_iter().zip(outputs).collect();
        self.mesh.dispatch("residual_add", pairs, |_, (r, out)| {
            add(&r, &out, output, dtype)
        })
    }
}
