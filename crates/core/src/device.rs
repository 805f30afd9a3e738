//! Emulated devices, the device mesh, and device-resident tensors
//!
//! A [`DeviceMesh`] is the ordered set of N devices one model instance runs
//! on. Stage work is submitted per device with [`DeviceMesh::dispatch`]; the
//! call returns only once every device task has finished, so each dispatch is
//! a join point.
//!
//! Device tensors hold their payload on the host but charge their bytes to
//! the owning device's pool for as long as they live.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{LayerError, Result};
use crate::memory::{Allocation, DevicePool, MemoryBudget};
use crate::parallel::{concat_columns, split_columns};
use crate::tensor::{offset, DType, HostTensor, MemoryConfig, MemorySpace, ShardSpec};

/// Handle to one emulated accelerator
#[derive(Clone)]
pub struct Device {
    device_id: usize,
    pool: Arc<DevicePool>,
}

impl Device {
    pub fn new(device_id: usize, budget: MemoryBudget) -> Self {
        Self {
            device_id,
            pool: Arc::new(DevicePool::new(device_id, budget)),
        }
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Ordered set of devices, fixed for the lifetime of a model instance
pub struct DeviceMesh {
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(num_devices: usize, budget: MemoryBudget) -> Result<Self> {
        if num_devices == 0 {
            return Err(LayerError::Config(
                "device mesh needs at least one device".to_string(),
            ));
        }
        let devices = (0..num_devices).map(|i| Device::new(i, budget)).collect();
        Ok(Self { devices })
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, idx: usize) -> Result<&Device> {
        self.devices.get(idx).ok_or_else(|| {
            LayerError::Precondition(format!(
                "device index {} out of bounds (num_devices={})",
                idx,
                self.devices.len()
            ))
        })
    }

    /// Run `f` once per device with that device's input, concurrently.
    ///
    /// `inputs[i]` goes to device `i`. Results come back in device order.
    /// Any device error fails the whole stage.
    pub fn dispatch<T, R, F>(&self, op: &'static str, inputs: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(&Device, T) -> Result<R> + Sync + Send,
    {
        if inputs.len() != self.devices.len() {
            return Err(LayerError::Synchronization {
                op,
                reason: format!(
                    "{} inputs for {} devices",
                    inputs.len(),
                    self.devices.len()
                ),
            });
        }
        tracing::trace!(op, num_devices = self.devices.len(), "dispatch");
        inputs
            .into_par_iter()
            .zip(self.devices.par_iter())
            .map(|(input, device)| f(device, input))
            .collect()
    }

    /// Run `f` once per device with no per-device input
    pub fn dispatch_each<R, F>(&self, op: &'static str, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&Device) -> Result<R> + Sync + Send,
    {
        tracing::trace!(op, num_devices = self.devices.len(), "dispatch");
        self.devices.par_iter().map(f).collect()
    }

    /// Place an identical copy of `host` on every device
    pub fn replicate(&self, host: &HostTensor, memory: MemoryConfig) -> Result<Vec<DeviceTensor>> {
        self.dispatch_each("replicate", |device| {
            DeviceTensor::from_host(device, host, memory)
        })
    }

    /// Split `host` along its last dim into N contiguous slices, one per device
    pub fn shard_columns(
        &self,
        host: &HostTensor,
        memory: MemoryConfig,
    ) -> Result<Vec<DeviceTensor>> {
        let slices = split_columns(host, self.devices.len())?;
        self.dispatch("shard_columns", slices, |device, slice| {
            DeviceTensor::from_host(device, &slice, memory)
        })
    }

    /// Read sharded tensors back and join them along the last dim
    pub fn gather_to_host(&self, shards: &[DeviceTensor]) -> Result<HostTensor> {
        let hosts: Vec<HostTensor> = shards.iter().map(DeviceTensor::to_host).collect();
        concat_columns(&hosts)
    }

    /// Bytes in use in `space`, per device
    pub fn used(&self, space: MemorySpace) -> Vec<usize> {
        self.devices.iter().map(|d| d.pool.used(space)).collect()
    }

    /// High-water mark of `space`, per device
    pub fn peak(&self, space: MemorySpace) -> Vec<usize> {
        self.devices.iter().map(|d| d.pool.peak(space)).collect()
    }

    pub fn reset_peak(&self, space: MemorySpace) {
        for device in &self.devices {
            device.pool.reset_peak(space);
        }
    }
}

impl fmt::Debug for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMesh")
            .field("num_devices", &self.devices.len())
            .finish()
    }
}

/// Tensor resident on one device
///
/// The payload is kept rounded to `dtype`. Dropping the tensor (or passing it
/// to an operation that consumes it) returns its bytes to the device pool.
pub struct DeviceTensor {
    shape: [usize; 4],
    dtype: DType,
    memory: MemoryConfig,
    shard: Option<ShardSpec>,
    data: Vec<f32>,
    device: Device,
    allocation: Allocation,
}

impl DeviceTensor {
    /// Build a tensor from raw values, rounding them to `dtype`
    pub fn from_data(
        device: &Device,
        shape: [usize; 4],
        dtype: DType,
        mut data: Vec<f32>,
        memory: MemoryConfig,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(LayerError::Precondition(format!(
                "tensor of shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        let rows = shape[0] * shape[1] * shape[2];
        let shard = memory.resolve_shard(rows, shape[3])?;
        let allocation = device
            .pool
            .allocate(memory.space, numel * dtype.size_bytes())?;
        dtype.round_slice(&mut data);
        Ok(Self {
            shape,
            dtype,
            memory,
            shard,
            data,
            device: device.clone(),
            allocation,
        })
    }

    /// Upload a host tensor
    pub fn from_host(device: &Device, host: &HostTensor, memory: MemoryConfig) -> Result<Self> {
        Self::from_data(
            device,
            host.shape(),
            host.dtype(),
            host.data().to_vec(),
            memory,
        )
    }

    pub fn zeros(
        device: &Device,
        shape: [usize; 4],
        dtype: DType,
        memory: MemoryConfig,
    ) -> Result<Self> {
        Self::from_data(device, shape, dtype, vec![0.0; shape.iter().product()], memory)
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn memory_config(&self) -> &MemoryConfig {
        &self.memory
    }

    pub fn shard_spec(&self) -> Option<&ShardSpec> {
        self.shard.as_ref()
    }

    pub fn is_sharded(&self) -> bool {
        self.shard.is_some()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_id(&self) -> usize {
        self.device.device_id
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable payload; callers must write values already rounded to `dtype`
    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn rows(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    pub fn cols(&self) -> usize {
        self.shape[3]
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.allocation.bytes()
    }

    pub fn get(&self, idx: [usize; 4]) -> f32 {
        self.data[offset(&self.shape, idx)]
    }

    /// Row `r` of the flattened 2-D view
    pub fn row(&self, r: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[r * cols..(r + 1) * cols]
    }

    /// Copy back to the host
    pub fn to_host(&self) -> HostTensor {
        HostTensor::from_fn(self.shape, self.dtype, |idx| self.get(idx))
    }

    /// Copy to a new placement on the same device
    pub fn to_memory(&self, memory: MemoryConfig) -> Result<Self> {
        Self::from_data(&self.device, self.shape, self.dtype, self.data.clone(), memory)
    }

    /// Copy with a different element type and placement
    pub fn to_dtype(&self, dtype: DType, memory: MemoryConfig) -> Result<Self> {
        Self::from_data(&self.device, self.shape, dtype, self.data.clone(), memory)
    }

    /// Reinterpret with a new shape of the same element count.
    ///
    /// Only interleaved tensors can be reshaped; a shard spec is tied to the
    /// 2-D view it was resolved against.
    pub fn reshape(mut self, shape: [usize; 4]) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(LayerError::shape_mismatch(&self.shape, &shape));
        }
        if self.is_sharded() {
            return Err(LayerError::Precondition(
                "cannot reshape a sharded tensor".to_string(),
            ));
        }
        self.shape = shape;
        Ok(self)
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("device_id", &self.device.device_id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("layout", &self.memory.layout)
            .field("space", &self.memory.space)
            .finish()
    }
}
