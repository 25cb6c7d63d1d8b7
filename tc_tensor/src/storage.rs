//! Where a tensor's elements live.

use std::fmt;
use std::sync::Arc;

use tc_backend_device::{
    CollectableState, Device, KernelLaunch, MemHandle, MemoryObject, NdRange, ReclaimHook, Runtime, SharedMemory, TensorBuffers,
};

use crate::device_kernels;
use crate::error::{Result, TensorError};
use crate::shape::Shape;

/// Element storage of a tensor.
///
/// Host buffers are shared copy-on-write: cloning a tensor never copies, and
/// the first mutation through a shared handle detaches it. Device buffers
/// are reached only through kernels and explicit transfers.
#[derive(Clone)]
pub enum Storage {
    Host(Arc<Vec<f32>>),
    Device(DeviceStorage),
}

impl Storage {
    pub fn host(data: Vec<f32>) -> Self {
        Storage::Host(Arc::new(data))
    }

    /// `"host"` or the device name.
    pub fn placement(&self) -> String {
        match self {
            Storage::Host(_) => "host".to_string(),
            Storage::Device(d) => d.device.name().to_string(),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Host(data) => write!(f, "Host(len={})", data.len()),
            Storage::Device(d) => f
                .debug_struct("Device")
                .field("device", &d.device.name())
                .field("released", &d.state.is_released())
                .finish(),
        }
    }
}

pub(crate) fn placement_mismatch(op: &'static str, lhs: &Storage, rhs: &Storage) -> TensorError {
    TensorError::PlacementMismatch {
        op,
        lhs: lhs.placement(),
        rhs: rhs.placement(),
    }
}

pub(crate) fn dims_u32(dims: &[usize]) -> Vec<u32> {
    dims.iter()
        .map(|&d| {
            debug_assert!(d <= u32::MAX as usize);
            d as u32
        })
        .collect()
}

/// A tensor's buffers on one device: data, shape and strides, released
/// together exactly once.
#[derive(Clone)]
pub struct DeviceStorage {
    runtime: Arc<Runtime>,
    device: Device,
    state: CollectableState,
}

impl DeviceStorage {
    /// Upload `data` with the given shape. Installs the built-in kernels on
    /// the device the first time it is used.
    pub(crate) fn upload(runtime: &Arc<Runtime>, device: &Device, data: &[f32], shape: &Shape) -> Result<Self> {
        device_kernels::ensure_installed(runtime, device)?;
        let data = SharedMemory::new(device.upload_f32(data)?);
        Self::with_data(runtime, device, data, shape)
    }

    /// A zero-filled tensor on the same device as `self`.
    pub(crate) fn zeros(&self, shape: &Shape) -> Result<Self> {
        let data = SharedMemory::new(self.device.alloc_f32(shape.elements())?);
        Self::with_data(&self.runtime, &self.device, data, shape)
    }

    fn with_data(runtime: &Arc<Runtime>, device: &Device, data: SharedMemory, shape: &Shape) -> Result<Self> {
        let shape_buf = device.upload_u32(&dims_u32(shape.dims()))?;
        let strides_buf = device.upload_u32(&dims_u32(shape.contiguous_strides().as_slice()))?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            device: device.clone(),
            state: CollectableState::new(TensorBuffers {
                data,
                shape: shape_buf,
                strides: strides_buf,
            }),
        })
    }

    /// Same data under a different shape. The data buffer gains a holder.
    pub(crate) fn view(&self, shape: &Shape) -> Result<Self> {
        self.state.data()?;
        let data = self.state.buffers().data.share();
        match Self::with_data(&self.runtime, &self.device, data.clone(), shape) {
            Ok(view) => Ok(view),
            Err(err) => {
                data.release();
                Err(err)
            }
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn data(&self) -> Result<MemHandle> {
        Ok(self.state.data()?)
    }

    pub(crate) fn shape_buf(&self) -> Result<MemHandle> {
        Ok(self.state.shape()?)
    }

    /// A scratch `u32` buffer on this device, for index arguments.
    pub(crate) fn upload_indices(&self, values: &[usize]) -> Result<MemoryObject> {
        Ok(self.device.upload_u32(&dims_u32(values))?)
    }

    pub(crate) fn read(&self) -> Result<Vec<f32>> {
        Ok(self.data()?.read_f32()?)
    }

    pub(crate) fn release(&self) -> bool {
        self.state.release()
    }

    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    /// Entry point for deferred reclamation of these buffers.
    pub fn reclaim_hook(&self) -> ReclaimHook {
        self.state.hook()
    }

    /// Both operands must be on the same device.
    pub(crate) fn check_same(&self, op: &'static str, other: &DeviceStorage) -> Result<()> {
        if self.device != other.device {
            return Err(TensorError::PlacementMismatch {
                op,
                lhs: self.device.name().to_string(),
                rhs: other.device.name().to_string(),
            });
        }
        Ok(())
    }

    /// Run one built-in kernel on the calling thread's queue and wait for it.
    pub(crate) fn launch<F>(&self, kernel: &str, range: NdRange, bind: F) -> Result<()>
    where
        F: FnOnce(KernelLaunch) -> Result<KernelLaunch>,
    {
        let compiled = self.runtime.kernel(&self.device, kernel)?;
        let queue = self.device.thread_queue()?;
        tracing::trace!(kernel, device = self.device.name(), queue = queue.id(), "launch");
        bind(KernelLaunch::new(&compiled))?.submit(&queue, range)?;
        queue.finish()?;
        Ok(())
    }
}
