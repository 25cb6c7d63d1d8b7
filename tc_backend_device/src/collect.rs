//! One release action for the buffers that back a device tensor.
//!
//! A device tensor is three co-located allocations: its data (possibly shared
//! with reshaped views), its shape and its strides. They are freed together,
//! exactly once, whether by an explicit release, by any number of
//! reclamation hooks, or by the last handle going away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DeviceError, Result};
use crate::memory::{MemHandle, MemoryObject};
use crate::refcount::SharedMemory;

/// The buffers of one device tensor.
#[derive(Debug)]
pub struct TensorBuffers {
    pub data: SharedMemory,
    pub shape: MemoryObject,
    pub strides: MemoryObject,
}

#[derive(Debug)]
struct StateInner {
    buffers: TensorBuffers,
    released: AtomicBool,
}

impl StateInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.buffers.data.release();
        self.buffers.shape.close();
        self.buffers.strides.close();
        true
    }
}

impl Drop for StateInner {
    fn drop(&mut self) {
        if self.release() {
            tracing::debug!(shape_buffer = self.buffers.shape.id(), "device tensor state reclaimed on drop");
        }
    }
}

/// Aggregate owner of a tensor's device buffers. Clones share the state.
#[derive(Debug, Clone)]
pub struct CollectableState {
    inner: Arc<StateInner>,
}

impl CollectableState {
    pub fn new(buffers: TensorBuffers) -> Self {
        Self {
            inner: Arc::new(StateInner {
                buffers,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Release every buffer now. Returns true if this call did the work.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// A hook a reclamation mechanism can fire any number of times.
    pub fn hook(&self) -> ReclaimHook {
        ReclaimHook {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn buffers(&self) -> &TensorBuffers {
        &self.inner.buffers
    }

    fn live(&self) -> Result<&TensorBuffers> {
        if self.is_released() {
            return Err(DeviceError::Released(self.inner.buffers.shape.id()));
        }
        Ok(&self.inner.buffers)
    }

    pub fn data(&self) -> Result<MemHandle> {
        self.live()?.data.handle()
    }

    pub fn shape(&self) -> Result<MemHandle> {
        Ok(self.live()?.shape.handle())
    }

    pub fn strides(&self) -> Result<MemHandle> {
        Ok(self.live()?.strides.handle())
    }
}

/// Deferred-reclamation entry point for a [`CollectableState`].
#[derive(Debug, Clone)]
pub struct ReclaimHook {
    inner: Arc<StateInner>,
}

impl ReclaimHook {
    /// Returns true only for the firing that released the buffers.
    pub fn fire(&self) -> bool {
        self.inner.release()
    }
}
