//! # tc_backend_device - Simulated Accelerator
//!
//! Devices with bounded memory, ordered command queues backed by worker
//! threads, and kernel programs looked up by name in a session registry.
//! Device memory is only reachable through explicit reads and writes, and
//! every allocation is freed exactly once.
//!
//! ## Overview
//!
//! - [`Runtime`] - session owning the [`Device`]s and the [`KernelRegistry`]
//! - [`CommandQueue`] - ordered execution; [`CommandQueue::finish`] is the sync point
//! - [`MemoryObject`] - single-owner allocation, closed exactly once
//! - [`RefCounted`] - shared resource freed when the last holder releases
//! - [`CollectableState`] - a device tensor's buffers behind one release action
//! - [`KernelLaunch`] - positional argument builder submitting over an [`NdRange`]
//!
//! ## Example
//!
//! ```ignore
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let device = runtime.default_device()?;
//! runtime.register(device, "fill", FillProgram)?;
//!
//! let out = device.alloc_f32(16)?;
//! let queue = device.thread_queue()?;
//! KernelLaunch::new(&runtime.kernel(device, "fill")?)
//!     .arg_mem(out.handle())
//!     .arg_float(1.0)
//!     .submit(&queue, NdRange::d1(16))?;
//! queue.finish()?;
//! assert_eq!(out.read_f32()?, vec![1.0; 16]);
//! ```

pub mod collect;
pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod queue;
pub mod refcount;
pub mod runtime;
mod sync;

pub use collect::{CollectableState, ReclaimHook, TensorBuffers};
pub use config::RuntimeConfig;
pub use device::{Device, DeviceId, QueueLease};
pub use error::{DeviceError, Result};
pub use kernel::{CompiledKernel, KernelProgram, KernelRegistry, ParamKind};
pub use launch::{KernelArg, KernelArgs, KernelLaunch, NdRange};
pub use memory::{MemHandle, MemoryObject, MemoryStats};
pub use queue::CommandQueue;
pub use refcount::{RefCounted, Release, SharedMemory};
pub use runtime::Runtime;
