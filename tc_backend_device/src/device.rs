//! Simulated accelerator devices.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::error::Result;
use crate::memory::{MemoryObject, MemoryPool, MemoryStats, Payload};
use crate::queue::CommandQueue;
use crate::sync::lock;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Identity of a device. Devices of different runtimes never compare equal,
/// even at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    serial: u64,
    index: usize,
}

impl DeviceId {
    /// Position within the owning runtime.
    pub fn index(&self) -> usize {
        self.index
    }
}

struct DeviceInner {
    id: DeviceId,
    name: String,
    pool: Arc<MemoryPool>,
    thread_queues: Mutex<HashMap<ThreadId, CommandQueue>>,
}

/// One compute unit. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl Device {
    pub(crate) fn new(index: usize, name: String, capacity: usize) -> Self {
        tracing::debug!(device = %name, capacity, "device up");
        Self {
            inner: Arc::new(DeviceInner {
                id: DeviceId {
                    serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                    index,
                },
                pool: Arc::new(MemoryPool::new(name.clone(), capacity)),
                name,
                thread_queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A fresh queue, owned by the caller.
    pub fn new_command_queue(&self) -> Result<CommandQueue> {
        CommandQueue::spawn(&self.inner.name)
    }

    /// The calling thread's queue on this device.
    ///
    /// If the thread has none, one is created and the returned lease owns
    /// it: dropping the lease closes the queue. Nested acquisitions on the
    /// same thread borrow the outer lease's queue. If that queue was closed
    /// to cancel its pending work, it is replaced by a fresh one that the
    /// outer lease then owns.
    pub fn thread_queue(&self) -> Result<QueueLease> {
        let tid = thread::current().id();
        let mut queues = lock(&self.inner.thread_queues);
        if let Some(queue) = queues.get_mut(&tid) {
            if queue.is_closed() {
                tracing::debug!(device = %self.inner.name, closed = queue.id(), "replacing closed thread queue");
                *queue = CommandQueue::spawn(&self.inner.name)?;
            }
            return Ok(QueueLease {
                queue: queue.clone(),
                owner: None,
            });
        }
        let queue = CommandQueue::spawn(&self.inner.name)?;
        queues.insert(tid, queue.clone());
        Ok(QueueLease {
            queue,
            owner: Some((self.clone(), tid)),
        })
    }

    /// Use `explicit` if given, otherwise the thread's queue. An explicit
    /// queue is never closed by the lease.
    pub fn lease_queue(&self, explicit: Option<&CommandQueue>) -> Result<QueueLease> {
        match explicit {
            Some(queue) => Ok(QueueLease::borrowed(queue)),
            None => self.thread_queue(),
        }
    }

    pub fn alloc_f32(&self, len: usize) -> Result<MemoryObject> {
        self.inner.pool.allocate(len, || Payload::F32(vec![0.0; len]))
    }

    /// Allocate and fill from host data.
    pub fn upload_f32(&self, data: &[f32]) -> Result<MemoryObject> {
        self.inner.pool.allocate(data.len(), || Payload::F32(data.to_vec()))
    }

    pub fn upload_u32(&self, data: &[u32]) -> Result<MemoryObject> {
        self.inner.pool.allocate(data.len(), || Payload::U32(data.to_vec()))
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.pool.stats()
    }

    /// Close every per-thread queue.
    pub(crate) fn shutdown(&self) {
        let queues: Vec<CommandQueue> = lock(&self.inner.thread_queues).drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.close();
        }
    }
}

/// A command queue obtained for the duration of one scope.
pub struct QueueLease {
    queue: CommandQueue,
    owner: Option<(Device, ThreadId)>,
}

impl QueueLease {
    pub fn borrowed(queue: &CommandQueue) -> Self {
        Self {
            queue: queue.clone(),
            owner: None,
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Whether dropping this lease closes the queue.
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

impl std::ops::Deref for QueueLease {
    type Target = CommandQueue;

    fn deref(&self) -> &CommandQueue {
        &self.queue
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if let Some((device, tid)) = self.owner.take() {
            let current = lock(&device.inner.thread_queues).remove(&tid);
            if let Some(queue) = current {
                queue.close();
            }
            self.queue.close();
        }
    }
}
