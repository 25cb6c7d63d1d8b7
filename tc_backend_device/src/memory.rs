//! Device allocations.
//!
//! Device memory is only reachable through explicit reads and writes. Each
//! allocation is charged against its device's capacity and handed back
//! exactly once, however many release paths race for it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{DeviceError, Result};
use crate::sync::{lock, read, write};

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

/// Element storage of one allocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    F32(Vec<f32>),
    U32(Vec<u32>),
}

impl Payload {
    /// Bytes per element of either kind.
    pub(crate) const ELEMENT_BYTES: usize = 4;

    fn len(&self) -> usize {
        match self {
            Payload::F32(v) => v.len(),
            Payload::U32(v) => v.len(),
        }
    }
}

/// Per-device accounting of live memory.
#[derive(Debug)]
pub(crate) struct MemoryPool {
    device: String,
    capacity: usize,
    used: Mutex<usize>,
    live: AtomicUsize,
    frees: AtomicUsize,
}

/// Snapshot of a device's memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub capacity_bytes: usize,
    pub allocated_bytes: usize,
    pub live_allocations: usize,
    pub total_frees: usize,
}

impl MemoryPool {
    pub(crate) fn new(device: String, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            used: Mutex::new(0),
            live: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub(crate) fn stats(&self) -> MemoryStats {
        MemoryStats {
            capacity_bytes: self.capacity,
            allocated_bytes: *lock(&self.used),
            live_allocations: self.live.load(Ordering::Acquire),
            total_frees: self.frees.load(Ordering::Acquire),
        }
    }

    /// Charge `len` elements against the capacity, then build the contents
    /// with `fill`. On failure nothing is charged and `fill` never runs.
    pub(crate) fn allocate<F>(self: &Arc<Self>, len: usize, fill: F) -> Result<MemoryObject>
    where
        F: FnOnce() -> Payload,
    {
        let requested = len.checked_mul(Payload::ELEMENT_BYTES);
        let bytes = {
            let mut used = lock(&self.used);
            let available = self.capacity.saturating_sub(*used);
            let bytes = match requested {
                Some(bytes) if bytes <= available => bytes,
                _ => {
                    let requested = requested.unwrap_or(usize::MAX);
                    tracing::debug!(device = %self.device, requested, available, "device allocation refused");
                    return Err(DeviceError::AllocationFailure {
                        device: self.device.clone(),
                        requested,
                        available,
                    });
                }
            };
            *used += bytes;
            bytes
        };
        self.live.fetch_add(1, Ordering::AcqRel);

        let payload = fill();
        debug_assert_eq!(payload.len(), len);

        let id = NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device = %self.device, id, bytes, "device allocation");
        Ok(MemoryObject {
            handle: MemHandle(Arc::new(Allocation {
                id,
                bytes,
                len: payload.len(),
                pool: Arc::clone(self),
                payload: RwLock::new(Some(payload)),
                freed: AtomicBool::new(false),
            })),
        })
    }

    fn give_back(&self, id: u64, bytes: usize) {
        let mut used = lock(&self.used);
        *used = used.saturating_sub(bytes);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(device = %self.device, id, bytes, "device free");
    }
}

#[derive(Debug)]
struct Allocation {
    id: u64,
    bytes: usize,
    len: usize,
    pool: Arc<MemoryPool>,
    payload: RwLock<Option<Payload>>,
    freed: AtomicBool,
}

impl Allocation {
    /// Returns true for the one call that actually freed.
    fn free(&self) -> bool {
        if self.freed.swap(true, Ordering::AcqRel) {
            return false;
        }
        write(&self.payload).take();
        self.pool.give_back(self.id, self.bytes);
        true
    }
}

/// Non-owning reference to an allocation, as bound into kernel arguments.
///
/// Every access checks liveness: once the owner released the allocation,
/// reads and writes fail with [`DeviceError::Released`].
#[derive(Debug, Clone)]
pub struct MemHandle(Arc<Allocation>);

impl MemHandle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn bytes(&self) -> usize {
        self.0.bytes
    }

    pub fn is_released(&self) -> bool {
        self.0.freed.load(Ordering::Acquire)
    }

    pub fn read_f32(&self) -> Result<Vec<f32>> {
        match read(&self.0.payload).as_ref() {
            Some(Payload::F32(v)) => Ok(v.clone()),
            Some(Payload::U32(v)) => Ok(v.iter().map(|&x| x as f32).collect()),
            None => Err(DeviceError::Released(self.0.id)),
        }
    }

    pub fn read_u32(&self) -> Result<Vec<u32>> {
        match read(&self.0.payload).as_ref() {
            Some(Payload::U32(v)) => Ok(v.clone()),
            Some(Payload::F32(v)) => Ok(v.iter().map(|&x| x as u32).collect()),
            None => Err(DeviceError::Released(self.0.id)),
        }
    }

    /// Replace the contents. The length must match the allocation.
    pub fn write_f32(&self, data: &[f32]) -> Result<()> {
        self.update_f32(|dst| dst.copy_from_slice(data), Some(data.len()))
    }

    /// Mutate the contents in place.
    pub fn modify_f32<F: FnOnce(&mut [f32])>(&self, f: F) -> Result<()> {
        self.update_f32(f, None)
    }

    fn update_f32<F: FnOnce(&mut [f32])>(&self, f: F, expect_len: Option<usize>) -> Result<()> {
        let mut guard = write(&self.0.payload);
        match guard.as_mut() {
            Some(Payload::F32(v)) => {
                if let Some(len) = expect_len {
                    if len != v.len() {
                        return Err(DeviceError::SizeMismatch { expected: v.len(), found: len });
                    }
                }
                f(v);
                Ok(())
            }
            Some(Payload::U32(_)) => Err(DeviceError::SizeMismatch { expected: 0, found: self.0.len }),
            None => Err(DeviceError::Released(self.0.id)),
        }
    }
}

/// One device allocation with a single owner.
///
/// [`close`](MemoryObject::close) frees the allocation; later calls and the
/// drop-time safety net are no-ops.
#[derive(Debug)]
pub struct MemoryObject {
    handle: MemHandle,
}

impl MemoryObject {
    pub fn handle(&self) -> MemHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    pub fn read_f32(&self) -> Result<Vec<f32>> {
        self.handle.read_f32()
    }

    pub fn read_u32(&self) -> Result<Vec<u32>> {
        self.handle.read_u32()
    }

    pub fn write_f32(&self, data: &[f32]) -> Result<()> {
        self.handle.write_f32(data)
    }

    /// Free the allocation. Returns true if this call performed the free.
    pub fn close(&self) -> bool {
        self.handle.0.free()
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        if self.handle.0.free() {
            tracing::debug!(id = self.handle.id(), "memory object reclaimed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(capacity: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool::new("test:0".to_string(), capacity))
    }

    #[test]
    fn test_allocate_and_read() {
        let pool = pool(1024);
        let mem = pool.allocate(2, || Payload::F32(vec![1.0, 2.0])).unwrap();
        assert_eq!(mem.read_f32().unwrap(), vec![1.0, 2.0]);
        assert_eq!(pool.stats().allocated_bytes, 8);
        assert_eq!(pool.stats().live_allocations, 1);
    }

    #[test]
    fn test_allocation_failure_keeps_nothing() {
        let pool = pool(16);
        let err = pool.allocate(5, || Payload::F32(vec![0.0; 5])).unwrap_err();
        assert_eq!(
            err,
            DeviceError::AllocationFailure {
                device: "test:0".to_string(),
                requested: 20,
                available: 16,
            }
        );
        assert_eq!(pool.stats(), MemoryStats { capacity_bytes: 16, ..Default::default() });
    }

    #[test]
    fn test_oversized_request_refused_before_fill() {
        let pool = pool(1 << 20);
        let err = pool
            .allocate(1 << 30, || panic!("contents built for a refused allocation"))
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::AllocationFailure { requested, available, .. } if requested > available && available == 1 << 20
        ));

        let err = pool.allocate(usize::MAX, || panic!("contents built for a refused allocation")).unwrap_err();
        assert!(matches!(err, DeviceError::AllocationFailure { requested: usize::MAX, .. }));
        assert_eq!(pool.stats().live_allocations, 0);
        assert_eq!(pool.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_close_exactly_once() {
        let pool = pool(1024);
        let mem = pool.allocate(4, || Payload::F32(vec![0.0; 4])).unwrap();
        let handle = mem.handle();
        assert!(mem.close());
        assert!(!mem.close());
        drop(mem);
        assert_eq!(pool.stats().total_frees, 1);
        assert_eq!(pool.stats().allocated_bytes, 0);
        assert_eq!(handle.read_f32(), Err(DeviceError::Released(handle.id())));
    }

    #[test]
    fn test_concurrent_close() {
        let pool = pool(1 << 20);
        for _ in 0..20 {
            let mem = Arc::new(pool.allocate(16, || Payload::F32(vec![0.0; 16])).unwrap());
            let winners: usize = thread::scope(|s| {
                let joins: Vec<_> = (0..8)
                    .map(|_| {
                        let mem = Arc::clone(&mem);
                        s.spawn(move || mem.close() as usize)
                    })
                    .collect();
                joins.into_iter().map(|j| j.join().unwrap()).sum()
            });
            assert_eq!(winners, 1);
        }
        assert_eq!(pool.stats().total_frees, 20);
    }

    #[test]
    fn test_drop_frees() {
        let pool = pool(1024);
        drop(pool.allocate(3, || Payload::U32(vec![1, 2, 3])).unwrap());
        assert_eq!(pool.stats().total_frees, 1);
        assert_eq!(pool.stats().live_allocations, 0);
    }

    #[test]
    fn test_write_length_checked() {
        let pool = pool(1024);
        let mem = pool.allocate(3, || Payload::F32(vec![0.0; 3])).unwrap();
        assert!(matches!(mem.write_f32(&[1.0]), Err(DeviceError::SizeMismatch { .. })));
        mem.write_f32(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(mem.read_f32().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
