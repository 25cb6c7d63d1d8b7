//! Reference-counted resources with a single real free.
//!
//! Used where more than one holder shares one backing store. The count
//! starts at one; `retain` adds a holder, `release` drops one, and the free
//! runs when the count reaches zero. A deferred reclamation racing the
//! explicit path frees at most once between them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{DeviceError, Result};
use crate::memory::{MemHandle, MemoryObject};
use crate::sync::lock;

/// Something with a terminal release action.
pub trait Release: Send {
    fn release(self);

    /// Identifier reported once the resource is gone.
    fn id(&self) -> u64 {
        0
    }
}

impl Release for MemoryObject {
    fn release(self) {
        self.close();
    }

    fn id(&self) -> u64 {
        MemoryObject::id(self)
    }
}

struct Inner<R: Release> {
    id: u64,
    count: AtomicUsize,
    freed: AtomicBool,
    resource: Mutex<Option<R>>,
}

impl<R: Release> Inner<R> {
    fn free_once(&self) -> bool {
        if self.freed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(resource) = lock(&self.resource).take() {
            resource.release();
        }
        true
    }
}

impl<R: Release> Drop for Inner<R> {
    fn drop(&mut self) {
        if self.free_once() {
            tracing::debug!(count = self.count.load(Ordering::Acquire), "shared resource reclaimed on drop");
        }
    }
}

/// Shared handle to a counted resource.
///
/// Cloning the handle does not change the count; holders call
/// [`retain`](RefCounted::retain) and [`release`](RefCounted::release)
/// explicitly.
pub struct RefCounted<R: Release> {
    inner: Arc<Inner<R>>,
}

impl<R: Release> Clone for RefCounted<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Release> std::fmt::Debug for RefCounted<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCounted")
            .field("count", &self.count())
            .field("freed", &self.is_freed())
            .finish()
    }
}

impl<R: Release> RefCounted<R> {
    pub fn new(resource: R) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: resource.id(),
                count: AtomicUsize::new(1),
                freed: AtomicBool::new(false),
                resource: Mutex::new(Some(resource)),
            }),
        }
    }

    /// The resource's identifier, still available after the free.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Add a holder. Returns the new count. Retaining a freed resource
    /// does not revive it.
    pub fn retain(&self) -> usize {
        self.inner.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A new handle for a new holder: `retain` plus `clone`.
    pub fn share(&self) -> Self {
        self.retain();
        self.clone()
    }

    /// Drop a holder. Returns the new count; the free runs on the
    /// transition to zero. Releasing at zero is a no-op.
    pub fn release(&self) -> usize {
        let prev = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match prev {
            Ok(1) => {
                self.inner.free_once();
                0
            }
            Ok(c) => c - 1,
            Err(_) => 0,
        }
    }

    /// Deferred-reclamation hook: free now regardless of the count.
    /// Returns true if this call performed the free.
    pub fn reclaim(&self) -> bool {
        self.inner.free_once()
    }

    /// Run `f` on the resource if it has not been freed.
    pub fn with<T>(&self, f: impl FnOnce(&R) -> T) -> Option<T> {
        lock(&self.inner.resource).as_ref().map(f)
    }
}

/// A device buffer shared between several tensor views.
pub type SharedMemory = RefCounted<MemoryObject>;

impl RefCounted<MemoryObject> {
    pub fn handle(&self) -> Result<MemHandle> {
        self.with(MemoryObject::handle)
            .ok_or(DeviceError::Released(self.id()))
    }
}
