//! Ordered command queues.
//!
//! Each queue owns one worker thread that runs submitted work strictly in
//! enqueue order. Nothing is ordered across queues. [`CommandQueue::finish`]
//! is the only point where the host observes completion.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{DeviceError, Result};
use crate::sync::lock;

static NEXT_QUEUE: AtomicU64 = AtomicU64::new(1);

pub(crate) type Job = Box<dyn FnOnce() -> Result<()> + Send>;

struct Pending {
    label: String,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    closed: bool,
    submitted: u64,
    retired: u64,
    failures: Vec<DeviceError>,
}

struct Shared {
    id: u64,
    label: String,
    state: Mutex<QueueState>,
    work: Condvar,
    done: Condvar,
}

impl Shared {
    fn wait<'a>(cv: &Condvar, guard: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut st = lock(&self.state);
                loop {
                    if let Some(p) = st.pending.pop_front() {
                        break Some(p);
                    }
                    if st.closed {
                        break None;
                    }
                    st = Self::wait(&self.work, st);
                }
            };
            let Some(Pending { label, job }) = next else {
                tracing::debug!(queue = %self.label, "queue worker exiting");
                return;
            };

            let outcome = catch_unwind(AssertUnwindSafe(job));
            let mut st = lock(&self.state);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(queue = %self.label, %label, %err, "queued work failed");
                    st.failures.push(err);
                }
                Err(_) => st.failures.push(DeviceError::KernelFailed {
                    kernel: label,
                    message: "panicked on the queue thread".to_string(),
                }),
            }
            st.retired += 1;
            self.done.notify_all();
        }
    }
}

struct QueueHandle {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        close_shared(&self.shared);
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn close_shared(shared: &Shared) -> usize {
    let mut st = lock(&shared.state);
    if st.closed {
        return 0;
    }
    st.closed = true;
    let discarded = st.pending.len();
    st.pending.clear();
    st.retired += discarded as u64;
    shared.work.notify_all();
    shared.done.notify_all();
    tracing::debug!(queue = %shared.label, discarded, "command queue closed");
    discarded
}

/// Handle to an ordered execution context on one device.
///
/// Clones refer to the same queue. The worker thread stops once the queue
/// is closed and drained, or when the last handle is dropped.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueHandle>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.inner.shared.id)
            .field("label", &self.inner.shared.label)
            .finish()
    }
}

impl CommandQueue {
    pub(crate) fn spawn(device: &str) -> Result<Self> {
        let id = NEXT_QUEUE.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            label: format!("{device}/q{id}"),
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            done: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(shared.label.clone())
            .spawn(move || runner.run())
            .map_err(|e| DeviceError::KernelFailed {
                kernel: "queue".to_string(),
                message: format!("cannot start queue worker: {e}"),
            })?;
        tracing::debug!(queue = %shared.label, "command queue created");
        Ok(Self {
            inner: Arc::new(QueueHandle {
                shared,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.shared.state).closed
    }

    /// Submitted work that has not started yet.
    pub fn pending(&self) -> usize {
        lock(&self.inner.shared.state).pending.len()
    }

    pub(crate) fn enqueue(&self, label: &str, job: Job) -> Result<()> {
        let shared = &self.inner.shared;
        let mut st = lock(&shared.state);
        if st.closed {
            return Err(DeviceError::QueueClosed(shared.label.clone()));
        }
        tracing::trace!(queue = %shared.label, label, "enqueue");
        st.pending.push_back(Pending {
            label: label.to_string(),
            job,
        });
        st.submitted += 1;
        shared.work.notify_one();
        Ok(())
    }

    /// Block until everything submitted so far has run or been discarded.
    ///
    /// Failures recorded since the last `finish` are drained and the first
    /// one is returned.
    pub fn finish(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let mut st = lock(&shared.state);
        let target = st.submitted;
        while st.retired < target {
            st = Shared::wait(&shared.done, st);
        }
        if st.failures.is_empty() {
            return Ok(());
        }
        let mut failures = std::mem::take(&mut st.failures);
        Err(failures.swap_remove(0))
    }

    /// Close the queue, discarding everything that has not started yet.
    /// Work already running completes. Returns the number of discarded
    /// submissions.
    pub fn close(&self) -> usize {
        close_shared(&self.inner.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runs_in_order() {
        let queue = CommandQueue::spawn("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = Arc::clone(&log);
            queue
                .enqueue("push", Box::new(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        queue.finish().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_failure_surfaces_on_finish() {
        let queue = CommandQueue::spawn("test").unwrap();
        queue.enqueue("bad", Box::new(|| Err(DeviceError::Released(3)))).unwrap();
        queue.enqueue("good", Box::new(|| Ok(()))).unwrap();
        assert_eq!(queue.finish(), Err(DeviceError::Released(3)));
        assert_eq!(queue.finish(), Ok(()));
    }

    #[test]
    fn test_panic_is_recorded() {
        let queue = CommandQueue::spawn("test").unwrap();
        queue.enqueue("boom", Box::new(|| -> Result<()> { panic!("kernel bug") })).unwrap();
        assert!(matches!(queue.finish(), Err(DeviceError::KernelFailed { .. })));
        queue.enqueue("after", Box::new(|| Ok(()))).unwrap();
        assert_eq!(queue.finish(), Ok(()));
    }

    #[test]
    fn test_close_discards_pending() {
        let queue = CommandQueue::spawn("test").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let ran = Arc::new(Mutex::new(0));

        queue
            .enqueue("gate", Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            }))
            .unwrap();
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            queue
                .enqueue("late", Box::new(move || {
                    *ran.lock().unwrap() += 1;
                    Ok(())
                }))
                .unwrap();
        }

        started_rx.recv().unwrap();
        assert_eq!(queue.close(), 5);
        release_tx.send(()).unwrap();
        queue.finish().unwrap();

        assert_eq!(*ran.lock().unwrap(), 0);
        assert!(matches!(
            queue.enqueue("closed", Box::new(|| Ok(()))),
            Err(DeviceError::QueueClosed(_))
        ));
    }
}
