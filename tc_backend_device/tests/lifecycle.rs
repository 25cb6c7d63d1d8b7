//! Device, queue, registry and release lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use proptest::prelude::*;

use tc_backend_device::{
    CollectableState, DeviceError, KernelArgs, KernelLaunch, KernelProgram, NdRange, ParamKind,
    RefCounted, Release, Result, Runtime, RuntimeConfig, SharedMemory, TensorBuffers,
};

/// `x = x * scale + shift` over the first `range.len()` elements.
struct Affine;

impl KernelProgram for Affine {
    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Float, ParamKind::Float]
    }

    fn execute(&self, args: &KernelArgs, range: NdRange) -> Result<()> {
        let (scale, shift) = (args.float(1)?, args.float(2)?);
        args.mem(0)?.modify_f32(|x| {
            for v in x.iter_mut().take(range.len()) {
                *v = *v * scale + shift;
            }
        })
    }
}

/// Signals when it starts, then blocks until told to go on.
struct Gate {
    started: Mutex<mpsc::Sender<()>>,
    proceed: Mutex<mpsc::Receiver<()>>,
}

impl KernelProgram for Gate {
    fn params(&self) -> &[ParamKind] {
        &[]
    }

    fn execute(&self, _args: &KernelArgs, _range: NdRange) -> Result<()> {
        let _ = self.started.lock().unwrap().send(());
        let _ = self.proceed.lock().unwrap().recv();
        Ok(())
    }
}

fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::default().with_device_count(2).with_memory_bytes(1 << 16))
}

#[test]
fn test_registry_one_shot_and_loud_misses() {
    let rt = runtime();
    let dev0 = rt.device(0).unwrap();
    let dev1 = rt.device(1).unwrap();

    rt.register(dev0, "affine", Affine).unwrap();
    assert!(matches!(
        rt.register(dev0, "affine", Affine),
        Err(DeviceError::DuplicateKernel { .. })
    ));
    // Same name on another device is a separate registration.
    rt.register(dev1, "affine", Affine).unwrap();

    assert!(matches!(
        rt.kernel(dev0, "missing"),
        Err(DeviceError::UnregisteredKernel { .. })
    ));

    let foreign = runtime();
    let stranger = foreign.default_device().unwrap();
    assert!(matches!(
        rt.kernel(stranger, "affine"),
        Err(DeviceError::UnregisteredDevice(_))
    ));
    assert!(matches!(rt.device(9), Err(DeviceError::UnregisteredDevice(_))));
    assert_eq!(rt.registry().names(dev0), vec!["affine".to_string()]);
}

#[test]
fn test_launches_run_in_enqueue_order() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let affine = rt.register(dev, "affine", Affine).unwrap();
    let buf = dev.upload_f32(&[1.0; 8]).unwrap();
    let queue = dev.thread_queue().unwrap();

    // ((1 * 1 + 2) * 3 + 0) * 1 - 4 = 5; any other order gives something else.
    for (scale, shift) in [(1.0, 2.0), (3.0, 0.0), (1.0, -4.0)] {
        KernelLaunch::new(&affine)
            .arg_mem(buf.handle())
            .arg_float(scale)
            .arg_float(shift)
            .submit(&queue, NdRange::d1(8))
            .unwrap();
    }
    queue.finish().unwrap();
    assert_eq!(buf.read_f32().unwrap(), vec![5.0; 8]);
}

#[test]
fn test_argument_mismatch_rejected_before_enqueue() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let affine = rt.register(dev, "affine", Affine).unwrap();
    let buf = dev.alloc_f32(4).unwrap();
    let queue = dev.new_command_queue().unwrap();

    let wrong_kind = KernelLaunch::new(&affine)
        .arg_mem(buf.handle())
        .arg_int(1)
        .arg_float(0.0)
        .submit(&queue, NdRange::d1(4));
    assert!(matches!(wrong_kind, Err(DeviceError::ArgumentMismatch { .. })));

    let too_few = KernelLaunch::new(&affine).arg_mem(buf.handle()).submit(&queue, NdRange::d1(4));
    assert!(matches!(too_few, Err(DeviceError::ArgumentMismatch { .. })));

    assert_eq!(queue.pending(), 0);
    queue.finish().unwrap();
}

#[test]
fn test_close_discards_pending_launches() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let gate = rt
        .register(
            dev,
            "gate",
            Gate {
                started: Mutex::new(started_tx),
                proceed: Mutex::new(proceed_rx),
            },
        )
        .unwrap();
    let affine = rt.register(dev, "affine", Affine).unwrap();
    let buf = dev.upload_f32(&[1.0; 4]).unwrap();
    let queue = dev.new_command_queue().unwrap();

    KernelLaunch::new(&gate).submit(&queue, NdRange::d1(1)).unwrap();
    for _ in 0..3 {
        KernelLaunch::new(&affine)
            .arg_mem(buf.handle())
            .arg_float(10.0)
            .arg_float(0.0)
            .submit(&queue, NdRange::d1(4))
            .unwrap();
    }

    started_rx.recv().unwrap();
    assert_eq!(queue.close(), 3);
    proceed_tx.send(()).unwrap();
    queue.finish().unwrap();

    assert_eq!(buf.read_f32().unwrap(), vec![1.0; 4]);
    let after = KernelLaunch::new(&affine)
        .arg_mem(buf.handle())
        .arg_float(1.0)
        .arg_float(0.0)
        .submit(&queue, NdRange::d1(4));
    assert!(matches!(after, Err(DeviceError::QueueClosed(_))));
}

#[test]
fn test_thread_queue_usable_after_close() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let affine = rt.register(dev, "affine", Affine).unwrap();
    let buf = dev.upload_f32(&[1.0; 4]).unwrap();

    let lease = dev.thread_queue().unwrap();
    lease.close();

    let queue = dev.thread_queue().unwrap();
    KernelLaunch::new(&affine)
        .arg_mem(buf.handle())
        .arg_float(2.0)
        .arg_float(1.0)
        .submit(&queue, NdRange::d1(4))
        .unwrap();
    queue.finish().unwrap();
    assert_eq!(buf.read_f32().unwrap(), vec![3.0; 4]);
}

#[test]
fn test_allocation_failure_leaves_nothing_allocated() {
    let rt = Runtime::new(RuntimeConfig::default().with_memory_bytes(64));
    let dev = rt.default_device().unwrap();
    let kept = dev.alloc_f32(10).unwrap();
    let before = dev.memory_stats();

    let err = dev.alloc_f32(7).unwrap_err();
    assert_eq!(
        err,
        DeviceError::AllocationFailure {
            device: dev.name().to_string(),
            requested: 28,
            available: 24,
        }
    );
    assert_eq!(dev.memory_stats(), before);

    kept.close();
    dev.alloc_f32(16).unwrap();
}

#[test]
fn test_oversized_allocation_is_refused() {
    let rt = Runtime::new(RuntimeConfig::default().with_memory_bytes(1 << 20));
    let dev = rt.default_device().unwrap();
    for len in [1usize << 30, usize::MAX / 2, usize::MAX] {
        assert!(matches!(
            dev.alloc_f32(len),
            Err(DeviceError::AllocationFailure { available, .. }) if available == 1 << 20
        ));
    }
    assert_eq!(dev.memory_stats().live_allocations, 0);
    assert_eq!(dev.memory_stats().allocated_bytes, 0);
}

#[test]
fn test_kernel_on_released_memory_fails_at_finish() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let affine = rt.register(dev, "affine", Affine).unwrap();
    let buf = dev.alloc_f32(4).unwrap();
    let handle = buf.handle();
    buf.close();

    let queue = dev.thread_queue().unwrap();
    KernelLaunch::new(&affine)
        .arg_mem(handle.clone())
        .arg_float(1.0)
        .arg_float(1.0)
        .submit(&queue, NdRange::d1(4))
        .unwrap();
    assert_eq!(queue.finish(), Err(DeviceError::Released(handle.id())));
}

#[test]
fn test_collectable_state_frees_all_buffers_once() {
    let rt = runtime();
    let dev = rt.default_device().unwrap();
    let data = SharedMemory::new(dev.upload_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap());
    let state = CollectableState::new(TensorBuffers {
        data: data.share(),
        shape: dev.upload_u32(&[2, 2]).unwrap(),
        strides: dev.upload_u32(&[2, 1]).unwrap(),
    });
    // A reshaped view shares the data buffer.
    let view = CollectableState::new(TensorBuffers {
        data: data.clone(),
        shape: dev.upload_u32(&[4]).unwrap(),
        strides: dev.upload_u32(&[1]).unwrap(),
    });

    let hooks: Vec<_> = (0..8).map(|_| state.hook()).collect();
    let fired: usize = thread::scope(|s| {
        let joins: Vec<_> = hooks.iter().map(|h| s.spawn(move || h.fire() as usize)).collect();
        joins.into_iter().map(|j| j.join().unwrap()).sum()
    });
    assert_eq!(fired, 1);
    assert!(!state.release());
    assert!(matches!(state.data(), Err(DeviceError::Released(_))));

    // Shape and strides of the first state are gone; the data lives on in the view.
    assert_eq!(dev.memory_stats().total_frees, 2);
    assert_eq!(view.data().unwrap().read_f32().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    drop(view);
    assert_eq!(dev.memory_stats().total_frees, 5);
    assert_eq!(dev.memory_stats().live_allocations, 0);
}

struct CountFree(Arc<AtomicUsize>);

impl Release for CountFree {
    fn release(self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

proptest! {
    #[test]
    fn prop_refcount_frees_exactly_once(
        extra in 0usize..32,
        threads in 1usize..6,
        reclaim_at in prop::option::of(0usize..40),
    ) {
        let frees = Arc::new(AtomicUsize::new(0));
        let rc = RefCounted::new(CountFree(Arc::clone(&frees)));
        for _ in 0..extra {
            rc.retain();
        }

        // extra + 1 releases in total, spread over the threads.
        let total = extra + 1;
        thread::scope(|s| {
            for t in 0..threads {
                let rc = rc.clone();
                let share = total / threads + usize::from(t < total % threads);
                let reclaim_here = t == 0;
                s.spawn(move || {
                    for i in 0..share {
                        if reclaim_here && reclaim_at == Some(i) {
                            rc.reclaim();
                        }
                        rc.release();
                    }
                });
            }
        });

        prop_assert_eq!(rc.count(), 0);
        prop_assert!(rc.is_freed());
        prop_assert_eq!(frees.load(Ordering::SeqCst), 1);
    }
}
