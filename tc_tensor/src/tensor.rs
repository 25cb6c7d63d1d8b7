//! The tensor handle.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::instrument;

use tc_backend_device::{Device, Runtime};

use crate::autograd::AutogradContext;
use crate::error::{Result, TensorError};
use crate::shape::{Shape, Strides};
use crate::storage::{DeviceStorage, Storage};
use crate::view::TensorView;

/// A dense `f32` tensor on the host or on a device, optionally part of an
/// autograd graph.
///
/// Cloning is cheap: storage and graph node are shared.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) shape: Shape,
    pub(crate) strides: Strides,
    pub(crate) storage: Storage,
    pub(crate) autograd: Option<Arc<AutogradContext>>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("storage", &self.storage)
            .field("autograd", &self.autograd)
            .finish()
    }
}

impl Tensor {
    pub(crate) fn from_parts(shape: Shape, storage: Storage) -> Self {
        Self {
            strides: shape.contiguous_strides(),
            shape,
            storage,
            autograd: None,
        }
    }

    pub(crate) fn host(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.elements());
        Self::from_parts(shape, Storage::host(data))
    }

    pub(crate) fn on_device(storage: DeviceStorage, shape: Shape) -> Self {
        Self::from_parts(shape, Storage::Device(storage))
    }

    /// Host tensor over `data`, which must hold exactly `shape.elements()`
    /// values in row-major order.
    #[instrument(level = "trace", skip_all, fields(len = data.len()))]
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elements() {
            return Err(TensorError::ElementCount {
                expected: shape.elements(),
                found: data.len(),
                shape,
            });
        }
        Ok(Self::host(data, shape))
    }

    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        Self::host(vec![value; shape.elements()], shape)
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Rank-0 tensor.
    pub fn scalar(value: f32) -> Self {
        Self::host(vec![value], Shape::scalar())
    }

    /// Uniform samples in `[low, high)` from the thread RNG. Panics unless
    /// `low < high`.
    pub fn rand_uniform(shape: impl Into<Shape>, low: f32, high: f32) -> Self {
        Self::rand_uniform_with(shape, low, high, &mut rand::thread_rng())
    }

    /// Uniform samples in `[low, high)` from a caller-supplied RNG.
    pub fn rand_uniform_with<R: Rng + ?Sized>(shape: impl Into<Shape>, low: f32, high: f32, rng: &mut R) -> Self {
        let shape = shape.into();
        let data = (0..shape.elements()).map(|_| rng.gen_range(low..high)).collect();
        Self::host(data, shape)
    }

    /// Zeros with `self`'s shape, on the same host or device as `self`.
    /// Never tracks gradients.
    pub fn zeros_like(&self) -> Result<Self> {
        self.zeros_like_placed(self.shape.clone())
    }

    /// A host or device tensor of zeros placed like `self`.
    pub(crate) fn zeros_like_placed(&self, shape: Shape) -> Result<Self> {
        match &self.storage {
            Storage::Host(_) => Ok(Self::zeros(shape)),
            Storage::Device(d) => Ok(Self::on_device(d.zeros(&shape)?, shape)),
        }
    }

    /// Ones shaped like `self`, placed like `self`.
    pub(crate) fn ones_like(&self) -> Result<Self> {
        let ones = Self::ones(self.shape.clone());
        match &self.storage {
            Storage::Host(_) => Ok(ones),
            Storage::Device(d) => ones.to(d.runtime(), d.device()),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elements(&self) -> usize {
        self.shape.elements()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_host(&self) -> bool {
        matches!(self.storage, Storage::Host(_))
    }

    /// The device holding this tensor, `None` on the host.
    pub fn device(&self) -> Option<&Device> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Device(d) => Some(d.device()),
        }
    }

    /// `"host"` or the device name.
    pub fn placement(&self) -> String {
        self.storage.placement()
    }

    /// Borrow the host buffer. `None` for device tensors.
    pub fn as_slice(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::Host(data) => Some(data.as_slice()),
            Storage::Device(_) => None,
        }
    }

    /// Row-major copy of the elements, read back from the device if needed.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        match &self.storage {
            Storage::Host(data) => Ok(data.to_vec()),
            Storage::Device(d) => d.read(),
        }
    }

    /// Strided view over a host tensor.
    pub fn view(&self) -> Option<TensorView<'_>> {
        self.as_slice()
            .map(|data| TensorView::new(data, self.shape.clone()))
            .and_then(|v| v.ok())
    }

    fn flat_index(&self, op: &'static str, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(TensorError::DimensionOutOfBounds {
                op,
                dim: index.len(),
                rank: self.rank(),
            });
        }
        for (dim, (&i, &size)) in index.iter().zip(self.dims()).enumerate() {
            if i >= size {
                return Err(TensorError::InvalidRange {
                    op,
                    dim,
                    start: i,
                    end: i + 1,
                    size,
                });
            }
        }
        Ok(self.strides.offset(index))
    }

    /// Element at a multi-index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let flat = self.flat_index("get", index)?;
        match &self.storage {
            Storage::Host(data) => Ok(data[flat]),
            Storage::Device(d) => Ok(d.read()?[flat]),
        }
    }

    /// Overwrite one element. Other handles sharing the buffer keep the old
    /// contents.
    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        let flat = self.flat_index("set", index)?;
        match &mut self.storage {
            Storage::Host(data) => Arc::make_mut(data)[flat] = value,
            Storage::Device(d) => {
                let mut data = d.read()?;
                data[flat] = value;
                *d = DeviceStorage::upload(d.runtime(), d.device(), &data, &self.shape)?;
            }
        }
        Ok(())
    }

    /// Copy to `device`. The copy does not take part in the autograd graph.
    #[instrument(level = "debug", skip_all, fields(shape = %self.shape, to = device.name()))]
    pub fn to(&self, runtime: &Arc<Runtime>, device: &Device) -> Result<Tensor> {
        let data = self.to_vec()?;
        let storage = DeviceStorage::upload(runtime, device, &data, &self.shape)?;
        Ok(Self::on_device(storage, self.shape.clone()))
    }

    /// Copy to host memory. A host tensor is returned as a cheap clone
    /// without its graph node.
    #[instrument(level = "debug", skip_all, fields(shape = %self.shape, from = %self.placement()))]
    pub fn to_host(&self) -> Result<Tensor> {
        match &self.storage {
            Storage::Host(data) => Ok(Self::from_parts(self.shape.clone(), Storage::Host(Arc::clone(data)))),
            Storage::Device(d) => Ok(Self::host(d.read()?, self.shape.clone())),
        }
    }

    /// Free the device buffers now. Clones share the release; a reshaped
    /// view keeps the data buffer alive until it is released too. Returns
    /// true if this call freed them; a no-op on the host.
    pub fn release(&self) -> bool {
        match &self.storage {
            Storage::Host(_) => false,
            Storage::Device(d) => d.release(),
        }
    }
}
