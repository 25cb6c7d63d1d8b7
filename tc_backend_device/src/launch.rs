//! Kernel launch builder.
//!
//! Arguments are positional: they bind to the kernel's declared parameters
//! in the order they are pushed. The binding is checked at submit time,
//! before anything reaches the queue.

use crate::error::{DeviceError, Result};
use crate::kernel::{CompiledKernel, ParamKind};
use crate::memory::MemHandle;
use crate::queue::CommandQueue;

/// One bound argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Int(i64),
    Float(f32),
    Mem(MemHandle),
}

impl KernelArg {
    pub fn kind(&self) -> ParamKind {
        match self {
            KernelArg::Int(_) => ParamKind::Int,
            KernelArg::Float(_) => ParamKind::Float,
            KernelArg::Mem(_) => ParamKind::Mem,
        }
    }
}

/// Global work size, one to three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    dims: [usize; 3],
    rank: usize,
}

impl NdRange {
    pub fn d1(x: usize) -> Self {
        Self { dims: [x, 1, 1], rank: 1 }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        Self { dims: [x, y, 1], rank: 2 }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Self { dims: [x, y, z], rank: 3 }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    /// Total work items.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arguments as seen by a running kernel program.
#[derive(Debug, Clone)]
pub struct KernelArgs {
    kernel: String,
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn mismatch(&self, index: usize, want: ParamKind) -> DeviceError {
        let found = self
            .args
            .get(index)
            .map_or_else(|| "nothing".to_string(), |a| a.kind().to_string());
        DeviceError::ArgumentMismatch {
            kernel: self.kernel.clone(),
            detail: format!("argument {index}: expected {want}, found {found}"),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64> {
        match self.args.get(index) {
            Some(KernelArg::Int(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Int)),
        }
    }

    /// An int argument that must be a valid non-negative size.
    pub fn size(&self, index: usize) -> Result<usize> {
        let v = self.int(index)?;
        usize::try_from(v).map_err(|_| DeviceError::ArgumentMismatch {
            kernel: self.kernel.clone(),
            detail: format!("argument {index}: {v} is not a size"),
        })
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.args.get(index) {
            Some(KernelArg::Float(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Float)),
        }
    }

    pub fn mem(&self, index: usize) -> Result<&MemHandle> {
        match self.args.get(index) {
            Some(KernelArg::Mem(m)) => Ok(m),
            _ => Err(self.mismatch(index, ParamKind::Mem)),
        }
    }
}

/// Builder for one kernel submission.
///
/// ```ignore
/// KernelLaunch::new(&kernel)
///     .arg_mem(out.handle())
///     .arg_float(1.0)
///     .submit(&queue, NdRange::d1(out.len()))?;
/// ```
#[derive(Debug)]
pub struct KernelLaunch {
    kernel: CompiledKernel,
    args: Vec<KernelArg>,
}

impl KernelLaunch {
    pub fn new(kernel: &CompiledKernel) -> Self {
        Self {
            kernel: kernel.clone(),
            args: Vec::with_capacity(kernel.params().len()),
        }
    }

    pub fn arg_int(mut self, value: i64) -> Self {
        self.args.push(KernelArg::Int(value));
        self
    }

    /// Convenience for sizes and indices.
    pub fn arg_size(self, value: usize) -> Self {
        self.arg_int(value as i64)
    }

    pub fn arg_float(mut self, value: f32) -> Self {
        self.args.push(KernelArg::Float(value));
        self
    }

    pub fn arg_mem(mut self, mem: MemHandle) -> Self {
        self.args.push(KernelArg::Mem(mem));
        self
    }

    fn validate(&self) -> Result<()> {
        let params = self.kernel.params();
        let mismatch = |detail: String| DeviceError::ArgumentMismatch {
            kernel: self.kernel.name().to_string(),
            detail,
        };
        if params.len() != self.args.len() {
            return Err(mismatch(format!(
                "expected {} arguments, got {}",
                params.len(),
                self.args.len()
            )));
        }
        for (index, (want, arg)) in params.iter().zip(&self.args).enumerate() {
            if *want != arg.kind() {
                return Err(mismatch(format!(
                    "argument {index}: expected {want}, found {}",
                    arg.kind()
                )));
            }
        }
        Ok(())
    }

    /// Check the binding and enqueue the kernel over `range`.
    pub fn submit(self, queue: &CommandQueue, range: NdRange) -> Result<()> {
        self.validate()?;
        let program = self.kernel.program().clone();
        let args = KernelArgs {
            kernel: self.kernel.name().to_string(),
            args: self.args,
        };
        queue.enqueue(
            self.kernel.name(),
            Box::new(move || program.execute(&args, range)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nd_range() {
        assert_eq!(NdRange::d1(5).len(), 5);
        assert_eq!(NdRange::d2(3, 4).dims(), &[3, 4]);
        assert_eq!(NdRange::d3(2, 0, 4).len(), 0);
    }

    #[test]
    fn test_args_accessors() {
        let args = KernelArgs {
            kernel: "k".to_string(),
            args: vec![KernelArg::Int(3), KernelArg::Float(0.5), KernelArg::Int(-1)],
        };
        assert_eq!(args.int(0).unwrap(), 3);
        assert_eq!(args.size(0).unwrap(), 3);
        assert_eq!(args.float(1).unwrap(), 0.5);
        assert!(matches!(args.float(0), Err(DeviceError::ArgumentMismatch { .. })));
        assert!(matches!(args.size(2), Err(DeviceError::ArgumentMismatch { .. })));
        assert!(matches!(args.mem(5), Err(DeviceError::ArgumentMismatch { .. })));
    }
}
