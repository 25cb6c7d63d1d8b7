//! Built-in kernel programs for device tensors.
//!
//! Each program reads its operands out of device memory on the queue thread,
//! runs the same host kernel a host tensor would, and writes the result
//! back. Shapes travel as the tensors' own `u32` shape buffers; everything
//! else is a scalar argument.

use std::sync::Arc;

use tc_backend_cpu::{conv, elementwise, BinaryOp, ConvDims, KernelConfig, MatmulDims};
use tc_backend_device::{
    Device, DeviceError, KernelArgs, KernelProgram, MemHandle, NdRange, ParamKind, Result as DeviceResult, Runtime,
};

use crate::activation::Activation;
use crate::broadcast::broadcast_binary;
use crate::error::Result;
use crate::ops::{conv_batch, conv_filter_grad_batch};
use crate::region;
use crate::shape::Shape;

pub(crate) const BINARY: &str = "binary";
pub(crate) const SCALE: &str = "scale";
pub(crate) const MATMUL: &str = "matmul";
pub(crate) const TRANSPOSE: &str = "transpose";
pub(crate) const REDUCE_SUM: &str = "reduce_sum";
pub(crate) const ACTIVATE: &str = "activate";
pub(crate) const ACTIVATE_GRAD: &str = "activate_grad";
pub(crate) const SLICE_EXTRACT: &str = "slice_extract";
pub(crate) const SLICE_INSERT: &str = "slice_insert";
pub(crate) const CONV2D: &str = "conv2d";
pub(crate) const CONV2D_INPUT_GRAD: &str = "conv2d_input_grad";
pub(crate) const CONV2D_FILTER_GRAD: &str = "conv2d_filter_grad";

/// Every built-in kernel name.
pub const BUILTIN_KERNELS: [&str; 12] = [
    BINARY,
    SCALE,
    MATMUL,
    TRANSPOSE,
    REDUCE_SUM,
    ACTIVATE,
    ACTIVATE_GRAD,
    SLICE_EXTRACT,
    SLICE_INSERT,
    CONV2D,
    CONV2D_INPUT_GRAD,
    CONV2D_FILTER_GRAD,
];

fn register<P: KernelProgram + 'static>(runtime: &Runtime, device: &Device, name: &str, program: P) -> DeviceResult<()> {
    match runtime.register(device, name, program) {
        Ok(_) | Err(DeviceError::DuplicateKernel { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Register the built-in programs on `device`. Names already present are
/// left alone, so this is safe to call repeatedly and from several threads.
pub fn install(runtime: &Runtime, device: &Device) -> DeviceResult<()> {
    register(runtime, device, BINARY, Binary)?;
    register(runtime, device, SCALE, Scale)?;
    register(runtime, device, MATMUL, Matmul)?;
    register(runtime, device, TRANSPOSE, Transpose)?;
    register(runtime, device, REDUCE_SUM, ReduceSum)?;
    register(runtime, device, ACTIVATE, Activate)?;
    register(runtime, device, ACTIVATE_GRAD, ActivateGrad)?;
    register(runtime, device, SLICE_EXTRACT, SliceExtract)?;
    register(runtime, device, SLICE_INSERT, SliceInsert)?;
    register(runtime, device, CONV2D, Conv2d(ConvPass::Forward))?;
    register(runtime, device, CONV2D_INPUT_GRAD, Conv2d(ConvPass::InputGrad))?;
    register(runtime, device, CONV2D_FILTER_GRAD, Conv2d(ConvPass::FilterGrad))?;
    tracing::debug!(device = device.name(), "built-in kernels installed");
    Ok(())
}

pub(crate) fn ensure_installed(runtime: &Arc<Runtime>, device: &Device) -> Result<()> {
    if !runtime.registry().contains(device, CONV2D_FILTER_GRAD) {
        install(runtime, device)?;
    }
    Ok(())
}

fn failed(kernel: &str, message: impl ToString) -> DeviceError {
    DeviceError::KernelFailed {
        kernel: kernel.to_string(),
        message: message.to_string(),
    }
}

fn read_shape(mem: &MemHandle) -> DeviceResult<Shape> {
    Ok(Shape(mem.read_u32()?.into_iter().map(|d| d as usize).collect()))
}

fn cfg() -> &'static KernelConfig {
    KernelConfig::shared()
}

/// `out = a op b` with broadcasting.
/// Params: out, a, a_shape, b, b_shape, op code.
struct Binary;

impl KernelProgram for Binary {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Mem, Mem, Int]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let code = args.int(5)?;
        let op = i32::try_from(code)
            .ok()
            .and_then(BinaryOp::from_code)
            .ok_or_else(|| failed(BINARY, format!("unknown op code {code}")))?;
        let (a, a_shape) = (args.mem(1)?.read_f32()?, read_shape(args.mem(2)?)?);
        let (b, b_shape) = (args.mem(3)?.read_f32()?, read_shape(args.mem(4)?)?);
        let (out, _) = broadcast_binary(op, &a, &a_shape, &b, &b_shape, cfg()).map_err(|e| failed(BINARY, e))?;
        args.mem(0)?.write_f32(&out)
    }
}

/// `out = src * alpha`. Params: out, src, alpha.
struct Scale;

impl KernelProgram for Scale {
    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Mem, ParamKind::Float]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let alpha = args.float(2)?;
        let src = args.mem(1)?.read_f32()?;
        args.mem(0)?.write_f32(&elementwise::map(&src, |x| x * alpha, cfg()))
    }
}

/// Params: c, a, b, batch, m, n, p, b_batched, trans_a, trans_b.
struct Matmul;

impl KernelProgram for Matmul {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Int, Int, Int, Int, Int, Int, Int]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let mut dims = MatmulDims::new(args.size(3)?, args.size(4)?, args.size(5)?, args.size(6)?);
        if args.int(7)? == 0 {
            dims = dims.shared_rhs();
        }
        let (a, b) = (args.mem(1)?.read_f32()?, args.mem(2)?.read_f32()?);
        if a.len() != dims.a_len() || b.len() != dims.b_len() {
            return Err(failed(MATMUL, format!("operands do not match {dims:?}")));
        }
        let c = tc_backend_cpu::matmul(&a, &b, dims, args.int(8)? != 0, args.int(9)? != 0, cfg());
        args.mem(0)?.write_f32(&c)
    }
}

/// Params: dst, src, batch, rows, cols.
struct Transpose;

impl KernelProgram for Transpose {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Int, Int, Int]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let (batch, rows, cols) = (args.size(2)?, args.size(3)?, args.size(4)?);
        let src = args.mem(1)?.read_f32()?;
        if src.len() != batch * rows * cols {
            return Err(failed(TRANSPOSE, "source length does not match the planes"));
        }
        args.mem(0)?.write_f32(&tc_backend_cpu::transpose(&src, batch, rows, cols, cfg()))
    }
}

/// Params: out, src, outer, reduced, inner.
struct ReduceSum;

impl KernelProgram for ReduceSum {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Int, Int, Int]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let (outer, reduced, inner) = (args.size(2)?, args.size(3)?, args.size(4)?);
        let src = args.mem(1)?.read_f32()?;
        if src.len() != outer * reduced * inner {
            return Err(failed(REDUCE_SUM, "source length does not match the extents"));
        }
        let mut out = vec![0.0; outer * inner];
        tc_backend_cpu::sum_axis_into(&src, &mut out, outer, reduced, inner, cfg());
        args.mem(0)?.write_f32(&out)
    }
}

fn activation(args: &KernelArgs, kind: usize, kernel: &str) -> DeviceResult<Activation> {
    let code = args.int(kind)?;
    Activation::decode(code, args.float(kind + 1)?).ok_or_else(|| failed(kernel, format!("unknown activation {code}")))
}

/// Params: out, src, kind, param.
struct Activate;

impl KernelProgram for Activate {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Int, Float]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let act = activation(args, 2, ACTIVATE)?;
        let src = args.mem(1)?.read_f32()?;
        args.mem(0)?.write_f32(&elementwise::map(&src, |x| act.activate(x), cfg()))
    }
}

/// `out = grad * act'(input)`. Params: out, grad, input, kind, param.
struct ActivateGrad;

impl KernelProgram for ActivateGrad {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Int, Float]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let act = activation(args, 3, ACTIVATE_GRAD)?;
        let grad = args.mem(1)?.read_f32()?;
        let mut out = elementwise::map(&args.mem(2)?.read_f32()?, |x| act.derivative(x), cfg());
        if out.len() != grad.len() {
            return Err(failed(ACTIVATE_GRAD, "gradient and input differ in length"));
        }
        elementwise::binary_assign(BinaryOp::Mul, &mut out, &grad, cfg());
        args.mem(0)?.write_f32(&out)
    }
}

fn read_ranges(mem: &MemHandle) -> DeviceResult<Vec<std::ops::Range<usize>>> {
    Ok(mem
        .read_u32()?
        .chunks_exact(2)
        .map(|pair| pair[0] as usize..pair[1] as usize)
        .collect())
}

/// Params: out, src, src_shape, ranges (start/end pairs).
struct SliceExtract;

impl KernelProgram for SliceExtract {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Mem]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let src_shape = read_shape(args.mem(2)?)?;
        let ranges = read_ranges(args.mem(3)?)?;
        let part = region::extract(&args.mem(1)?.read_f32()?, &src_shape, &ranges).map_err(|e| failed(SLICE_EXTRACT, e))?;
        args.mem(0)?.write_f32(&part)
    }
}

/// Writes src into dst at offsets, in place.
/// Params: dst, dst_shape, src, src_shape, offsets.
struct SliceInsert;

impl KernelProgram for SliceInsert {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Mem, Mem]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let dst_shape = read_shape(args.mem(1)?)?;
        let src = args.mem(2)?.read_f32()?;
        let src_shape = read_shape(args.mem(3)?)?;
        let offsets: Vec<usize> = args.mem(4)?.read_u32()?.into_iter().map(|o| o as usize).collect();
        let mut outcome = Ok(());
        args.mem(0)?.modify_f32(|dst| {
            outcome = region::insert(dst, &dst_shape, &src, &src_shape, &offsets);
        })?;
        outcome.map_err(|e| failed(SLICE_INSERT, e))
    }
}

#[derive(Debug, Clone, Copy)]
enum ConvPass {
    Forward,
    InputGrad,
    FilterGrad,
}

/// One convolution pass over a batch of images.
/// Params: out, x, y, batch, channels, height, width, filters, kernel_h,
/// kernel_w. `(x, y)` is `(input, filters)` forward, `(grad_out, filters)`
/// for the input gradient and `(input, grad_out)` for the filter gradient,
/// which is summed over the batch.
struct Conv2d(ConvPass);

impl KernelProgram for Conv2d {
    fn params(&self) -> &[ParamKind] {
        use ParamKind::*;
        &[Mem, Mem, Mem, Int, Int, Int, Int, Int, Int, Int]
    }

    fn execute(&self, args: &KernelArgs, _range: NdRange) -> DeviceResult<()> {
        let batch = args.size(3)?;
        let dims = ConvDims {
            channels: args.size(4)?,
            height: args.size(5)?,
            width: args.size(6)?,
            filters: args.size(7)?,
            kernel_h: args.size(8)?,
            kernel_w: args.size(9)?,
        };
        if !dims.is_valid() {
            return Err(failed(CONV2D, format!("invalid geometry {dims:?}")));
        }
        let (x, y) = (args.mem(1)?.read_f32()?, args.mem(2)?.read_f32()?);
        let out = match self.0 {
            ConvPass::Forward if y.len() == dims.filter_len() => {
                conv_batch(&x, dims.input_len(), batch, |img| conv::conv2d(img, &y, dims, cfg()))
            }
            ConvPass::InputGrad if y.len() == dims.filter_len() => {
                conv_batch(&x, dims.output_len(), batch, |g| conv::conv2d_input_grad(g, &y, dims, cfg()))
            }
            ConvPass::FilterGrad => conv_filter_grad_batch(&x, &y, dims, batch),
            _ => None,
        }
        .ok_or_else(|| failed(CONV2D, "operand lengths do not match the geometry"))?;
        args.mem(0)?.write_f32(&out)
    }
}
