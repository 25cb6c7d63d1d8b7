//! Valid 2-D correlation via patch extraction (im2col).
//!
//! Stride is 1 and there is no padding: each output axis is
//! `input - kernel + 1`. The gradient helpers are expressed through the same
//! forward kernel on padded / flipped operands.

use tracing::instrument;

use crate::config::KernelConfig;
use crate::parallel::fork_join_rows;
use crate::simd;

/// Geometry of one image `[channels, height, width]` against a filter bank
/// `[filters, channels, kernel_h, kernel_w]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDims {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub filters: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
}

impl ConvDims {
    /// Whether the kernel fits inside the image.
    pub fn is_valid(&self) -> bool {
        self.kernel_h >= 1
            && self.kernel_w >= 1
            && self.kernel_h <= self.height
            && self.kernel_w <= self.width
    }

    pub fn out_h(&self) -> usize {
        self.height + 1 - self.kernel_h
    }

    pub fn out_w(&self) -> usize {
        self.width + 1 - self.kernel_w
    }

    /// Number of output spatial positions.
    pub fn patches(&self) -> usize {
        self.out_h() * self.out_w()
    }

    /// Length of one receptive field flattened across channels.
    pub fn patch_len(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w
    }

    pub fn input_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn filter_len(&self) -> usize {
        self.filters * self.patch_len()
    }

    pub fn output_len(&self) -> usize {
        self.filters * self.patches()
    }
}

fn grain_rows(cfg: &KernelConfig, work_per_row: usize) -> usize {
    (cfg.conv_split / work_per_row.max(1)).max(1)
}

/// Gather every receptive field into one row of a `[patches, patch_len]`
/// matrix. Rows are filled in parallel.
pub fn im2col(input: &[f32], dims: &ConvDims, cfg: &KernelConfig) -> Vec<f32> {
    assert!(dims.is_valid(), "kernel larger than input: {dims:?}");
    assert_eq!(input.len(), dims.input_len());

    let patch_len = dims.patch_len();
    let mut cols = vec![0.0; dims.patches() * patch_len];
    let (h, w, out_w) = (dims.height, dims.width, dims.out_w());
    let (kh, kw) = (dims.kernel_h, dims.kernel_w);

    fork_join_rows(&mut cols, patch_len, grain_rows(cfg, patch_len), &|first, block: &mut [f32]| {
        for (local, row) in block.chunks_exact_mut(patch_len).enumerate() {
            let patch = first + local;
            let (oy, ox) = (patch / out_w, patch % out_w);
            let mut slot = row.iter_mut();
            for c in 0..dims.channels {
                for ky in 0..kh {
                    let start = c * h * w + (oy + ky) * w + ox;
                    for (&v, dst) in input[start..start + kw].iter().zip(slot.by_ref()) {
                        *dst = v;
                    }
                }
            }
        }
    });
    cols
}

/// Overwrite `out[filters, out_h, out_w]` with the valid correlation of
/// `input` against `filters`.
#[instrument(level = "trace", skip(input, filters, out, cfg))]
pub fn conv2d_into(input: &[f32], filters: &[f32], out: &mut [f32], dims: ConvDims, cfg: &KernelConfig) {
    assert!(dims.is_valid(), "kernel larger than input: {dims:?}");
    assert_eq!(filters.len(), dims.filter_len(), "filter bank does not match {dims:?}");
    assert_eq!(out.len(), dims.output_len(), "output does not match {dims:?}");
    let cols = im2col(input, &dims, cfg);

    let (patches, patch_len) = (dims.patches(), dims.patch_len());
    if patches == 0 || patch_len == 0 {
        out.fill(0.0);
        return;
    }
    fork_join_rows(out, patches, grain_rows(cfg, patches * patch_len), &|first, block: &mut [f32]| {
        for (local, plane) in block.chunks_exact_mut(patches).enumerate() {
            let f = first + local;
            let filter = &filters[f * patch_len..(f + 1) * patch_len];
            for (dst, patch) in plane.iter_mut().zip(cols.chunks_exact(patch_len)) {
                *dst = simd::dot(filter, patch);
            }
        }
    });
}

/// Allocating form of [`conv2d_into`].
pub fn conv2d(input: &[f32], filters: &[f32], dims: ConvDims, cfg: &KernelConfig) -> Vec<f32> {
    let mut out = vec![0.0; dims.output_len()];
    conv2d_into(input, filters, &mut out, dims, cfg);
    out
}

/// Gradient with respect to the input: the full correlation of `grad_out`
/// with the spatially flipped, channel-transposed filter bank.
pub fn conv2d_input_grad(grad_out: &[f32], filters: &[f32], dims: ConvDims, cfg: &KernelConfig) -> Vec<f32> {
    assert!(dims.is_valid(), "kernel larger than input: {dims:?}");
    assert_eq!(grad_out.len(), dims.output_len());
    assert_eq!(filters.len(), dims.filter_len());
    let (c_in, f_out) = (dims.channels, dims.filters);
    let (kh, kw) = (dims.kernel_h, dims.kernel_w);
    let (oh, ow) = (dims.out_h(), dims.out_w());

    // Zero-pad each gradient plane by kernel-1 on every side.
    let (ph, pw) = (oh + 2 * (kh - 1), ow + 2 * (kw - 1));
    let mut padded = vec![0.0; f_out * ph * pw];
    for f in 0..f_out {
        for y in 0..oh {
            let src = &grad_out[(f * oh + y) * ow..(f * oh + y + 1) * ow];
            let dst = (f * ph + y + kh - 1) * pw + kw - 1;
            padded[dst..dst + ow].copy_from_slice(src);
        }
    }

    let mut flipped = vec![0.0; dims.filter_len()];
    for f in 0..f_out {
        for c in 0..c_in {
            for ky in 0..kh {
                for kx in 0..kw {
                    let src = ((f * c_in + c) * kh + ky) * kw + kx;
                    let dst = ((c * f_out + f) * kh + (kh - 1 - ky)) * kw + (kw - 1 - kx);
                    flipped[dst] = filters[src];
                }
            }
        }
    }

    let back = ConvDims {
        channels: f_out,
        height: ph,
        width: pw,
        filters: c_in,
        kernel_h: kh,
        kernel_w: kw,
    };
    conv2d(&padded, &flipped, back, cfg)
}

/// Gradient with respect to the filter bank: the valid correlation of every
/// input channel with every output-gradient plane, laid out like the filters.
pub fn conv2d_filter_grad(input: &[f32], grad_out: &[f32], dims: ConvDims, cfg: &KernelConfig) -> Vec<f32> {
    assert_eq!(input.len(), dims.input_len());
    assert_eq!(grad_out.len(), dims.output_len());
    let (c_in, f_out) = (dims.channels, dims.filters);
    let (kh, kw) = (dims.kernel_h, dims.kernel_w);
    let plane = dims.height * dims.width;

    // Each input channel is a one-channel image; the gradient planes are the
    // filters, so the output is [f_out, kh, kw] for that channel.
    let per_channel = ConvDims {
        channels: 1,
        height: dims.height,
        width: dims.width,
        filters: f_out,
        kernel_h: dims.out_h(),
        kernel_w: dims.out_w(),
    };
    let mut grad = vec![0.0; dims.filter_len()];
    for c in 0..c_in {
        let g = conv2d(&input[c * plane..(c + 1) * plane], grad_out, per_channel, cfg);
        for f in 0..f_out {
            let dst = (f * c_in + c) * kh * kw;
            grad[dst..dst + kh * kw].copy_from_slice(&g[f * kh * kw..(f + 1) * kh * kw]);
        }
    }
    grad
}
