//! SIMD-accelerated lanes for the dense kernels.
//!
//! This module provides optimized implementations using platform-specific SIMD
//! instructions (AVX2 on x86_64, NEON on ARM). Each entry point picks its
//! implementation once per call. Lanes only use separately rounded add and
//! multiply, so the elementwise entry points (`binary_assign`, `axpy`) agree
//! with the scalar path bit for bit. `dot` and `sum` keep one partial sum per
//! lane and combine them at the end; that reassociation makes them differ
//! from a sequential scalar sum by a few ulps of the summed magnitudes.
//! They agree exactly whenever every partial sum is representable.

#![allow(unreachable_code)]

/// Check if AVX2 is available (x86_64 only).
#[cfg(target_arch = "x86_64")]
pub fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_avx2() -> bool {
    false
}

/// Check if NEON is available (ARM only).
#[cfg(target_arch = "aarch64")]
pub fn has_neon() -> bool {
    // NEON is mandatory on aarch64
    true
}

#[cfg(not(target_arch = "aarch64"))]
pub fn has_neon() -> bool {
    false
}

/// Elementwise binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline(always)]
    pub fn apply(self, x: f32, y: f32) -> f32 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
        }
    }

    /// Stable integer code, used as a kernel argument on devices.
    pub fn code(self) -> i32 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BinaryOp::Add),
            1 => Some(BinaryOp::Sub),
            2 => Some(BinaryOp::Mul),
            3 => Some(BinaryOp::Div),
            _ => None,
        }
    }
}

// === Dispatchers ===

/// In-place elementwise combination: `acc[i] = op(acc[i], b[i])`.
pub fn binary_assign(op: BinaryOp, acc: &mut [f32], b: &[f32]) {
    debug_assert_eq!(acc.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            // SAFETY: We've checked AVX2 is available
            unsafe { binary_assign_avx2(op, acc, b) };
            return;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is mandatory on aarch64
        unsafe { binary_assign_neon(op, acc, b) };
        return;
    }

    binary_assign_scalar(op, acc, b);
}

/// Scaled accumulation: `acc[i] += alpha * x[i]`.
pub fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) {
    debug_assert_eq!(acc.len(), x.len());

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            unsafe { axpy_avx2(acc, alpha, x) };
            return;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        unsafe { axpy_neon(acc, alpha, x) };
        return;
    }

    axpy_scalar(acc, alpha, x);
}

/// Inner product of two equally long slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { dot_avx2(a, b) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_neon(a, b) };
    }

    dot_scalar(a, b)
}

/// SIMD-accelerated sum reduction
pub fn sum(a: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { sum_avx2(a) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { sum_neon(a) };
    }

    sum_scalar(a)
}

// === Scalar implementations ===

fn binary_assign_scalar(op: BinaryOp, acc: &mut [f32], b: &[f32]) {
    for (x, &y) in acc.iter_mut().zip(b) {
        *x = op.apply(*x, y);
    }
}

fn axpy_scalar(acc: &mut [f32], alpha: f32, x: &[f32]) {
    for (c, &v) in acc.iter_mut().zip(x) {
        *c += alpha * v;
    }
}

fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sum_scalar(a: &[f32]) -> f32 {
    a.iter().sum()
}

// === AVX2 implementations (x86_64) ===

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn binary_assign_avx2(op: BinaryOp, acc: &mut [f32], b: &[f32]) {
    use std::arch::x86_64::*;

    let n = acc.len().min(b.len());
    let chunks = n / 8;

    let acc_ptr = acc.as_mut_ptr();
    let b_ptr = b.as_ptr();

    macro_rules! lanes {
        ($intrinsic:ident) => {
            for i in 0..chunks {
                let offset = i * 8;
                let va = _mm256_loadu_ps(acc_ptr.add(offset));
                let vb = _mm256_loadu_ps(b_ptr.add(offset));
                _mm256_storeu_ps(acc_ptr.add(offset), $intrinsic(va, vb));
            }
        };
    }

    match op {
        BinaryOp::Add => lanes!(_mm256_add_ps),
        BinaryOp::Sub => lanes!(_mm256_sub_ps),
        BinaryOp::Mul => lanes!(_mm256_mul_ps),
        BinaryOp::Div => lanes!(_mm256_div_ps),
    }

    // Handle remainder
    for i in chunks * 8..n {
        *acc_ptr.add(i) = op.apply(*acc_ptr.add(i), *b_ptr.add(i));
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn axpy_avx2(acc: &mut [f32], alpha: f32, x: &[f32]) {
    use std::arch::x86_64::*;

    let n = acc.len().min(x.len());
    let chunks = n / 8;

    let acc_ptr = acc.as_mut_ptr();
    let x_ptr = x.as_ptr();
    let va = _mm256_set1_ps(alpha);

    for i in 0..chunks {
        let offset = i * 8;
        let vc = _mm256_loadu_ps(acc_ptr.add(offset));
        let vx = _mm256_loadu_ps(x_ptr.add(offset));
        let vr = _mm256_add_ps(vc, _mm256_mul_ps(va, vx));
        _mm256_storeu_ps(acc_ptr.add(offset), vr);
    }

    for i in chunks * 8..n {
        *acc_ptr.add(i) += alpha * *x_ptr.add(i);
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len().min(b.len());
    let chunks = n / 8;

    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
    }

    let mut result = horizontal_sum_avx2(acc);
    for i in chunks * 8..n {
        result += *a_ptr.add(i) * *b_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sum_avx2(a: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;

    let a_ptr = a.as_ptr();
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        acc = _mm256_add_ps(acc, va);
    }

    let mut result = horizontal_sum_avx2(acc);
    for i in chunks * 8..n {
        result += *a_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn horizontal_sum_avx2(acc: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let low = _mm256_castps256_ps128(acc);
    let high = _mm256_extractf128_ps(acc, 1);
    let sum128 = _mm_add_ps(low, high);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    _mm_cvtss_f32(sum32)
}

// === NEON implementations (aarch64) ===

#[cfg(target_arch = "aarch64")]
unsafe fn binary_assign_neon(op: BinaryOp, acc: &mut [f32], b: &[f32]) {
    use std::arch::aarch64::*;

    let n = acc.len().min(b.len());
    let chunks = n / 4;

    let acc_ptr = acc.as_mut_ptr();
    let b_ptr = b.as_ptr();

    macro_rules! lanes {
        ($intrinsic:ident) => {
            for i in 0..chunks {
                let offset = i * 4;
                let va = vld1q_f32(acc_ptr.add(offset));
                let vb = vld1q_f32(b_ptr.add(offset));
                vst1q_f32(acc_ptr.add(offset), $intrinsic(va, vb));
            }
        };
    }

    match op {
        BinaryOp::Add => lanes!(vaddq_f32),
        BinaryOp::Sub => lanes!(vsubq_f32),
        BinaryOp::Mul => lanes!(vmulq_f32),
        BinaryOp::Div => lanes!(vdivq_f32),
    }

    for i in chunks * 4..n {
        *acc_ptr.add(i) = op.apply(*acc_ptr.add(i), *b_ptr.add(i));
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn axpy_neon(acc: &mut [f32], alpha: f32, x: &[f32]) {
    use std::arch::aarch64::*;

    let n = acc.len().min(x.len());
    let chunks = n / 4;

    let acc_ptr = acc.as_mut_ptr();
    let x_ptr = x.as_ptr();
    let va = vdupq_n_f32(alpha);

    for i in 0..chunks {
        let offset = i * 4;
        let vc = vld1q_f32(acc_ptr.add(offset));
        let vx = vld1q_f32(x_ptr.add(offset));
        vst1q_f32(acc_ptr.add(offset), vaddq_f32(vc, vmulq_f32(va, vx)));
    }

    for i in chunks * 4..n {
        *acc_ptr.add(i) += alpha * *x_ptr.add(i);
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len().min(b.len());
    let chunks = n / 4;

    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        let vb = vld1q_f32(b_ptr.add(i * 4));
        acc = vaddq_f32(acc, vmulq_f32(va, vb));
    }

    let mut result = vaddvq_f32(acc);
    for i in chunks * 4..n {
        result += *a_ptr.add(i) * *b_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "aarch64")]
unsafe fn sum_neon(a: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;

    let a_ptr = a.as_ptr();
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        acc = vaddq_f32(acc, va);
    }

    // Horizontal sum
    let mut result = vaddvq_f32(acc);

    for i in chunks * 4..n {
        result += *a_ptr.add(i);
    }

    result
}
