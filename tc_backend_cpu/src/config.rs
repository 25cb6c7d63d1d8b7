//! Tuning knobs for the parallel kernels.
//!
//! None of these values affect results: they only decide where the fork-join
//! recursion stops splitting. Each field can be overridden from the
//! environment so thresholds can be tuned without rebuilding.

use std::sync::OnceLock;

/// Split thresholds for the dense kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Below this `rows * n * p` complexity a matmul runs on the calling thread.
    pub matmul_sequential_threshold: usize,
    /// Row ranges at or below this size are not bisected further.
    pub matmul_split_rows: usize,
    /// Minimum number of output elements handled by one transpose leaf.
    pub transpose_split: usize,
    /// Minimum number of input elements summed by one reduction leaf.
    pub reduce_split: usize,
    /// Minimum multiply-adds performed by one convolution leaf.
    pub conv_split: usize,
    /// Minimum number of elements handled by one elementwise leaf.
    pub elementwise_split: usize,
}

const DEFAULT_MATMUL_THRESHOLD: usize = 1 << 16;
const DEFAULT_MATMUL_SPLIT_ROWS: usize = 16;
const DEFAULT_TRANSPOSE_SPLIT: usize = 1 << 14;
const DEFAULT_REDUCE_SPLIT: usize = 1 << 15;
const DEFAULT_CONV_SPLIT: usize = 1 << 16;
const DEFAULT_ELEMENTWISE_SPLIT: usize = 1 << 15;

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            matmul_sequential_threshold: env_usize("TC_MATMUL_THRESHOLD", DEFAULT_MATMUL_THRESHOLD),
            matmul_split_rows: env_usize("TC_MATMUL_SPLIT_ROWS", DEFAULT_MATMUL_SPLIT_ROWS),
            transpose_split: env_usize("TC_TRANSPOSE_SPLIT", DEFAULT_TRANSPOSE_SPLIT),
            reduce_split: env_usize("TC_REDUCE_SPLIT", DEFAULT_REDUCE_SPLIT),
            conv_split: env_usize("TC_CONV_SPLIT", DEFAULT_CONV_SPLIT),
            elementwise_split: env_usize("TC_ELEMENTWISE_SPLIT", DEFAULT_ELEMENTWISE_SPLIT),
        }
    }
}

impl KernelConfig {
    /// Process-wide snapshot of [`KernelConfig::default`], read from the
    /// environment once.
    pub fn shared() -> &'static KernelConfig {
        static SHARED: OnceLock<KernelConfig> = OnceLock::new();
        SHARED.get_or_init(|| {
            let cfg = KernelConfig::default();
            tracing::debug!(?cfg, "kernel config loaded");
            cfg
        })
    }

    /// Never split: every kernel runs on the calling thread.
    pub fn sequential() -> Self {
        Self {
            matmul_sequential_threshold: usize::MAX,
            matmul_split_rows: usize::MAX,
            transpose_split: usize::MAX,
            reduce_split: usize::MAX,
            conv_split: usize::MAX,
            elementwise_split: usize::MAX,
        }
    }

    /// Split as finely as possible. Mostly useful for exercising the
    /// recursion on tiny inputs.
    pub fn eager() -> Self {
        Self {
            matmul_sequential_threshold: 0,
            matmul_split_rows: 1,
            transpose_split: 1,
            reduce_split: 1,
            conv_split: 1,
            elementwise_split: 1,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw = %raw, "ignoring unparsable kernel threshold");
                default
            }
        },
        Err(_) => default,
    }
}
