//! Device error types

use thiserror::Error;

/// Errors raised by the device layer.
///
/// A second release of a freed resource is not an error: it is a silent
/// no-op guarded by atomics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device {0} is not registered with this runtime")]
    UnregisteredDevice(String),

    #[error("kernel `{kernel}` is not registered on device {device}")]
    UnregisteredKernel { device: String, kernel: String },

    #[error("kernel `{kernel}` is already registered on device {device}")]
    DuplicateKernel { device: String, kernel: String },

    #[error("cannot allocate {requested} bytes on {device}: {available} bytes available")]
    AllocationFailure {
        device: String,
        requested: usize,
        available: usize,
    },

    #[error("kernel `{kernel}` argument mismatch: {detail}")]
    ArgumentMismatch { kernel: String, detail: String },

    #[error("buffer holds {found} elements, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("command queue {0} is closed")]
    QueueClosed(String),

    #[error("memory object #{0} has been released")]
    Released(u64),

    #[error("kernel `{kernel}` failed: {message}")]
    KernelFailed { kernel: String, message: String },
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::AllocationFailure {
            device: "sim:0".to_string(),
            requested: 64,
            available: 16,
        };
        assert!(err.to_string().contains("64 bytes"));
        assert!(err.to_string().contains("16 bytes available"));

        let err = DeviceError::UnregisteredKernel {
            device: "sim:1".to_string(),
            kernel: "matmul".to_string(),
        };
        assert!(err.to_string().contains("`matmul`"));
        assert!(err.to_string().contains("sim:1"));

        assert!(DeviceError::Released(7).to_string().contains("#7"));
    }
}
