//! Runtime session configuration.

/// Shape of the simulated accelerator set a [`Runtime`](crate::Runtime)
/// brings up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of devices to create.
    pub device_count: usize,
    /// Memory capacity of each device, in bytes.
    pub memory_bytes: usize,
    /// Devices are named `{prefix}:{index}`.
    pub name_prefix: String,
}

const DEFAULT_DEVICE_COUNT: usize = 1;
const DEFAULT_MEMORY_MB: usize = 256;

impl Default for RuntimeConfig {
    /// Defaults, overridable with `TC_DEVICE_COUNT` and `TC_DEVICE_MEMORY_MB`.
    fn default() -> Self {
        Self {
            device_count: env_usize("TC_DEVICE_COUNT").unwrap_or(DEFAULT_DEVICE_COUNT).max(1),
            memory_bytes: env_usize("TC_DEVICE_MEMORY_MB").unwrap_or(DEFAULT_MEMORY_MB) << 20,
            name_prefix: "sim".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = count.max(1);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: usize) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, raw = %raw, "ignoring unparsable runtime setting");
            None
        }
    }
}
