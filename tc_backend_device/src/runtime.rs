//! Runtime session: the devices and the kernel registry.
//!
//! A session is created per process (or per test) and passed around as
//! `Arc<Runtime>`. Nothing in this crate is global.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::kernel::{CompiledKernel, KernelProgram, KernelRegistry};

pub struct Runtime {
    config: RuntimeConfig,
    devices: Vec<Device>,
    registry: KernelRegistry,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let registry = KernelRegistry::new();
        let devices: Vec<Device> = (0..config.device_count)
            .map(|i| Device::new(i, format!("{}:{i}", config.name_prefix), config.memory_bytes))
            .collect();
        for device in &devices {
            registry.add_device(device);
        }
        tracing::info!(devices = devices.len(), memory_bytes = config.memory_bytes, "runtime session started");
        Arc::new(Self {
            config,
            devices,
            registry,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or_else(|| {
            DeviceError::UnregisteredDevice(format!("{}:{index}", self.config.name_prefix))
        })
    }

    pub fn default_device(&self) -> Result<&Device> {
        self.device(0)
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn register<P>(&self, device: &Device, name: &str, program: P) -> Result<CompiledKernel>
    where
        P: KernelProgram + 'static,
    {
        self.registry.register(device, name, program)
    }

    pub fn kernel(&self, device: &Device, name: &str) -> Result<CompiledKernel> {
        self.registry.kernel(device, name)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for device in &self.devices {
            device.shutdown();
        }
        tracing::debug!("runtime session stopped");
    }
}
