//! Kernel programs and the per-session registry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::device::{Device, DeviceId};
use crate::error::{DeviceError, Result};
use crate::launch::{KernelArgs, NdRange};
use crate::sync::{read, write};

/// Declared kind of one positional kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Int,
    Float,
    Mem,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Int => write!(f, "int"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::Mem => write!(f, "mem"),
        }
    }
}

/// A program the simulated accelerator can run.
///
/// `execute` runs on the queue's worker thread with arguments already
/// checked against [`params`](KernelProgram::params).
pub trait KernelProgram: Send + Sync {
    /// Positional parameter list.
    fn params(&self) -> &[ParamKind];

    fn execute(&self, args: &KernelArgs, range: NdRange) -> Result<()>;
}

/// A program bound to one device under one name.
#[derive(Clone)]
pub struct CompiledKernel {
    name: Arc<str>,
    device: DeviceId,
    program: Arc<dyn KernelProgram>,
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("params", &self.program.params())
            .finish()
    }
}

impl CompiledKernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn params(&self) -> &[ParamKind] {
        self.program.params()
    }

    pub(crate) fn program(&self) -> &Arc<dyn KernelProgram> {
        &self.program
    }
}

/// Maps `(device, kernel name)` to a compiled kernel.
///
/// Each name can be registered once per device. Lookups on a device the
/// registry does not know, or of a name never registered, fail.
#[derive(Default)]
pub struct KernelRegistry {
    devices: RwLock<HashSet<DeviceId>>,
    kernels: RwLock<HashMap<(DeviceId, String), CompiledKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_device(&self, device: &Device) {
        write(&self.devices).insert(device.id());
    }

    fn check_device(&self, device: &Device) -> Result<()> {
        if read(&self.devices).contains(&device.id()) {
            Ok(())
        } else {
            Err(DeviceError::UnregisteredDevice(device.name().to_string()))
        }
    }

    pub fn register<P>(&self, device: &Device, name: &str, program: P) -> Result<CompiledKernel>
    where
        P: KernelProgram + 'static,
    {
        self.check_device(device)?;
        let mut kernels = write(&self.kernels);
        let key = (device.id(), name.to_string());
        if kernels.contains_key(&key) {
            return Err(DeviceError::DuplicateKernel {
                device: device.name().to_string(),
                kernel: name.to_string(),
            });
        }
        let kernel = CompiledKernel {
            name: Arc::from(name),
            device: device.id(),
            program: Arc::new(program),
        };
        tracing::debug!(device = device.name(), kernel = name, "kernel registered");
        kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub fn kernel(&self, device: &Device, name: &str) -> Result<CompiledKernel> {
        self.check_device(device)?;
        read(&self.kernels)
            .get(&(device.id(), name.to_string()))
            .cloned()
            .ok_or_else(|| DeviceError::UnregisteredKernel {
                device: device.name().to_string(),
                kernel: name.to_string(),
            })
    }

    pub fn contains(&self, device: &Device, name: &str) -> bool {
        read(&self.kernels).contains_key(&(device.id(), name.to_string()))
    }

    /// Registered names on `device`, sorted.
    pub fn names(&self, device: &Device) -> Vec<String> {
        let mut names: Vec<String> = read(&self.kernels)
            .keys()
            .filter(|(id, _)| *id == device.id())
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}
