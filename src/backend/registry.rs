//! Process-wide device registry.
//!
//! Lazily initialized on first use; entries are never removed. Additional
//! device kinds enter through the device trait rather than the registry,
//! which only enumerates the devices compiled into the crate.

use crate::backend::backend::{Backend, Device, DeviceType};
use std::sync::OnceLock;

pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    fn new() -> Registry {
        let mut devices: Vec<Device> = Vec::new();

        #[cfg(feature = "cpu")]
        devices.push(crate::backend::cpu::cpu_device());

        Registry { devices }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_get(&self, index: usize) -> Option<Device> {
        self.devices.get(index).cloned()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_by_type(&self, device_type: DeviceType) -> Option<Device> {
        self.devices.iter().find(|d| d.device_type() == device_type).cloned()
    }
}

/// The global registry; initialization is thread-safe.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

/// Initializes a backend for the first registered device of the given type.
pub fn backend_init_by_type(device_type: DeviceType) -> Option<Backend> {
    registry().device_by_type(device_type).map(|d| d.init_backend())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "cpu")]
    fn test_registry_has_cpu() {
        let reg = registry();
        assert!(reg.device_count() >= 1);
        let dev = reg.device_by_type(DeviceType::Cpu).unwrap();
        assert_eq!(dev.name(), "CPU");

        let backend = backend_init_by_type(DeviceType::Cpu).unwrap();
        assert_eq!(backend.device(), dev);
        assert!(backend.supports_buft(&dev.buffer_type()));
    }
}
