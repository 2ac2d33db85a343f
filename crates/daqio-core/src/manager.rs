//! Device manager context.
//!
//! Owns the device-number counter and the registry of open devices. An
//! application creates one of these and passes it around; there is no
//! process-wide singleton, so two managers (e.g. in tests) never share
//! state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::info;

/// Transport a registered device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    UsbHid,
    Ethernet,
}

/// Identity of one registered device.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub product: String,
    pub interface: TransportKind,
    /// Serial number or MAC, whatever uniquely names the unit.
    pub unique_id: String,
}

struct ManagerInner {
    next_number: u32,
    devices: BTreeMap<u32, DeviceDescriptor>,
}

/// Registry of open devices, keyed by the number handed out at
/// registration.
pub struct DeviceManager {
    inner: Mutex<ManagerInner>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                next_number: 0,
                devices: BTreeMap::new(),
            }),
        }
    }

    /// Register a device and return its number. Numbers are never reused
    /// within one manager.
    pub fn register(&self, descriptor: DeviceDescriptor) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let number = inner.next_number;
        inner.next_number += 1;
        info!(number, product = %descriptor.product, "device registered");
        inner.devices.insert(number, descriptor);
        number
    }

    pub fn descriptor(&self, number: u32) -> Option<DeviceDescriptor> {
        self.inner.lock().unwrap().devices.get(&number).cloned()
    }

    /// Remove a device. Returns false if the number was unknown.
    pub fn remove(&self, number: u32) -> bool {
        self.inner.lock().unwrap().devices.remove(&number).is_some()
    }

    pub fn numbers(&self) -> Vec<u32> {
        self.inner.lock().unwrap().devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            product: "sim-1616".into(),
            interface: TransportKind::Usb,
            unique_id: id.into(),
        }
    }

    #[test]
    fn test_numbers_are_never_reused() {
        let manager = DeviceManager::new();
        let a = manager.register(descriptor("A"));
        let b = manager.register(descriptor("B"));
        assert_ne!(a, b);

        assert!(manager.remove(a));
        let c = manager.register(descriptor("C"));
        assert_ne!(c, a);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_managers_are_independent() {
        let m1 = DeviceManager::new();
        let m2 = DeviceManager::new();
        let a = m1.register(descriptor("A"));
        assert!(m2.descriptor(a).is_none());
        assert!(m1.descriptor(a).is_some());
    }

    #[test]
    fn test_remove_unknown_is_false() {
        let manager = DeviceManager::new();
        assert!(!manager.remove(42));
    }
}
