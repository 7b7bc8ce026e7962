//! Registry of control devices (IOMMUs/SMMUs) present on the platform
//!
//! Control devices may appear or vanish at runtime; sessions pick up the
//! change in [`Session::update_control_devices`](crate::Session::update_control_devices).

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use pdrv_hal::ControlDevice;
use spin::RwLock;

#[derive(Default)]
pub struct ControlDevices {
    devices: RwLock<BTreeMap<String, Arc<dyn ControlDevice>>>,
}

impl ControlDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control device under its own name, replacing any
    /// previous device of that name.
    pub fn register(&self, device: Arc<dyn ControlDevice>) -> Option<Arc<dyn ControlDevice>> {
        let name = device.name().to_string();
        self.devices.write().insert(name, device)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ControlDevice>> {
        self.devices.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ControlDevice>> {
        self.devices.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

/// Whether two handles refer to the same control device object
pub(crate) fn same_device(a: &Arc<dyn ControlDevice>, b: &Arc<dyn ControlDevice>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
