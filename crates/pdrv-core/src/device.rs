//! Device registry
//!
//! The set of all devices known to the platform. The registry is shared by
//! every session (`Arc<DeviceModel>`) and outlives them. Device identity is
//! immutable; the only mutable field is the owner tag, which is changed
//! exclusively through [`DeviceModel::compare_and_set_owner`] so that two
//! sessions racing for the same device resolve to exactly one winner.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::types::SessionId;

const UNOWNED: u64 = 0;

/// MMIO window of a device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoMem {
    pub phys_addr: u64,
    pub size: usize,
}

/// Already-parsed description of one device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Globally unique name
    pub name: String,
    /// Device type, e.g. `"uart"`
    #[serde(rename = "type", default)]
    pub device_type: String,
    /// IOMMU/SMMU the device is translated by
    #[serde(default)]
    pub control_device: Option<String>,
    #[serde(default)]
    pub io_mem: Vec<IoMem>,
    #[serde(default)]
    pub irqs: Vec<u32>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn new(name: &str, device_type: &str) -> Self {
        Self {
            name: name.into(),
            device_type: device_type.into(),
            control_device: None,
            io_mem: Vec::new(),
            irqs: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Place the device behind the control device `name`
    pub fn with_control_device(mut self, name: &str) -> Self {
        self.control_device = Some(name.into());
        self
    }
}

/// A device and its owner tag
pub struct Device {
    config: DeviceConfig,
    owner: AtomicU64,
}

impl Device {
    fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            owner: AtomicU64::new(UNOWNED),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn device_type(&self) -> &str {
        &self.config.device_type
    }

    pub fn control_device(&self) -> Option<&str> {
        self.config.control_device.as_deref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current owner, if any
    pub fn owner(&self) -> Option<SessionId> {
        decode(self.owner.load(Ordering::Acquire))
    }
}

fn encode(owner: Option<SessionId>) -> u64 {
    owner.map_or(UNOWNED, |s| s.0)
}

fn decode(raw: u64) -> Option<SessionId> {
    (raw != UNOWNED).then_some(SessionId(raw))
}

/// Device registry shared by all sessions
pub struct DeviceModel {
    devices: Vec<Device>,
    next_session: AtomicU64,
}

impl DeviceModel {
    /// Build the registry, rejecting duplicate names.
    pub fn new(configs: Vec<DeviceConfig>) -> Result<Self, PlatformError> {
        let mut seen = BTreeSet::new();
        for config in &configs {
            if !seen.insert(config.name.as_str()) {
                return Err(PlatformError::InvalidConfig(format!(
                    "duplicate device name '{}'",
                    config.name
                )));
            }
        }
        Ok(Self {
            devices: configs.into_iter().map(Device::new).collect(),
            next_session: AtomicU64::new(1),
        })
    }

    /// Build the registry from a JSON array of [`DeviceConfig`].
    pub fn from_json(json: &str) -> Result<Self, PlatformError> {
        let configs: Vec<DeviceConfig> = serde_json::from_str(json)
            .map_err(|e| PlatformError::InvalidConfig(format!("{}", e)))?;
        Self::new(configs)
    }

    /// Hand out a fresh owner tag for a new session
    pub fn alloc_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub fn lookup(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Atomically replace the owner of `device` if it still is `current`.
    ///
    /// # Returns
    /// * `Ok(())` - Owner is now `new`
    /// * `Err(actual)` - Owner was `actual`, nothing changed
    pub fn compare_and_set_owner(
        &self,
        device: &Device,
        current: Option<SessionId>,
        new: Option<SessionId>,
    ) -> Result<(), Option<SessionId>> {
        device
            .owner
            .compare_exchange(
                encode(current),
                encode(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(decode)
    }

    /// Devices currently owned by `session`
    pub fn owned_by(&self, session: SessionId) -> impl Iterator<Item = &Device> {
        self.devices
            .iter()
            .filter(move |d| d.owner() == Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn model() -> DeviceModel {
        DeviceModel::new(vec![
            DeviceConfig::new("uart0", "uart").with_control_device("smmu0"),
            DeviceConfig::new("gpu0", "gpu"),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup_and_iterate() {
        let devices = model();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices.lookup("uart0").unwrap().control_device(), Some("smmu0"));
        assert_eq!(devices.lookup("gpu0").unwrap().control_device(), None);
        assert!(devices.lookup("eth0").is_none());
        assert_eq!(devices.iter().count(), 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = DeviceModel::new(vec![
            DeviceConfig::new("uart0", "uart"),
            DeviceConfig::new("uart0", "uart"),
        ]);
        assert!(matches!(result, Err(PlatformError::InvalidConfig(_))));
    }

    #[test]
    fn test_compare_and_set_owner() {
        let devices = model();
        let a = devices.alloc_session_id();
        let b = devices.alloc_session_id();
        assert_ne!(a, b);
        let gpu = devices.lookup("gpu0").unwrap();

        assert_eq!(devices.compare_and_set_owner(gpu, None, Some(a)), Ok(()));
        assert_eq!(gpu.owner(), Some(a));
        assert_eq!(
            devices.compare_and_set_owner(gpu, None, Some(b)),
            Err(Some(a))
        );
        assert_eq!(devices.owned_by(a).count(), 1);
        assert_eq!(devices.owned_by(b).count(), 0);

        assert_eq!(devices.compare_and_set_owner(gpu, Some(a), None), Ok(()));
        assert_eq!(gpu.owner(), None);
    }

    #[test]
    fn test_session_ids_start_at_one() {
        let devices = model();
        assert_eq!(devices.alloc_session_id(), SessionId(1));
    }

    #[test]
    fn test_from_json() {
        let devices = DeviceModel::from_json(
            r#"[
                {"name": "uart0", "type": "uart", "control_device": "smmu0",
                 "io_mem": [{"phys_addr": 268435456, "size": 4096}], "irqs": [32]},
                {"name": "gpu0"}
            ]"#,
        )
        .unwrap();

        let uart = devices.lookup("uart0").unwrap();
        assert_eq!(uart.device_type(), "uart");
        assert_eq!(uart.config().io_mem[0].size, 4096);
        assert_eq!(uart.config().irqs, vec![32]);
        assert_eq!(devices.lookup("gpu0").unwrap().device_type(), "");
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            DeviceModel::from_json("{not json"),
            Err(PlatformError::InvalidConfig(_))
        ));
    }
}
