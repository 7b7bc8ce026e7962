//! Devices report
//!
//! Each session publishes a snapshot of the devices visible to it: which of
//! them it owns, which are free to acquire, and (with the policy's `info`
//! flag) their resources. The snapshot is regenerated synchronously on
//! every ownership change and policy update. Readers always get a complete
//! snapshot; a new one replaces the old one in a single pointer swap.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use spin::RwLock;

use crate::device::{DeviceModel, IoMem};
use crate::error::PlatformError;
use crate::policy::SessionPolicy;
use crate::types::SessionId;

/// Report document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub devices: Vec<DeviceEntry>,
}

/// One visible device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    /// Owned by the reporting session
    pub owned: bool,
    /// Unowned at snapshot time
    pub acquirable: bool,
    /// Present only with the policy's `info` flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<DeviceInfo>,
}

/// Extended device details
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_device: Option<String>,
    pub io_mem: Vec<IoMem>,
    pub irqs: Vec<u32>,
    pub properties: BTreeMap<String, String>,
}

impl DevicesReport {
    /// Build the report `session` sees under `policy`.
    pub fn generate(devices: &DeviceModel, policy: &SessionPolicy, session: SessionId) -> Self {
        let devices = devices
            .iter()
            .filter(|d| policy.matches(d.name()))
            .map(|d| {
                let owner = d.owner();
                DeviceEntry {
                    name: d.name().into(),
                    device_type: d.device_type().into(),
                    owned: owner == Some(session),
                    acquirable: owner.is_none(),
                    info: policy.info.then(|| DeviceInfo {
                        control_device: d.config().control_device.clone(),
                        io_mem: d.config().io_mem.clone(),
                        irqs: d.config().irqs.clone(),
                        properties: d.config().properties.clone(),
                    }),
                }
            })
            .collect();

        Self {
            version: policy.version.clone(),
            devices,
        }
    }

    pub fn find(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Names of the devices owned by the reporting session
    pub fn owned(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .filter(|d| d.owned)
            .map(|d| d.name.as_str())
    }

    pub fn to_json(&self) -> Result<String, PlatformError> {
        serde_json::to_string(self).map_err(|e| PlatformError::Serialization(format!("{}", e)))
    }
}

/// A published report
#[derive(Debug)]
pub struct Snapshot {
    /// Incremented on every publish
    pub generation: u64,
    pub report: DevicesReport,
}

type Slot = Arc<RwLock<Arc<Snapshot>>>;

/// Publishing side, owned by the session
pub struct DevicesRom {
    current: Slot,
}

impl DevicesRom {
    pub fn new(report: DevicesReport) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(Snapshot {
                generation: 0,
                report,
            }))),
        }
    }

    /// Replace the current snapshot.
    pub fn publish(&self, report: DevicesReport) {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(Snapshot { generation, report });
    }

    /// Capability for consumers of the report
    pub fn reader(&self) -> DevicesRomReader {
        DevicesRomReader {
            current: self.current.clone(),
        }
    }
}

/// Read side of a session's devices report
#[derive(Clone)]
pub struct DevicesRomReader {
    current: Slot,
}

impl DevicesRomReader {
    /// The latest complete snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// The latest snapshot rendered as JSON
    pub fn to_json(&self) -> Result<String, PlatformError> {
        self.snapshot().report.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::types::Resources;
    use alloc::vec;

    fn setup() -> (DeviceModel, SessionPolicy) {
        let mut uart = DeviceConfig::new("uart0", "uart").with_control_device("smmu0");
        uart.irqs.push(32);
        let devices = DeviceModel::new(vec![
            uart,
            DeviceConfig::new("gpu0", "gpu"),
            DeviceConfig::new("eth0", "nic"),
        ])
        .unwrap();
        let policy = SessionPolicy::new("test", Resources::default())
            .with_device("uart0")
            .with_device("gpu0");
        (devices, policy)
    }

    #[test]
    fn test_generate_lists_visible_devices_only() {
        let (devices, policy) = setup();
        let me = devices.alloc_session_id();
        let other = devices.alloc_session_id();
        devices
            .compare_and_set_owner(devices.lookup("uart0").unwrap(), None, Some(me))
            .unwrap();
        devices
            .compare_and_set_owner(devices.lookup("gpu0").unwrap(), None, Some(other))
            .unwrap();

        let report = DevicesReport::generate(&devices, &policy, me);
        assert_eq!(report.devices.len(), 2);
        assert!(report.find("eth0").is_none());

        let uart = report.find("uart0").unwrap();
        assert!(uart.owned && !uart.acquirable);
        let gpu = report.find("gpu0").unwrap();
        assert!(!gpu.owned && !gpu.acquirable);
        assert_eq!(report.owned().collect::<Vec<_>>(), vec!["uart0"]);
    }

    #[test]
    fn test_info_flag_controls_details() {
        let (devices, mut policy) = setup();
        let me = devices.alloc_session_id();

        let terse = DevicesReport::generate(&devices, &policy, me);
        assert!(terse.find("uart0").unwrap().info.is_none());
        assert!(!terse.to_json().unwrap().contains("irqs"));

        policy.info = true;
        policy.version = Some("3".into());
        let verbose = DevicesReport::generate(&devices, &policy, me);
        let info = verbose.find("uart0").unwrap().info.as_ref().unwrap();
        assert_eq!(info.irqs, vec![32]);
        assert_eq!(info.control_device.as_deref(), Some("smmu0"));

        let json = verbose.to_json().unwrap();
        assert!(json.contains("\"version\":\"3\""));
        assert!(json.contains("\"type\":\"uart\""));
    }

    #[test]
    fn test_rom_reader_sees_latest_snapshot() {
        let rom = DevicesRom::new(DevicesReport::default());
        let reader = rom.reader();
        let before = reader.snapshot();
        assert_eq!(before.generation, 0);

        rom.publish(DevicesReport {
            version: Some("1".into()),
            devices: Vec::new(),
        });
        assert_eq!(reader.generation(), 1);
        assert_eq!(reader.snapshot().report.version.as_deref(), Some("1"));

        // A snapshot taken earlier stays intact
        assert_eq!(before.report.version, None);
    }
}
