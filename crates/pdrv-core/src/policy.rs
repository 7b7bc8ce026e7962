//! Session policy
//!
//! The policy a session was admitted with: which devices it may see, how
//! verbose its devices report is, whether its DMA must be translated by an
//! IOMMU, and the quota it was granted. Matching a client label against the
//! driver's configuration happens before a session exists; this is the
//! result of that match.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::types::Resources;

/// Policy version tag, echoed in the devices report
pub type PolicyVersion = Option<String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Client label, used in log output
    pub label: String,
    /// Include extended device details in the report
    pub info: bool,
    /// Version tag echoed in the report
    pub version: PolicyVersion,
    /// DMA addresses must be translated by the session's protection domain
    pub iommu: bool,
    /// Log session operations at info level
    pub diag: bool,
    /// Bytes of DMA memory the session may allocate
    pub ram_quota: usize,
    /// Capability slots the session may fill
    pub cap_quota: usize,
    /// Device names visible to the session
    pub devices: Vec<String>,
}

impl SessionPolicy {
    pub fn new(label: &str, resources: Resources) -> Self {
        Self {
            label: label.into(),
            ram_quota: resources.ram_quota,
            cap_quota: resources.cap_quota,
            ..Self::default()
        }
    }

    /// Make `device` visible to the session
    pub fn with_device(mut self, device: &str) -> Self {
        self.devices.push(device.into());
        self
    }

    pub fn with_iommu(mut self, iommu: bool) -> Self {
        self.iommu = iommu;
        self
    }

    pub fn with_info(mut self, info: bool) -> Self {
        self.info = info;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, PlatformError> {
        serde_json::from_str(json).map_err(|e| PlatformError::InvalidConfig(format!("{}", e)))
    }

    /// Whether the device named `name` is visible to the session
    pub fn matches(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d == name)
    }

    pub fn resources(&self) -> Resources {
        Resources {
            ram_quota: self.ram_quota,
            cap_quota: self.cap_quota,
        }
    }
}
