//! Core session types
//!
//! Pure data shared by the registries and the session arbiter.

use serde::{Deserialize, Serialize};

use crate::capability::CapHandle;

/// Capability slot index (per-session)
pub type CapSlot = u32;

/// Session identifier
///
/// Doubles as the owner tag stored in the device registry. Zero is never
/// handed out; it encodes "unowned".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Identifier of a DMA buffer within its session
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

/// Identifier of a device component within its session
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub u64);

/// Object types that capabilities can reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    /// Acquired device (device component)
    Device = 1,
    /// DMA buffer
    DmaBuffer = 2,
}

/// Capability to an acquired device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceCapability(pub(crate) CapHandle);

impl DeviceCapability {
    pub fn handle(&self) -> CapHandle {
        self.0
    }
}

/// Capability to a DMA buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaCapability(pub(crate) CapHandle);

impl DmaCapability {
    pub fn handle(&self) -> CapHandle {
        self.0
    }
}

/// Quota a session is granted, or gives back on teardown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Bytes of DMA memory
    pub ram_quota: usize,
    /// Capability slots
    pub cap_quota: usize,
}
