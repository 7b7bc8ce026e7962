//! Platform Driver Core - Per-Client Session Arbiter
//!
//! A platform driver hands devices out to clients. Each client talks to the
//! driver through one [`Session`], which arbitrates:
//!
//! - exclusive ownership of devices across all sessions
//! - DMA-capable buffers charged to the client's quota
//! - one IOMMU translation domain per control device, kept in sync with the
//!   session's buffers
//! - the client's devices report
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Session                            │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │CapabilitySpace│    │  Quota guards │                   │
//! │   │  device / dma │    │   RAM / caps  │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │BufferRegistry │───▶│DomainRegistry │── add/remove ──┐  │
//! │   │  (DmaBuffer)  │    │(Translation-  │    range       │  │
//! │   └───────────────┘    │   Domain)     │                │  │
//! │          │             └───────────────┘                │  │
//! │          ▼                                              │  │
//! │   ┌───────────────┐    ┌───────────────┐                │  │
//! │   │   DevicePd    │    │  DevicesRom   │                │  │
//! │   │ (IOVA alloc)  │    │   (report)    │                │  │
//! │   └───────────────┘    └───────────────┘                │  │
//! └─────────────────────────────────────────────────────────│──┘
//!          │ shared by all sessions                         │
//!          ▼                                                ▼
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │   DeviceModel    │  │     Platform     │  │  ControlDevice   │
//! │ (owner tags, CAS)│  │ (enable/disable, │  │ (IOMMU domains)  │
//! │                  │  │   DMA memory)    │  │                  │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers, capability wrappers, resources
//! - `capability` - Per-session capability space and `cap_check`
//! - `quota` - RAM and capability quota guards
//! - `device` - Shared device model with atomic ownership
//! - `control` - Registry of control devices
//! - `dma` - DMA buffer registry
//! - `device_pd` - Device-visible address assignment
//! - `domain` - Translation domains and their registry
//! - `policy` - Session policy
//! - `report` - Devices report and its publisher
//! - `session` - The arbiter
//! - `invariants` - Runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod capability;
pub mod control;
pub mod device;
pub mod device_pd;
pub mod dma;
pub mod domain;
pub mod error;
pub mod invariants;
pub mod policy;
pub mod quota;
pub mod report;
pub mod session;
pub mod types;

pub use capability::{cap_check, CapError, CapHandle, Capability, CapabilitySpace};
pub use control::ControlDevices;
pub use device::{Device, DeviceConfig, DeviceModel, IoMem};
pub use device_pd::{DevicePd, IOVA_BASE, IOVA_LIMIT};
pub use dma::{BufferRegistry, DmaBuffer};
pub use domain::{DomainRegistry, TranslationDomain};
pub use error::PlatformError;
pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use policy::{PolicyVersion, SessionPolicy};
pub use quota::{CapQuotaGuard, QuotaGuard, RamQuotaGuard, Reservation};
pub use report::{DeviceEntry, DeviceInfo, DevicesReport, DevicesRom, DevicesRomReader, Snapshot};
pub use session::{DeviceComponent, Session, SessionEnv};
pub use types::{
    BufferId, CapSlot, ComponentId, DeviceCapability, DmaCapability, ObjectType, Resources,
    SessionId,
};

pub use pdrv_hal::{Cache, ControlDevice, DmaRange, DomainId, HalError, Platform, PAGE_SIZE};
