//! Hardware collaborator traits for the platform driver
//!
//! This crate defines the seams between the session arbiter and the hardware
//! it does not own:
//!
//! - [`Platform`]: device enable/disable hooks (power, clocks, reset) and the
//!   RAM allocator that backs DMA buffers
//! - [`ControlDevice`]: an IOMMU/SMMU unit that provides translation domains
//!
//! # Platform Implementations
//!
//! - **Board drivers**: register programming for a concrete SoC
//! - **Mock**: `pdrv-hal-mock`, used by the session tests

#![no_std]

use core::fmt;
use serde::{Deserialize, Serialize};

/// Granularity of DMA allocations and translation ranges.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to the next page boundary.
pub fn page_align(size: usize) -> Option<usize> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

// ============================================================================
// Memory types
// ============================================================================

/// Caching attribute requested for a DMA buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cache {
    /// Normal cached memory
    #[default]
    Cached,
    /// Device memory, caches bypassed
    Uncached,
    /// Uncached with write combining
    WriteCombined,
}

/// A device-visible address range `[start, start + size)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DmaRange {
    /// First device-visible address
    pub start: u64,
    /// Length in bytes
    pub size: usize,
}

impl DmaRange {
    pub fn new(start: u64, size: usize) -> Self {
        Self { start, size }
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    /// Whether two ranges share at least one byte
    pub fn overlaps(&self, other: &DmaRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Backing memory handed out by [`Platform::alloc_dma_ram`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamDataspace {
    /// Platform-local identifier of the allocation
    pub id: u64,
    /// Physical base address
    pub phys_addr: u64,
    /// Size in bytes (page aligned)
    pub size: usize,
    /// Caching attribute the memory was allocated with
    pub cache: Cache,
}

/// Identifier of a translation domain within one control device
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

// ============================================================================
// Collaborator traits
// ============================================================================

/// Platform trait
///
/// Implementations provide the board-specific side effects of device
/// ownership changes and the memory that DMA buffers are carved from.
/// All calls are synchronous and must not block indefinitely.
pub trait Platform: Send + Sync + 'static {
    /// Power up, clock and take the device out of reset.
    ///
    /// # Returns
    /// * `Ok(())` - Device is usable
    /// * `Err(HalError::DeviceFailure)` - Device could not be enabled
    fn enable_device(&self, device: &str) -> Result<(), HalError>;

    /// Put the device back into reset and power it down.
    fn disable_device(&self, device: &str) -> Result<(), HalError>;

    /// Allocate physically contiguous memory suitable for DMA.
    ///
    /// # Arguments
    /// * `size` - Page-aligned size in bytes
    /// * `cache` - Requested caching attribute
    ///
    /// # Returns
    /// * `Ok(RamDataspace)` - The allocation
    /// * `Err(HalError::OutOfMemory)` - No backing memory left
    fn alloc_dma_ram(&self, size: usize, cache: Cache) -> Result<RamDataspace, HalError>;

    /// Return memory obtained from [`Platform::alloc_dma_ram`].
    fn free_dma_ram(&self, ds: RamDataspace);
}

/// An IOMMU/SMMU unit providing translation domains for downstream devices.
///
/// The session arbiter pushes every range mutation; a domain never pulls
/// state from the buffer registry.
pub trait ControlDevice: Send + Sync {
    /// Stable name devices refer to, e.g. `"smmu0"`
    fn name(&self) -> &str;

    /// Create an empty translation domain.
    fn open_domain(&self) -> Result<DomainId, HalError>;

    /// Discard a domain. All ranges have been removed beforehand.
    fn close_domain(&self, domain: DomainId);

    /// Map `range` one-to-one in `domain`.
    fn add_range(&self, domain: DomainId, range: DmaRange);

    /// Unmap `range` from `domain`.
    fn remove_range(&self, domain: DomainId, range: DmaRange);

    /// Route the device's transactions through `domain`.
    fn attach_device(&self, domain: DomainId, device: &str) -> Result<(), HalError>;

    /// Stop routing the device through `domain`.
    fn detach_device(&self, domain: DomainId, device: &str);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Backing memory exhausted
    OutOfMemory,
    /// Enable/attach of a device failed
    DeviceFailure,
    /// Operation not provided by this platform
    NotSupported,
    /// Malformed request
    InvalidArgument,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::OutOfMemory => write!(f, "out of memory"),
            HalError::DeviceFailure => write!(f, "device failure"),
            HalError::NotSupported => write!(f, "not supported"),
            HalError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), Some(0));
        assert_eq!(page_align(1), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(page_align(usize::MAX), None);
    }

    #[test]
    fn test_range_overlap() {
        let a = DmaRange::new(0x1000, 0x1000);
        let b = DmaRange::new(0x2000, 0x1000);
        let c = DmaRange::new(0x1800, 0x1000);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert_eq!(a.end(), 0x2000);
    }
}
