//! Device protection domain
//!
//! Assigns device-visible addresses to DMA buffers. Without an IOMMU the
//! physical address is the device address. With an IOMMU the session owns a
//! private I/O virtual address space: the physical address is reused when
//! that window is still free there, otherwise the first gap that fits is
//! taken.

use alloc::collections::BTreeMap;
use pdrv_hal::{DmaRange, RamDataspace, PAGE_SIZE};

use crate::error::PlatformError;

/// Lowest I/O virtual address handed out; keeps `0` unassigned
pub const IOVA_BASE: u64 = PAGE_SIZE as u64;

/// End of the I/O virtual window (32-bit DMA masters)
pub const IOVA_LIMIT: u64 = 1 << 32;

pub struct DevicePd {
    iommu: bool,
    /// Attached windows: start -> size
    mappings: BTreeMap<u64, usize>,
}

impl DevicePd {
    pub fn new(iommu: bool) -> Self {
        Self {
            iommu,
            mappings: BTreeMap::new(),
        }
    }

    pub fn iommu(&self) -> bool {
        self.iommu
    }

    /// Make `ds` reachable for devices and return its device address.
    pub fn attach_dma_mem(&mut self, ds: &RamDataspace) -> Result<u64, PlatformError> {
        if !self.iommu {
            if ds.phys_addr == 0 {
                log::error!("DMA memory at physical address 0 cannot be handed out");
                return Err(PlatformError::OutOfMemory);
            }
            return Ok(ds.phys_addr);
        }

        let identity = DmaRange::new(ds.phys_addr, ds.size);
        let addr = if ds.phys_addr >= IOVA_BASE
            && identity.end() <= IOVA_LIMIT
            && self.is_free(&identity)
        {
            ds.phys_addr
        } else {
            self.find_gap(ds.size).ok_or(PlatformError::OutOfMemory)?
        };

        self.mappings.insert(addr, ds.size);
        Ok(addr)
    }

    /// Release the window attached at `addr`.
    pub fn free_dma_mem(&mut self, addr: u64) {
        if self.iommu && self.mappings.remove(&addr).is_none() {
            log::warn!("no DMA window attached at {:#x}", addr);
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn is_free(&self, range: &DmaRange) -> bool {
        self.mappings
            .range(..range.end())
            .next_back()
            .map_or(true, |(&start, &size)| start + size as u64 <= range.start)
    }

    fn find_gap(&self, size: usize) -> Option<u64> {
        let size = size as u64;
        let mut candidate = IOVA_BASE;
        for (&start, &len) in &self.mappings {
            if candidate.checked_add(size)? <= start {
                break;
            }
            candidate = candidate.max(start + len as u64);
        }
        (candidate.checked_add(size)? <= IOVA_LIMIT).then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdrv_hal::Cache;

    fn ds(phys_addr: u64, size: usize) -> RamDataspace {
        RamDataspace {
            id: phys_addr,
            phys_addr,
            size,
            cache: Cache::Cached,
        }
    }

    #[test]
    fn test_without_iommu_uses_physical_address() {
        let mut pd = DevicePd::new(false);
        assert_eq!(pd.attach_dma_mem(&ds(0x4000_0000, 0x1000)), Ok(0x4000_0000));
        assert_eq!(pd.mapping_count(), 0);
    }

    #[test]
    fn test_without_iommu_rejects_address_zero() {
        let mut pd = DevicePd::new(false);
        assert_eq!(
            pd.attach_dma_mem(&ds(0, 0x1000)),
            Err(PlatformError::OutOfMemory)
        );
    }

    #[test]
    fn test_iommu_prefers_identity_mapping() {
        let mut pd = DevicePd::new(true);
        assert_eq!(pd.attach_dma_mem(&ds(0x4000_0000, 0x2000)), Ok(0x4000_0000));
        assert_eq!(pd.mapping_count(), 1);
    }

    #[test]
    fn test_iommu_falls_back_to_first_gap() {
        let mut pd = DevicePd::new(true);
        // Physical 0 and above-window memory both need a fresh IOVA
        assert_eq!(pd.attach_dma_mem(&ds(0, 0x1000)), Ok(IOVA_BASE));
        assert_eq!(
            pd.attach_dma_mem(&ds(0x1_0000_0000, 0x1000)),
            Ok(IOVA_BASE + 0x1000)
        );
        // Colliding identity window
        assert_eq!(pd.attach_dma_mem(&ds(IOVA_BASE, 0x1000)), Ok(IOVA_BASE + 0x2000));
    }

    #[test]
    fn test_iommu_reuses_freed_window() {
        let mut pd = DevicePd::new(true);
        let a = pd.attach_dma_mem(&ds(0, 0x1000)).unwrap();
        let b = pd.attach_dma_mem(&ds(0, 0x1000)).unwrap();
        pd.free_dma_mem(a);

        assert_eq!(pd.attach_dma_mem(&ds(0, 0x1000)), Ok(a));
        assert_ne!(a, b);
        assert_eq!(pd.mapping_count(), 2);
    }

    #[test]
    fn test_iommu_window_exhaustion() {
        let mut pd = DevicePd::new(true);
        let whole = (IOVA_LIMIT - IOVA_BASE) as usize;
        assert_eq!(pd.attach_dma_mem(&ds(0, whole)), Ok(IOVA_BASE));
        assert_eq!(
            pd.attach_dma_mem(&ds(0, 0x1000)),
            Err(PlatformError::OutOfMemory)
        );
    }
}
