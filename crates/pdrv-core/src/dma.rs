//! DMA buffer registry
//!
//! Tracks every DMA-capable memory region a session has allocated together
//! with its device-visible address.

use alloc::collections::BTreeMap;
use pdrv_hal::{DmaRange, RamDataspace};

use crate::types::BufferId;

/// One DMA buffer owned by a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    /// Backing memory
    pub ds: RamDataspace,
    /// Device-visible address, assigned once
    pub dma_addr: u64,
    /// Page-aligned size in bytes
    pub size: usize,
}

impl DmaBuffer {
    /// The range translation domains must map for this buffer
    pub fn range(&self) -> DmaRange {
        DmaRange::new(self.dma_addr, self.size)
    }
}

#[derive(Default)]
pub struct BufferRegistry {
    buffers: BTreeMap<BufferId, DmaBuffer>,
    next_id: u64,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buffer: DmaBuffer) -> BufferId {
        self.next_id += 1;
        let id = BufferId(self.next_id);
        self.buffers.insert(id, buffer);
        id
    }

    pub fn get(&self, id: BufferId) -> Option<&DmaBuffer> {
        self.buffers.get(&id)
    }

    pub fn remove(&mut self, id: BufferId) -> Option<DmaBuffer> {
        self.buffers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &DmaBuffer)> {
        self.buffers.iter().map(|(&id, b)| (id, b))
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.keys().copied()
    }

    /// Ranges of all buffers, in registry order
    pub fn ranges(&self) -> impl Iterator<Item = DmaRange> + '_ {
        self.buffers.values().map(DmaBuffer::range)
    }

    /// Sum of all buffer sizes
    pub fn total_bytes(&self) -> usize {
        self.buffers.values().map(|b| b.size).sum()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use pdrv_hal::Cache;

    fn buffer(addr: u64, size: usize) -> DmaBuffer {
        DmaBuffer {
            ds: RamDataspace {
                id: addr,
                phys_addr: addr,
                size,
                cache: Cache::Uncached,
            },
            dma_addr: addr,
            size,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut registry = BufferRegistry::new();
        let a = registry.insert(buffer(0x1000, 0x1000));
        let b = registry.insert(buffer(0x2000, 0x2000));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_bytes(), 0x3000);
        assert_eq!(registry.get(b).unwrap().range(), DmaRange::new(0x2000, 0x2000));

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.ids().collect::<Vec<_>>(), alloc::vec![b]);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut registry = BufferRegistry::new();
        let a = registry.insert(buffer(0x1000, 0x1000));
        registry.remove(a);
        let b = registry.insert(buffer(0x1000, 0x1000));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ranges() {
        let mut registry = BufferRegistry::new();
        registry.insert(buffer(0x1000, 0x1000));
        registry.insert(buffer(0x8000, 0x3000));
        let ranges: Vec<DmaRange> = registry.ranges().collect();
        assert_eq!(
            ranges,
            alloc::vec![DmaRange::new(0x1000, 0x1000), DmaRange::new(0x8000, 0x3000)]
        );
    }
}
