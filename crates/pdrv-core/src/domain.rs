//! Translation domains
//!
//! A [`TranslationDomain`] is a session's context on one control device. It
//! is opened lazily when the session acquires the first device behind that
//! control device and is seeded with every DMA buffer the session already
//! owns. From then on the session pushes each buffer allocation and free to
//! every live domain through [`DomainRegistry::add_range_all`] and
//! [`DomainRegistry::remove_range_all`].
//!
//! Teardown mirrors construction: dropping a domain detaches its remaining
//! devices, removes every range it still maps, then closes the domain on the
//! control device.

use alloc::collections::btree_map::Entry;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use pdrv_hal::{ControlDevice, DmaRange, DomainId, HalError};

use crate::control::same_device;
use crate::dma::BufferRegistry;
use crate::error::PlatformError;

pub struct TranslationDomain {
    name: String,
    control: Arc<dyn ControlDevice>,
    id: DomainId,
    /// Ranges currently mapped on the control device
    ranges: BTreeSet<DmaRange>,
    /// Devices currently routed through the domain
    devices: BTreeSet<String>,
}

impl TranslationDomain {
    /// Open a domain on `control` and map every buffer in `buffers`.
    pub fn open(
        control: Arc<dyn ControlDevice>,
        buffers: &BufferRegistry,
    ) -> Result<Self, PlatformError> {
        let id = control.open_domain().map_err(|e| {
            log::warn!("opening domain on {} failed: {}", control.name(), e);
            PlatformError::DeviceEnableFailed
        })?;

        let mut domain = Self {
            name: control.name().to_string(),
            control,
            id,
            ranges: BTreeSet::new(),
            devices: BTreeSet::new(),
        };
        for range in buffers.ranges() {
            domain.add_range(range);
        }
        Ok(domain)
    }

    pub fn add_range(&mut self, range: DmaRange) {
        if self.ranges.insert(range) {
            self.control.add_range(self.id, range);
        }
    }

    pub fn remove_range(&mut self, range: DmaRange) {
        if self.ranges.remove(&range) {
            self.control.remove_range(self.id, range);
        }
    }

    pub fn attach(&mut self, device: &str) -> Result<(), HalError> {
        if self.devices.contains(device) {
            return Ok(());
        }
        self.control.attach_device(self.id, device)?;
        self.devices.insert(device.to_string());
        Ok(())
    }

    pub fn detach(&mut self, device: &str) {
        if self.devices.remove(device) {
            self.control.detach_device(self.id, device);
        }
    }

    /// Control-device name the domain is keyed by
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn ranges(&self) -> impl Iterator<Item = &DmaRange> {
        self.ranges.iter()
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether the domain lives on exactly this control device object
    pub fn is_backed_by(&self, control: &Arc<dyn ControlDevice>) -> bool {
        same_device(&self.control, control)
    }
}

impl Drop for TranslationDomain {
    fn drop(&mut self) {
        for device in core::mem::take(&mut self.devices) {
            self.control.detach_device(self.id, &device);
        }
        for range in core::mem::take(&mut self.ranges) {
            self.control.remove_range(self.id, range);
        }
        self.control.close_domain(self.id);
    }
}

/// The live domains of one session, keyed by control-device name
#[derive(Default)]
pub struct DomainRegistry {
    domains: BTreeMap<String, TranslationDomain>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain for `control`, opened and seeded from `buffers` if missing.
    ///
    /// The flag is `true` when the domain was opened by this call.
    pub fn get_or_open(
        &mut self,
        control: Arc<dyn ControlDevice>,
        buffers: &BufferRegistry,
    ) -> Result<(&mut TranslationDomain, bool), PlatformError> {
        match self.domains.entry(control.name().to_string()) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                let domain = TranslationDomain::open(control, buffers)?;
                log::debug!("opened domain {:?} on {}", domain.id(), domain.name());
                Ok((entry.insert(domain), true))
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TranslationDomain> {
        self.domains.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TranslationDomain> {
        self.domains.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    /// Remove and tear down the domain `name`.
    pub fn close(&mut self, name: &str) -> bool {
        match self.domains.remove(name) {
            Some(domain) => {
                log::debug!("closing domain {:?} on {}", domain.id(), domain.name());
                drop(domain);
                true
            }
            None => false,
        }
    }

    /// Close `name` if no device is routed through it any more.
    pub fn close_if_unused(&mut self, name: &str) -> bool {
        let unused = self
            .domains
            .get(name)
            .map_or(false, |d| d.device_count() == 0);
        unused && self.close(name)
    }

    /// Map `range` in every live domain.
    pub fn add_range_all(&mut self, range: DmaRange) {
        for domain in self.domains.values_mut() {
            domain.add_range(range);
        }
    }

    /// Unmap `range` from every live domain.
    pub fn remove_range_all(&mut self, range: DmaRange) {
        for domain in self.domains.values_mut() {
            domain.remove_range(range);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationDomain> {
        self.domains.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Tear down every domain.
    pub fn clear(&mut self) {
        while let Some((_, domain)) = self.domains.pop_first() {
            drop(domain);
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaBuffer;
    use alloc::vec;
    use alloc::vec::Vec;
    use pdrv_hal::{Cache, RamDataspace};
    use pdrv_hal_mock::{ControlEvent, MockControlDevice};

    fn buffers(specs: &[(u64, usize)]) -> BufferRegistry {
        let mut registry = BufferRegistry::new();
        for &(addr, size) in specs {
            registry.insert(DmaBuffer {
                ds: RamDataspace {
                    id: addr,
                    phys_addr: addr,
                    size,
                    cache: Cache::Cached,
                },
                dma_addr: addr,
                size,
            });
        }
        registry
    }

    fn smmu() -> (Arc<MockControlDevice>, Arc<dyn ControlDevice>) {
        let mock = Arc::new(MockControlDevice::new("smmu0"));
        let dyn_handle: Arc<dyn ControlDevice> = mock.clone();
        (mock, dyn_handle)
    }

    #[test]
    fn test_open_seeds_existing_buffers() {
        let (mock, control) = smmu();
        let registry = buffers(&[(0x1000, 0x1000), (0x4000, 0x2000)]);

        let domain = TranslationDomain::open(control, &registry).unwrap();
        assert_eq!(
            mock.ranges(domain.id()),
            vec![DmaRange::new(0x1000, 0x1000), DmaRange::new(0x4000, 0x2000)]
        );
        assert_eq!(domain.ranges().count(), 2);
    }

    #[test]
    fn test_drop_mirrors_construction() {
        let (mock, control) = smmu();
        let registry = buffers(&[(0x1000, 0x1000)]);

        let mut domain = TranslationDomain::open(control, &registry).unwrap();
        domain.attach("uart0").unwrap();
        domain.add_range(DmaRange::new(0x9000, 0x1000));
        let id = domain.id();
        drop(domain);

        let closed = mock.closed_domains();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, id);
        assert!(closed[0].leftover_ranges.is_empty());
        assert!(closed[0].leftover_devices.is_empty());
        assert_eq!(mock.stray_removals(), 0);

        // Close comes last
        assert_eq!(mock.events().last(), Some(&ControlEvent::Close(id)));
    }

    #[test]
    fn test_add_and_remove_are_idempotent() {
        let (mock, control) = smmu();
        let mut domain = TranslationDomain::open(control, &BufferRegistry::new()).unwrap();
        let range = DmaRange::new(0x2000, 0x1000);

        domain.add_range(range);
        domain.add_range(range);
        assert_eq!(mock.duplicate_adds(), 0);

        domain.remove_range(range);
        domain.remove_range(range);
        assert_eq!(mock.stray_removals(), 0);
        assert!(mock.ranges(domain.id()).is_empty());
    }

    #[test]
    fn test_registry_fan_out() {
        let a = Arc::new(MockControlDevice::new("smmu0"));
        let b = Arc::new(MockControlDevice::new("smmu1"));
        let empty = BufferRegistry::new();
        let mut registry = DomainRegistry::new();

        let (da, created) = registry.get_or_open(a.clone(), &empty).unwrap();
        let da = da.id();
        assert!(created);
        let (db, _) = registry.get_or_open(b.clone(), &empty).unwrap();
        let db = db.id();
        let (_, created) = registry.get_or_open(a.clone(), &empty).unwrap();
        assert!(!created);

        let range = DmaRange::new(0x3000, 0x1000);
        registry.add_range_all(range);
        assert_eq!(a.ranges(da), vec![range]);
        assert_eq!(b.ranges(db), vec![range]);

        registry.remove_range_all(range);
        assert!(a.ranges(da).is_empty());
        assert!(b.ranges(db).is_empty());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["smmu0", "smmu1"]);
    }

    #[test]
    fn test_close_if_unused() {
        let mock = Arc::new(MockControlDevice::new("smmu0"));
        let mut registry = DomainRegistry::new();
        let (domain, _) = registry
            .get_or_open(mock.clone(), &BufferRegistry::new())
            .unwrap();
        domain.attach("uart0").unwrap();

        assert!(!registry.close_if_unused("smmu0"));
        registry.get_mut("smmu0").unwrap().detach("uart0");
        assert!(registry.close_if_unused("smmu0"));
        assert!(registry.is_empty());
        assert!(mock.open_domains().is_empty());
    }

    #[test]
    fn test_clear_closes_everything() {
        let a = Arc::new(MockControlDevice::new("smmu0"));
        let b = Arc::new(MockControlDevice::new("smmu1"));
        let seeded = buffers(&[(0x1000, 0x1000)]);
        let mut registry = DomainRegistry::new();
        registry.get_or_open(a.clone(), &seeded).unwrap();
        registry.get_or_open(b.clone(), &seeded).unwrap();

        registry.clear();
        assert!(registry.is_empty());
        assert!(a.open_domains().is_empty());
        assert!(b.open_domains().is_empty());
        assert!(a.closed_domains()[0].leftover_ranges.is_empty());
    }
}
