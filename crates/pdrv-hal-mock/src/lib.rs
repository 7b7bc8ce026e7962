//! Mock platform implementation for testing the session arbiter
//!
//! This provides mock implementations of the `Platform` and `ControlDevice`
//! traits that can be used for testing without hardware. Both record every
//! call so tests can assert on hook ordering and on the exact range set a
//! translation domain holds.

#![no_std]
extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use pdrv_hal::{Cache, ControlDevice, DmaRange, DomainId, HalError, Platform, RamDataspace};
use spin::Mutex;

/// Physical base of the simulated DMA memory pool
pub const MOCK_PHYS_BASE: u64 = 0x4000_0000;

// ============================================================================
// Mock platform
// ============================================================================

/// Mock platform for unit testing
///
/// Provides simulated device power control and a bump allocator for DMA
/// memory. Thread-safe, so concurrency tests can share one instance.
pub struct MockPlatform {
    state: Mutex<PlatformState>,
}

struct PlatformState {
    /// Captured hook calls, in order
    call_log: Vec<String>,
    /// Devices currently enabled
    enabled: BTreeSet<String>,
    /// Devices whose enable hook fails
    failing: BTreeSet<String>,
    /// Live allocations by dataspace id
    allocations: BTreeMap<u64, RamDataspace>,
    next_ds_id: u64,
    next_phys: u64,
    /// Optional cap on total backing memory
    ram_limit: Option<usize>,
    ram_used: usize,
}

impl MockPlatform {
    /// Create a new mock platform
    pub fn new() -> Self {
        Self::with_phys_base(MOCK_PHYS_BASE)
    }

    /// Create a mock platform whose allocations start at `base`
    pub fn with_phys_base(base: u64) -> Self {
        Self {
            state: Mutex::new(PlatformState {
                call_log: Vec::new(),
                enabled: BTreeSet::new(),
                failing: BTreeSet::new(),
                allocations: BTreeMap::new(),
                next_ds_id: 1,
                next_phys: base,
                ram_limit: None,
                ram_used: 0,
            }),
        }
    }

    /// Make the enable hook of `device` fail
    pub fn fail_enable(&self, device: &str) {
        self.state.lock().failing.insert(device.to_string());
    }

    /// Limit the total backing memory handed out
    pub fn set_ram_limit(&self, limit: usize) {
        self.state.lock().ram_limit = Some(limit);
    }

    /// Check if a device is currently enabled
    pub fn is_enabled(&self, device: &str) -> bool {
        self.state.lock().enabled.contains(device)
    }

    /// Number of live DMA allocations
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Total bytes of live DMA allocations
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().ram_used
    }

    /// Get all captured hook calls
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    /// Check if a specific call was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.state
            .lock()
            .call_log
            .iter()
            .any(|msg| msg.contains(substr))
    }

    /// Index of the first logged call containing `substr`
    pub fn log_position(&self, substr: &str) -> Option<usize> {
        self.state
            .lock()
            .call_log
            .iter()
            .position(|msg| msg.contains(substr))
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn enable_device(&self, device: &str) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.failing.contains(device) {
            state.call_log.push(format!("[mock-platform] enable {} failed", device));
            return Err(HalError::DeviceFailure);
        }
        state.enabled.insert(device.to_string());
        state.call_log.push(format!("[mock-platform] enable {}", device));
        Ok(())
    }

    fn disable_device(&self, device: &str) -> Result<(), HalError> {
        let mut state = self.state.lock();
        state.enabled.remove(device);
        state.call_log.push(format!("[mock-platform] disable {}", device));
        Ok(())
    }

    fn alloc_dma_ram(&self, size: usize, cache: Cache) -> Result<RamDataspace, HalError> {
        let mut state = self.state.lock();
        if let Some(limit) = state.ram_limit {
            if state.ram_used + size > limit {
                return Err(HalError::OutOfMemory);
            }
        }

        let ds = RamDataspace {
            id: state.next_ds_id,
            phys_addr: state.next_phys,
            size,
            cache,
        };
        state.next_ds_id += 1;
        state.next_phys += size as u64;
        state.ram_used += size;
        state.allocations.insert(ds.id, ds);
        state.call_log.push(format!(
            "[mock-platform] alloc ds {} at {:#x} size {:#x}",
            ds.id, ds.phys_addr, size
        ));
        Ok(ds)
    }

    fn free_dma_ram(&self, ds: RamDataspace) {
        let mut state = self.state.lock();
        if state.allocations.remove(&ds.id).is_some() {
            state.ram_used -= ds.size;
        }
        state
            .call_log
            .push(format!("[mock-platform] free ds {}", ds.id));
    }
}

// ============================================================================
// Mock control device
// ============================================================================

/// A call received by a [`MockControlDevice`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Open(DomainId),
    Close(DomainId),
    AddRange(DomainId, DmaRange),
    RemoveRange(DomainId, DmaRange),
    Attach(DomainId, String),
    Detach(DomainId, String),
}

/// A domain as it looked when it was closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedDomain {
    pub id: DomainId,
    /// Ranges still mapped at close time (should be empty)
    pub leftover_ranges: Vec<DmaRange>,
    /// Devices still attached at close time (should be empty)
    pub leftover_devices: Vec<String>,
}

#[derive(Default)]
struct MockDomain {
    ranges: BTreeSet<DmaRange>,
    devices: BTreeSet<String>,
}

/// Mock IOMMU recording the range set of every domain
pub struct MockControlDevice {
    name: String,
    state: Mutex<ControlState>,
}

struct ControlState {
    next_domain: u64,
    domains: BTreeMap<DomainId, MockDomain>,
    closed: Vec<ClosedDomain>,
    events: Vec<ControlEvent>,
    fail_attach: BTreeSet<String>,
    /// Removals of ranges the domain never held
    stray_removals: usize,
    /// Additions of ranges the domain already held
    duplicate_adds: usize,
}

impl MockControlDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ControlState {
                next_domain: 1,
                domains: BTreeMap::new(),
                closed: Vec::new(),
                events: Vec::new(),
                fail_attach: BTreeSet::new(),
                stray_removals: 0,
                duplicate_adds: 0,
            }),
        }
    }

    /// Make attaching `device` to any domain fail
    pub fn fail_attach(&self, device: &str) {
        self.state.lock().fail_attach.insert(device.to_string());
    }

    /// Currently open domains
    pub fn open_domains(&self) -> Vec<DomainId> {
        self.state.lock().domains.keys().copied().collect()
    }

    /// Ranges currently mapped in `domain`, sorted by start address
    pub fn ranges(&self, domain: DomainId) -> Vec<DmaRange> {
        self.state
            .lock()
            .domains
            .get(&domain)
            .map(|d| d.ranges.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Devices currently attached to `domain`
    pub fn attached_devices(&self, domain: DomainId) -> Vec<String> {
        self.state
            .lock()
            .domains
            .get(&domain)
            .map(|d| d.devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Domains closed so far, in closing order
    pub fn closed_domains(&self) -> Vec<ClosedDomain> {
        self.state.lock().closed.clone()
    }

    /// All calls received, in order
    pub fn events(&self) -> Vec<ControlEvent> {
        self.state.lock().events.clone()
    }

    pub fn stray_removals(&self) -> usize {
        self.state.lock().stray_removals
    }

    pub fn duplicate_adds(&self) -> usize {
        self.state.lock().duplicate_adds
    }
}

impl ControlDevice for MockControlDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_domain(&self) -> Result<DomainId, HalError> {
        let mut state = self.state.lock();
        let id = DomainId(state.next_domain);
        state.next_domain += 1;
        state.domains.insert(id, MockDomain::default());
        state.events.push(ControlEvent::Open(id));
        Ok(id)
    }

    fn close_domain(&self, domain: DomainId) {
        let mut state = self.state.lock();
        if let Some(d) = state.domains.remove(&domain) {
            state.closed.push(ClosedDomain {
                id: domain,
                leftover_ranges: d.ranges.into_iter().collect(),
                leftover_devices: d.devices.into_iter().collect(),
            });
        }
        state.events.push(ControlEvent::Close(domain));
    }

    fn add_range(&self, domain: DomainId, range: DmaRange) {
        let mut state = self.state.lock();
        let fresh = state
            .domains
            .get_mut(&domain)
            .map(|d| d.ranges.insert(range))
            .unwrap_or(false);
        if !fresh {
            state.duplicate_adds += 1;
        }
        state.events.push(ControlEvent::AddRange(domain, range));
    }

    fn remove_range(&self, domain: DomainId, range: DmaRange) {
        let mut state = self.state.lock();
        let held = state
            .domains
            .get_mut(&domain)
            .map(|d| d.ranges.remove(&range))
            .unwrap_or(false);
        if !held {
            state.stray_removals += 1;
        }
        state.events.push(ControlEvent::RemoveRange(domain, range));
    }

    fn attach_device(&self, domain: DomainId, device: &str) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.fail_attach.contains(device) {
            return Err(HalError::DeviceFailure);
        }
        match state.domains.get_mut(&domain) {
            Some(d) => {
                d.devices.insert(device.to_string());
            }
            None => return Err(HalError::InvalidArgument),
        }
        state
            .events
            .push(ControlEvent::Attach(domain, device.to_string()));
        Ok(())
    }

    fn detach_device(&self, domain: DomainId, device: &str) {
        let mut state = self.state.lock();
        if let Some(d) = state.domains.get_mut(&domain) {
            d.devices.remove(device);
        }
        state
            .events
            .push(ControlEvent::Detach(domain, device.to_string()));
    }
}
