//! Session arbiter
//!
//! One [`Session`] per client. It mediates exclusive device ownership,
//! allocates DMA memory on the client's behalf and keeps the translation
//! domains of its control devices consistent with the buffers it owns.
//!
//! All mutating operations of one session run under the session's lock, so
//! they never interleave. Different sessions only meet at the shared
//! [`DeviceModel`], whose owner tags are changed by compare-and-set.
//!
//! # Ordering
//!
//! - acquire: owner tag → enable hook → domain (open + seed, attach) →
//!   component + capability → report
//! - release: disable hook → detach → component + capability → owner tag →
//!   domain teardown if unused → report
//! - alloc: quota → backing memory → device address → registry → every
//!   live domain
//! - free: every live domain → device address → backing memory + quota →
//!   registry
//! - close: devices (cascading domains) → buffers → quota back to parent

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{log, warn, Level};
use pdrv_hal::{page_align, Cache, DmaRange, DomainId, Platform};
use spin::Mutex;

use crate::capability::{cap_check, Capability, CapabilitySpace};
use crate::control::ControlDevices;
use crate::device::{Device, DeviceModel};
use crate::device_pd::DevicePd;
use crate::dma::{BufferRegistry, DmaBuffer};
use crate::domain::DomainRegistry;
use crate::error::PlatformError;
use crate::policy::{PolicyVersion, SessionPolicy};
use crate::quota::{CapQuotaGuard, RamQuotaGuard};
use crate::report::{DevicesReport, DevicesRom, DevicesRomReader};
use crate::types::{
    BufferId, ComponentId, DeviceCapability, DmaCapability, ObjectType, Resources, SessionId,
};

/// Collaborators shared by every session of a driver
pub struct SessionEnv<P: Platform> {
    pub platform: Arc<P>,
    pub devices: Arc<DeviceModel>,
    pub control_devices: Arc<ControlDevices>,
}

impl<P: Platform> SessionEnv<P> {
    pub fn new(platform: Arc<P>, devices: Arc<DeviceModel>, control_devices: Arc<ControlDevices>) -> Self {
        Self {
            platform,
            devices,
            control_devices,
        }
    }
}

impl<P: Platform> Clone for SessionEnv<P> {
    fn clone(&self) -> Self {
        Self {
            platform: self.platform.clone(),
            devices: self.devices.clone(),
            control_devices: self.control_devices.clone(),
        }
    }
}

/// Binding of one acquired device to the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceComponent {
    /// Device name
    pub device: String,
    /// Control device whose domain the device is attached to
    pub domain: Option<String>,
}

pub(crate) struct SessionState {
    pub(crate) policy: SessionPolicy,
    pub(crate) cspace: CapabilitySpace,
    pub(crate) components: BTreeMap<ComponentId, DeviceComponent>,
    next_component: u64,
    pub(crate) buffers: BufferRegistry,
    pub(crate) domains: DomainRegistry,
    pub(crate) device_pd: DevicePd,
    pub(crate) closed: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), PlatformError> {
        if self.closed {
            Err(PlatformError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Log level of per-operation records
    fn level(&self) -> Level {
        if self.policy.diag {
            Level::Info
        } else {
            Level::Debug
        }
    }

    fn component_of(&self, device: &str) -> Option<ComponentId> {
        self.components
            .iter()
            .find(|(_, c)| c.device == device)
            .map(|(&id, _)| id)
    }
}

pub struct Session<P: Platform> {
    id: SessionId,
    label: String,
    platform: Arc<P>,
    devices: Arc<DeviceModel>,
    control_devices: Arc<ControlDevices>,
    ram_quota: RamQuotaGuard,
    cap_quota: CapQuotaGuard,
    rom: DevicesRom,
    state: Mutex<SessionState>,
}

impl<P: Platform> Session<P> {
    /// Create a session admitted under `policy`.
    pub fn new(env: &SessionEnv<P>, policy: SessionPolicy) -> Self {
        let id = env.devices.alloc_session_id();
        let rom = DevicesRom::new(DevicesReport::generate(&env.devices, &policy, id));
        log::debug!(
            "[{}] session {} created (ram {:#x}, caps {}, iommu {})",
            policy.label,
            id.0,
            policy.ram_quota,
            policy.cap_quota,
            policy.iommu
        );

        Self {
            id,
            label: policy.label.clone(),
            platform: env.platform.clone(),
            devices: env.devices.clone(),
            control_devices: env.control_devices.clone(),
            ram_quota: RamQuotaGuard::new(policy.ram_quota),
            cap_quota: CapQuotaGuard::new(policy.cap_quota),
            rom,
            state: Mutex::new(SessionState {
                cspace: CapabilitySpace::new(id),
                components: BTreeMap::new(),
                next_component: 0,
                buffers: BufferRegistry::new(),
                domains: DomainRegistry::new(),
                device_pd: DevicePd::new(policy.iommu),
                closed: false,
                policy,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Capability to the session's devices report
    pub fn devices_rom(&self) -> DevicesRomReader {
        self.rom.reader()
    }

    pub fn device_model(&self) -> &Arc<DeviceModel> {
        &self.devices
    }

    pub fn ram_quota(&self) -> &RamQuotaGuard {
        &self.ram_quota
    }

    pub fn cap_quota(&self) -> &CapQuotaGuard {
        &self.cap_quota
    }

    /// Whether the policy makes `device` visible to this session
    pub fn matches(&self, device: &str) -> bool {
        self.state.lock().policy.matches(device)
    }

    // ========================================================================
    // Device acquisition / release
    // ========================================================================

    /// Acquire the device `name`.
    ///
    /// Acquiring a device the session already owns returns the existing
    /// capability.
    ///
    /// # Returns
    /// * `Ok(DeviceCapability)` - Device is enabled and exclusively owned
    /// * `Err(NotFound)` - No such device visible to the session
    /// * `Err(AlreadyOwned)` - Another session owns the device
    /// * `Err(OutOfCaps)` - Capability quota exhausted
    /// * `Err(DeviceEnableFailed)` - Hook or IOMMU attach failed, rolled back
    pub fn acquire_device(&self, name: &str) -> Result<DeviceCapability, PlatformError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;
        self.acquire_by_name(state, name)
    }

    /// Acquire the only device visible to the session.
    pub fn acquire_single_device(&self) -> Result<DeviceCapability, PlatformError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let mut visible = self
            .devices
            .iter()
            .filter(|d| state.policy.matches(d.name()));
        let name = match (visible.next(), visible.next()) {
            (None, _) => return Err(PlatformError::NoAcquirableDevice),
            (Some(device), None) => device.name(),
            (Some(_), Some(_)) => return Err(PlatformError::AmbiguousSelection),
        };
        self.acquire_by_name(state, name)
    }

    /// Release a device acquired by this session.
    pub fn release_device(&self, cap: DeviceCapability) -> Result<(), PlatformError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let id = ComponentId(cap_check(&state.cspace, cap.0, ObjectType::Device)?.object_id);
        self.release_component(state, id);
        self.publish(state);
        Ok(())
    }

    fn acquire_by_name(
        &self,
        state: &mut SessionState,
        name: &str,
    ) -> Result<DeviceCapability, PlatformError> {
        let device = self
            .devices
            .lookup(name)
            .filter(|d| state.policy.matches(d.name()))
            .ok_or(PlatformError::NotFound)?;

        if let Some(id) = state.component_of(name) {
            if let Some(handle) = state.cspace.find(ObjectType::Device, id.0) {
                return Ok(DeviceCapability(handle));
            }
        }

        let cap = self.acquire(state, device)?;
        self.publish(state);
        Ok(cap)
    }

    fn acquire(
        &self,
        state: &mut SessionState,
        device: &Device,
    ) -> Result<DeviceCapability, PlatformError> {
        let name = device.name();
        let caps = self.cap_quota.reserve(1).ok_or(PlatformError::OutOfCaps)?;

        self.devices
            .compare_and_set_owner(device, None, Some(self.id))
            .map_err(|_| PlatformError::AlreadyOwned)?;

        if let Err(err) = self.platform.enable_device(name) {
            warn!("[{}] enabling {} failed: {}", self.label, name, err);
            self.clear_owner(device);
            return Err(PlatformError::DeviceEnableFailed);
        }

        let domain = match self.enter_domain(state, device) {
            Ok(domain) => domain,
            Err(err) => {
                self.disable(name);
                self.clear_owner(device);
                return Err(err);
            }
        };

        state.next_component += 1;
        let id = ComponentId(state.next_component);
        state.components.insert(
            id,
            DeviceComponent {
                device: name.to_string(),
                domain,
            },
        );
        let handle = state
            .cspace
            .insert(Capability::new(ObjectType::Device, id.0));
        caps.acknowledge();

        log!(state.level(), "[{}] acquired {}", self.label, name);
        Ok(DeviceCapability(handle))
    }

    /// Attach `device` to the session's domain on its control device,
    /// opening the domain first if this is its first device.
    fn enter_domain(
        &self,
        state: &mut SessionState,
        device: &Device,
    ) -> Result<Option<String>, PlatformError> {
        let Some(cd_name) = device.control_device() else {
            return Ok(None);
        };
        let Some(control) = self.control_devices.get(cd_name) else {
            log::debug!(
                "[{}] control device {} of {} not present",
                self.label,
                cd_name,
                device.name()
            );
            return Ok(None);
        };

        let (domain, created) = state.domains.get_or_open(control, &state.buffers)?;
        if let Err(err) = domain.attach(device.name()) {
            warn!(
                "[{}] attaching {} to {} failed: {}",
                self.label,
                device.name(),
                cd_name,
                err
            );
            if created {
                state.domains.close(cd_name);
            }
            return Err(PlatformError::DeviceEnableFailed);
        }
        Ok(Some(cd_name.to_string()))
    }

    fn release_component(&self, state: &mut SessionState, id: ComponentId) {
        let Some(component) = state.components.get(&id).cloned() else {
            return;
        };

        self.disable(&component.device);
        if let Some(domain) = component
            .domain
            .as_deref()
            .and_then(|name| state.domains.get_mut(name))
        {
            domain.detach(&component.device);
        }

        if let Some(handle) = state.cspace.find(ObjectType::Device, id.0) {
            state.cspace.remove(handle);
        }
        state.components.remove(&id);

        if let Some(device) = self.devices.lookup(&component.device) {
            self.clear_owner(device);
        }
        if let Some(name) = component.domain.as_deref() {
            state.domains.close_if_unused(name);
        }
        self.cap_quota.credit(1);

        log!(state.level(), "[{}] released {}", self.label, component.device);
    }

    fn disable(&self, name: &str) {
        if let Err(err) = self.platform.disable_device(name) {
            warn!("[{}] disabling {} failed: {}", self.label, name, err);
        }
    }

    fn clear_owner(&self, device: &Device) {
        if let Err(actual) = self
            .devices
            .compare_and_set_owner(device, Some(self.id), None)
        {
            log::error!(
                "[{}] {} is owned by {:?}, not by this session",
                self.label,
                device.name(),
                actual
            );
        }
    }

    // ========================================================================
    // DMA buffers
    // ========================================================================

    /// Allocate a DMA buffer of at least `size` bytes.
    ///
    /// The size is rounded up to whole pages; quota and translation ranges
    /// use the rounded size. The buffer is mapped in every live translation
    /// domain before this returns.
    pub fn alloc_dma_buffer(
        &self,
        size: usize,
        cache: Cache,
    ) -> Result<DmaCapability, PlatformError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        if size == 0 {
            return Err(PlatformError::InvalidArgument);
        }
        let size = page_align(size).ok_or(PlatformError::OutOfMemory)?;

        let ram = self
            .ram_quota
            .reserve(size)
            .ok_or(PlatformError::OutOfMemory)?;
        let caps = self.cap_quota.reserve(1).ok_or(PlatformError::OutOfCaps)?;

        let ds = self.platform.alloc_dma_ram(size, cache).map_err(|err| {
            warn!(
                "[{}] allocating {:#x} bytes of DMA memory failed: {}",
                self.label, size, err
            );
            PlatformError::OutOfMemory
        })?;
        let dma_addr = match state.device_pd.attach_dma_mem(&ds) {
            Ok(addr) => addr,
            Err(err) => {
                self.platform.free_dma_ram(ds);
                return Err(err);
            }
        };

        let buffer = DmaBuffer { ds, dma_addr, size };
        let range = buffer.range();
        let id = state.buffers.insert(buffer);
        state.domains.add_range_all(range);
        let handle = state
            .cspace
            .insert(Capability::new(ObjectType::DmaBuffer, id.0));
        ram.acknowledge();
        caps.acknowledge();

        log!(
            state.level(),
            "[{}] allocated DMA buffer {:#x}+{:#x} ({:?})",
            self.label,
            dma_addr,
            size,
            cache
        );
        Ok(DmaCapability(handle))
    }

    /// Free a DMA buffer of this session.
    pub fn free_dma_buffer(&self, cap: DmaCapability) -> Result<(), PlatformError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let id = BufferId(cap_check(&state.cspace, cap.0, ObjectType::DmaBuffer)?.object_id);
        self.free_buffer(state, id);
        Ok(())
    }

    /// Device-visible address of a DMA buffer.
    pub fn dma_addr(&self, cap: DmaCapability) -> Result<u64, PlatformError> {
        let state = self.state.lock();
        state.ensure_open()?;

        let id = BufferId(cap_check(&state.cspace, cap.0, ObjectType::DmaBuffer)?.object_id);
        state
            .buffers
            .get(id)
            .map(|b| b.dma_addr)
            .ok_or(PlatformError::InvalidCapability)
    }

    fn free_buffer(&self, state: &mut SessionState, id: BufferId) {
        let Some(buffer) = state.buffers.get(id).cloned() else {
            return;
        };

        state.domains.remove_range_all(buffer.range());
        state.device_pd.free_dma_mem(buffer.dma_addr);
        self.platform.free_dma_ram(buffer.ds);
        self.ram_quota.credit(buffer.size);

        state.buffers.remove(id);
        if let Some(handle) = state.cspace.find(ObjectType::DmaBuffer, id.0) {
            state.cspace.remove(handle);
        }
        self.cap_quota.credit(1);

        log!(
            state.level(),
            "[{}] freed DMA buffer {:#x}+{:#x}",
            self.label,
            buffer.dma_addr,
            buffer.size
        );
    }

    // ========================================================================
    // Policy and collaborator updates
    // ========================================================================

    /// Swap the report verbosity and version tag.
    pub fn update_policy(&self, info: bool, version: PolicyVersion) {
        let mut state = self.state.lock();
        state.policy.info = info;
        state.policy.version = version;
        self.publish(&state);
    }

    /// Regenerate the devices report.
    pub fn update_devices_rom(&self) {
        let state = self.state.lock();
        self.publish(&state);
    }

    /// Bring the session's domains in line with the registered control
    /// devices: close domains whose control device vanished or was
    /// replaced, and open domains for owned devices whose control device
    /// appeared.
    pub fn update_control_devices(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }

        let stale: Vec<String> = state
            .domains
            .iter()
            .filter(|d| {
                !self
                    .control_devices
                    .get(d.name())
                    .map_or(false, |c| d.is_backed_by(&c))
            })
            .map(|d| d.name().to_string())
            .collect();
        for name in &stale {
            state.domains.close(name);
            for component in state.components.values_mut() {
                if component.domain.as_deref() == Some(name.as_str()) {
                    component.domain = None;
                }
            }
            log!(state.level(), "[{}] control device {} gone", self.label, name);
        }

        for component in state.components.values_mut() {
            if component.domain.is_some() {
                continue;
            }
            let Some(cd_name) = self
                .devices
                .lookup(&component.device)
                .and_then(Device::control_device)
            else {
                continue;
            };
            let Some(control) = self.control_devices.get(cd_name) else {
                continue;
            };

            match state.domains.get_or_open(control, &state.buffers) {
                Ok((domain, created)) => match domain.attach(&component.device) {
                    Ok(()) => component.domain = Some(cd_name.to_string()),
                    Err(err) => {
                        warn!(
                            "[{}] attaching {} to {} failed: {}",
                            self.label, component.device, cd_name, err
                        );
                        if created {
                            state.domains.close(cd_name);
                        }
                    }
                },
                Err(err) => warn!(
                    "[{}] opening domain on {} failed: {}",
                    self.label, cd_name, err
                ),
            }
        }
    }

    fn publish(&self, state: &SessionState) {
        self.rom
            .publish(DevicesReport::generate(&self.devices, &state.policy, self.id));
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear the session down and return its quota to the parent.
    ///
    /// Releases every device (which closes their domains), then frees every
    /// remaining buffer. Returns `None` if the session was already closed.
    pub fn close(&self) -> Option<Resources> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return None;
        }
        state.closed = true;

        let components: Vec<ComponentId> = state.components.keys().copied().collect();
        for id in components {
            self.release_component(state, id);
        }
        let buffers: Vec<BufferId> = state.buffers.ids().collect();
        for id in buffers {
            self.free_buffer(state, id);
        }
        if !state.domains.is_empty() {
            warn!(
                "[{}] {} domain(s) outlived their devices",
                self.label,
                state.domains.len()
            );
            state.domains.clear();
        }
        self.publish(state);

        let returned = Resources {
            ram_quota: self.ram_quota.available(),
            cap_quota: self.cap_quota.available(),
        };
        log!(
            state.level(),
            "[{}] session {} closed, returning {:?}",
            self.label,
            self.id.0,
            returned
        );
        Some(returned)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Names of the devices owned by this session
    pub fn owned_devices(&self) -> Vec<String> {
        self.state
            .lock()
            .components
            .values()
            .map(|c| c.device.clone())
            .collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Sum of the sizes of all buffers
    pub fn buffer_bytes(&self) -> usize {
        self.state.lock().buffers.total_bytes()
    }

    /// Names of the live translation domains
    pub fn domain_names(&self) -> Vec<String> {
        self.state
            .lock()
            .domains
            .names()
            .map(String::from)
            .collect()
    }

    /// Ranges the domain on `control_device` maps
    pub fn domain_ranges(&self, control_device: &str) -> Option<Vec<DmaRange>> {
        self.state
            .lock()
            .domains
            .get(control_device)
            .map(|d| d.ranges().copied().collect())
    }

    pub fn domain_id(&self, control_device: &str) -> Option<DomainId> {
        self.state
            .lock()
            .domains
            .get(control_device)
            .map(|d| d.id())
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.lock())
    }

    #[cfg(test)]
    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

impl<P: Platform> Drop for Session<P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::invariants::check_all_invariants;
    use alloc::vec;
    use pdrv_hal::ControlDevice;
    use pdrv_hal_mock::{MockControlDevice, MockPlatform};

    struct Fixture {
        platform: Arc<MockPlatform>,
        smmu: Arc<MockControlDevice>,
        env: SessionEnv<MockPlatform>,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(MockPlatform::new());
        let smmu = Arc::new(MockControlDevice::new("smmu0"));
        let control_devices = Arc::new(ControlDevices::new());
        control_devices.register(smmu.clone());
        let devices = Arc::new(
            DeviceModel::new(vec![
                DeviceConfig::new("uart0", "uart").with_control_device("smmu0"),
                DeviceConfig::new("dma0", "dma").with_control_device("smmu0"),
                DeviceConfig::new("gpu0", "gpu"),
            ])
            .unwrap(),
        );
        Fixture {
            env: SessionEnv::new(platform.clone(), devices, control_devices),
            platform,
            smmu,
        }
    }

    fn policy() -> SessionPolicy {
        SessionPolicy::new(
            "test",
            Resources {
                ram_quota: 0x10000,
                cap_quota: 8,
            },
        )
        .with_device("uart0")
        .with_device("dma0")
        .with_device("gpu0")
    }

    #[test]
    fn test_enable_failure_rolls_back() {
        let f = fixture();
        f.platform.fail_enable("uart0");
        let session = Session::new(&f.env, policy());

        assert_eq!(
            session.acquire_device("uart0"),
            Err(PlatformError::DeviceEnableFailed)
        );
        assert_eq!(f.env.devices.lookup("uart0").unwrap().owner(), None);
        assert!(session.owned_devices().is_empty());
        assert!(session.domain_names().is_empty());
        assert!(f.smmu.open_domains().is_empty());
        assert_eq!(session.cap_quota().used(), 0);
        assert!(check_all_invariants(&session).is_empty());
    }

    #[test]
    fn test_attach_failure_closes_fresh_domain() {
        let f = fixture();
        f.smmu.fail_attach("uart0");
        let session = Session::new(&f.env, policy());
        session.alloc_dma_buffer(0x1000, Cache::Cached).unwrap();

        assert_eq!(
            session.acquire_device("uart0"),
            Err(PlatformError::DeviceEnableFailed)
        );
        // Enable was undone and the seeded domain was torn down again
        assert!(!f.platform.is_enabled("uart0"));
        assert!(f.platform.log_position("enable uart0") < f.platform.log_position("disable uart0"));
        assert!(f.smmu.open_domains().is_empty());
        assert!(f.smmu.closed_domains()[0].leftover_ranges.is_empty());
        assert_eq!(f.env.devices.lookup("uart0").unwrap().owner(), None);
        assert!(check_all_invariants(&session).is_empty());
    }

    #[test]
    fn test_attach_failure_keeps_shared_domain() {
        let f = fixture();
        f.smmu.fail_attach("dma0");
        let session = Session::new(&f.env, policy());
        session.acquire_device("uart0").unwrap();

        assert_eq!(
            session.acquire_device("dma0"),
            Err(PlatformError::DeviceEnableFailed)
        );
        assert_eq!(session.domain_names(), vec![String::from("smmu0")]);
        assert_eq!(session.owned_devices(), vec![String::from("uart0")]);
        assert!(check_all_invariants(&session).is_empty());
    }

    #[test]
    fn test_reacquire_returns_existing_capability() {
        let f = fixture();
        let session = Session::new(&f.env, policy());
        let first = session.acquire_device("gpu0").unwrap();
        let second = session.acquire_device("gpu0").unwrap();

        assert_eq!(first, second);
        assert_eq!(session.cap_quota().used(), 1);
        assert_eq!(
            f.platform
                .call_log()
                .iter()
                .filter(|l| l.contains("enable gpu0"))
                .count(),
            1
        );
    }

    #[test]
    fn test_update_control_devices_follows_registry() {
        let f = fixture();
        let session = Session::new(&f.env, policy());
        session.acquire_device("uart0").unwrap();
        session.alloc_dma_buffer(0x2000, Cache::Uncached).unwrap();
        let old_domain = session.domain_id("smmu0").unwrap();

        // Control device disappears: its domain is torn down
        f.env.control_devices.unregister("smmu0");
        session.update_control_devices();
        assert!(session.domain_names().is_empty());
        assert!(f.smmu.open_domains().is_empty());
        assert!(f.smmu.closed_domains()[0].leftover_ranges.is_empty());
        assert_eq!(f.smmu.closed_domains()[0].id, old_domain);
        assert!(check_all_invariants(&session).is_empty());

        // A replacement shows up: a fresh domain is seeded with the buffer
        let smmu2 = Arc::new(MockControlDevice::new("smmu0"));
        f.env.control_devices.register(smmu2.clone());
        session.update_control_devices();
        let domain = session.domain_id("smmu0").unwrap();
        assert_eq!(smmu2.ranges(domain).len(), 1);
        assert_eq!(smmu2.attached_devices(domain), vec![String::from("uart0")]);
        assert!(check_all_invariants(&session).is_empty());
    }

    #[test]
    fn test_update_control_devices_replaces_swapped_device() {
        let f = fixture();
        let session = Session::new(&f.env, policy());
        session.acquire_device("uart0").unwrap();

        let replacement: Arc<dyn ControlDevice> = Arc::new(MockControlDevice::new("smmu0"));
        f.env.control_devices.register(replacement.clone());
        session.update_control_devices();

        assert!(f.smmu.open_domains().is_empty());
        session.with_state(|state| {
            assert!(state.domains.get("smmu0").unwrap().is_backed_by(&replacement));
        });
    }

    #[test]
    fn test_operations_after_close_fail() {
        let f = fixture();
        let session = Session::new(&f.env, policy());
        let buf = session.alloc_dma_buffer(0x1000, Cache::Cached).unwrap();

        assert!(session.close().is_some());
        assert!(session.close().is_none());
        assert!(session.is_closed());
        assert_eq!(session.acquire_device("gpu0"), Err(PlatformError::SessionClosed));
        assert_eq!(session.dma_addr(buf), Err(PlatformError::SessionClosed));
        assert_eq!(
            session.alloc_dma_buffer(0x1000, Cache::Cached),
            Err(PlatformError::SessionClosed)
        );
    }

    #[test]
    fn test_zero_sized_allocation_rejected() {
        let f = fixture();
        let session = Session::new(&f.env, policy());
        assert_eq!(
            session.alloc_dma_buffer(0, Cache::Cached),
            Err(PlatformError::InvalidArgument)
        );
        assert_eq!(session.ram_quota().used(), 0);
    }

    #[test]
    fn test_backing_memory_exhaustion_leaves_quota_untouched() {
        let f = fixture();
        f.platform.set_ram_limit(0x1000);
        let session = Session::new(&f.env, policy());

        assert!(session.alloc_dma_buffer(0x1000, Cache::Cached).is_ok());
        assert_eq!(
            session.alloc_dma_buffer(0x1000, Cache::Cached),
            Err(PlatformError::OutOfMemory)
        );
        assert_eq!(session.ram_quota().used(), 0x1000);
        assert_eq!(session.cap_quota().used(), 1);
        assert_eq!(session.buffer_count(), 1);
    }
}
