//! Runtime-checkable session invariants
//!
//! These must hold whenever no session operation is in flight. They are
//! checked after every step of the integration tests.
//!
//! # Invariants
//!
//! 1. **Device Ownership**: A device is owned by the session iff the session
//!    holds a component for it
//! 2. **Domain Derivation**: Domains exist exactly for the control devices of
//!    owned devices and route exactly those devices
//! 3. **Domain/Buffer Consistency**: Every live domain maps exactly the
//!    ranges of the buffer registry
//! 4. **Capability Object Validity**: Capabilities and registry objects are
//!    in one-to-one correspondence
//! 5. **Quota Conservation**: Quota usage equals the resources held
//! 6. **DMA Addresses**: Buffer addresses are nonzero, and physical when the
//!    session has no IOMMU

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use pdrv_hal::{DmaRange, Platform};

use crate::session::{Session, SessionState};
use crate::types::{BufferId, ComponentId, ObjectType};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

impl InvariantViolation {
    fn new(invariant: &'static str, description: String) -> Self {
        Self {
            invariant,
            description,
        }
    }
}

/// Check all session invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants<P: Platform>(session: &Session<P>) -> Vec<InvariantViolation> {
    session.with_state(|state| {
        let mut violations = Vec::new();

        violations.extend(check_device_ownership(session, state));
        violations.extend(check_domain_derivation(session, state));
        violations.extend(check_domain_buffer_consistency(state));
        violations.extend(check_capability_object_validity(state));
        violations.extend(check_quota_conservation(session, state));
        violations.extend(check_dma_addresses(state));

        violations
    })
}

/// Invariant 1: owner tags and components agree
fn check_device_ownership<P: Platform>(
    session: &Session<P>,
    state: &SessionState,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let model = session.device_model();

    for component in state.components.values() {
        match model.lookup(&component.device) {
            Some(device) if device.owner() == Some(session.id()) => {}
            Some(device) => violations.push(InvariantViolation::new(
                "device_ownership",
                format!(
                    "Component for {} but device is owned by {:?}",
                    component.device,
                    device.owner()
                ),
            )),
            None => violations.push(InvariantViolation::new(
                "device_ownership",
                format!("Component for unknown device {}", component.device),
            )),
        }
    }

    for device in model.owned_by(session.id()) {
        if !state.components.values().any(|c| c.device == device.name()) {
            violations.push(InvariantViolation::new(
                "device_ownership",
                format!("Device {} owned without a component", device.name()),
            ));
        }
    }

    violations
}

/// Invariant 2: domains follow the owned devices
fn check_domain_derivation<P: Platform>(
    session: &Session<P>,
    state: &SessionState,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for component in state.components.values() {
        let Some(name) = component.domain.as_deref() else {
            continue;
        };
        match state.domains.get(name) {
            Some(domain) if domain.devices().any(|d| d == component.device) => {}
            Some(_) => violations.push(InvariantViolation::new(
                "domain_derivation",
                format!("{} is not attached to domain {}", component.device, name),
            )),
            None => violations.push(InvariantViolation::new(
                "domain_derivation",
                format!("{} refers to missing domain {}", component.device, name),
            )),
        }

        let expected = session
            .device_model()
            .lookup(&component.device)
            .and_then(|d| d.control_device());
        if expected != Some(name) {
            violations.push(InvariantViolation::new(
                "domain_derivation",
                format!(
                    "{} routed through {} instead of {:?}",
                    component.device, name, expected
                ),
            ));
        }
    }

    for domain in state.domains.iter() {
        if domain.device_count() == 0 {
            violations.push(InvariantViolation::new(
                "domain_derivation",
                format!("Domain {} has no devices", domain.name()),
            ));
        }
        for device in domain.devices() {
            let backed = state
                .components
                .values()
                .any(|c| c.device == device && c.domain.as_deref() == Some(domain.name()));
            if !backed {
                violations.push(InvariantViolation::new(
                    "domain_derivation",
                    format!("Domain {} routes unowned device {}", domain.name(), device),
                ));
            }
        }
    }

    violations
}

/// Invariant 3: every domain maps exactly the registry's ranges
fn check_domain_buffer_consistency(state: &SessionState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let expected: BTreeSet<DmaRange> = state.buffers.ranges().collect();

    for domain in state.domains.iter() {
        let mapped: BTreeSet<DmaRange> = domain.ranges().copied().collect();
        for missing in expected.difference(&mapped) {
            violations.push(InvariantViolation::new(
                "domain_buffer_consistency",
                format!(
                    "Domain {} is missing {:#x}+{:#x}",
                    domain.name(),
                    missing.start,
                    missing.size
                ),
            ));
        }
        for stale in mapped.difference(&expected) {
            violations.push(InvariantViolation::new(
                "domain_buffer_consistency",
                format!(
                    "Domain {} still maps {:#x}+{:#x}",
                    domain.name(),
                    stale.start,
                    stale.size
                ),
            ));
        }
    }

    violations
}

/// Invariant 4: capabilities and objects correspond one-to-one
fn check_capability_object_validity(state: &SessionState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (handle, cap) in state.cspace.iter() {
        let exists = match cap.object_type {
            ObjectType::Device => state.components.contains_key(&ComponentId(cap.object_id)),
            ObjectType::DmaBuffer => state.buffers.get(BufferId(cap.object_id)).is_some(),
        };
        if !exists {
            violations.push(InvariantViolation::new(
                "capability_object_validity",
                format!(
                    "Slot {} references non-existent {:?} {}",
                    handle.slot, cap.object_type, cap.object_id
                ),
            ));
        }
    }

    for id in state.components.keys() {
        if state.cspace.find(ObjectType::Device, id.0).is_none() {
            violations.push(InvariantViolation::new(
                "capability_object_validity",
                format!("Component {} has no capability", id.0),
            ));
        }
    }
    for id in state.buffers.ids() {
        if state.cspace.find(ObjectType::DmaBuffer, id.0).is_none() {
            violations.push(InvariantViolation::new(
                "capability_object_validity",
                format!("Buffer {} has no capability", id.0),
            ));
        }
    }

    violations
}

/// Invariant 5: quota usage equals held resources
fn check_quota_conservation<P: Platform>(
    session: &Session<P>,
    state: &SessionState,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let ram_held = state.buffers.total_bytes();
    if session.ram_quota().used() != ram_held {
        violations.push(InvariantViolation::new(
            "quota_conservation",
            format!(
                "RAM quota used {:#x} but buffers hold {:#x}",
                session.ram_quota().used(),
                ram_held
            ),
        ));
    }

    let caps_held = state.cspace.len();
    if session.cap_quota().used() != caps_held {
        violations.push(InvariantViolation::new(
            "quota_conservation",
            format!(
                "Cap quota used {} but {} capabilities are held",
                session.cap_quota().used(),
                caps_held
            ),
        ));
    }

    violations
}

/// Invariant 6: DMA addresses are usable
fn check_dma_addresses(state: &SessionState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, buffer) in state.buffers.iter() {
        if buffer.dma_addr == 0 {
            violations.push(InvariantViolation::new(
                "dma_addresses",
                format!("Buffer {} has DMA address 0", id.0),
            ));
        }
        if !state.device_pd.iommu() && buffer.dma_addr != buffer.ds.phys_addr {
            violations.push(InvariantViolation::new(
                "dma_addresses",
                format!(
                    "Buffer {} at {:#x} differs from physical {:#x} without IOMMU",
                    id.0, buffer.dma_addr, buffer.ds.phys_addr
                ),
            ));
        }
    }

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants<P: Platform>(session: &Session<P>) {
    let violations = check_all_invariants(session);
    if let Some(v) = violations.first() {
        panic!("Invariant violated: {}: {}", v.invariant, v.description);
    }
}
