//! Capability arena for device and DMA-buffer handles
//!
//! Every object a session hands out (a device component or a DMA buffer) is
//! reachable only through a capability slot in the session's
//! [`CapabilitySpace`]:
//! - Slots are reused through a free list
//! - Every removal bumps the slot's generation
//! - A [`CapHandle`] names session, slot and generation
//!
//! # Security Properties (Verification Targets)
//!
//! 1. **No Forged Object**: Only objects we inserted can be returned
//! 2. **No Dangling Handle**: A handle whose object was removed never resolves
//!    again, even after its slot is reused
//! 3. **Fail Closed**: Foreign, stale or mistyped handles always error

use alloc::vec::Vec;

use crate::types::{CapSlot, ObjectType, SessionId};

/// A capability entry - proof that the session owns an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    /// Type of object this capability references
    pub object_type: ObjectType,
    /// Session-local ID of the referenced object
    pub object_id: u64,
}

impl Capability {
    pub fn new(object_type: ObjectType, object_id: u64) -> Self {
        Self {
            object_type,
            object_id,
        }
    }
}

/// Client-visible reference to a capability slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CapHandle {
    /// Session whose space issued the handle
    pub session: SessionId,
    /// Slot index
    pub slot: CapSlot,
    /// Generation of the slot at issue time
    pub generation: u32,
}

struct Slot {
    generation: u32,
    cap: Option<Capability>,
}

/// Per-session capability table
pub struct CapabilitySpace {
    owner: SessionId,
    slots: Vec<Slot>,
    free: Vec<CapSlot>,
    live: usize,
}

impl CapabilitySpace {
    /// Create a new empty capability space for `owner`
    pub fn new(owner: SessionId) -> Self {
        Self {
            owner,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Insert a capability, returning its handle
    pub fn insert(&mut self, cap: Capability) -> CapHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    cap: None,
                });
                (self.slots.len() - 1) as CapSlot
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.cap = Some(cap);
        self.live += 1;
        CapHandle {
            session: self.owner,
            slot,
            generation: entry.generation,
        }
    }

    /// Resolve a handle
    pub fn get(&self, handle: CapHandle) -> Result<&Capability, CapError> {
        if handle.session != self.owner {
            return Err(CapError::ForeignSession);
        }
        let entry = self
            .slots
            .get(handle.slot as usize)
            .ok_or(CapError::InvalidSlot)?;
        if entry.generation != handle.generation {
            return Err(CapError::StaleGeneration);
        }
        entry.cap.as_ref().ok_or(CapError::InvalidSlot)
    }

    /// Remove a capability, invalidating every handle to it
    pub fn remove(&mut self, handle: CapHandle) -> Option<Capability> {
        self.get(handle).ok()?;
        let entry = &mut self.slots[handle.slot as usize];
        let cap = entry.cap.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);
        self.live -= 1;
        cap
    }

    /// Iterate over live capabilities with their current handles
    pub fn iter(&self) -> impl Iterator<Item = (CapHandle, &Capability)> + '_ {
        let owner = self.owner;
        self.slots.iter().enumerate().filter_map(move |(i, s)| {
            s.cap.as_ref().map(|cap| {
                (
                    CapHandle {
                        session: owner,
                        slot: i as CapSlot,
                        generation: s.generation,
                    },
                    cap,
                )
            })
        })
    }

    /// Handle of the live capability referencing `object_id`
    pub fn find(&self, object_type: ObjectType, object_id: u64) -> Option<CapHandle> {
        self.iter()
            .find(|(_, c)| c.object_type == object_type && c.object_id == object_id)
            .map(|(h, _)| h)
    }

    /// Number of live capabilities
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }
}

// ============================================================================
// Capability checking
// ============================================================================

/// Errors returned by capability checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapError {
    /// Handle was issued by another session
    ForeignSession,
    /// Slot is empty or out of range
    InvalidSlot,
    /// Object behind the slot was revoked
    StaleGeneration,
    /// Capability references the wrong object type
    WrongType,
}

/// Check that `handle` names a live object of `expected_type` in `cspace`.
///
/// Every session operation taking a capability calls this before mutating
/// anything.
///
/// # Invariants
/// - This function never modifies any state
/// - Returns only capabilities that were inserted into `cspace`
pub fn cap_check(
    cspace: &CapabilitySpace,
    handle: CapHandle,
    expected_type: ObjectType,
) -> Result<&Capability, CapError> {
    let cap = cspace.get(handle)?;
    if cap.object_type != expected_type {
        return Err(CapError::WrongType);
    }
    Ok(cap)
}

// ============================================================================
// Kani Proofs for Capability Verification
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: a removed capability never resolves again
    #[kani::proof]
    #[kani::unwind(4)]
    fn no_dangling_handle() {
        let mut cspace = CapabilitySpace::new(SessionId(1));
        let handle = cspace.insert(Capability::new(ObjectType::Device, kani::any()));
        cspace.remove(handle);

        // Reuse the slot
        let object_id: u64 = kani::any();
        let fresh = cspace.insert(Capability::new(ObjectType::Device, object_id));

        kani::assert(fresh.slot == handle.slot, "slot is reused");
        kani::assert(
            cap_check(&cspace, handle, ObjectType::Device).is_err(),
            "stale handle must fail",
        );
    }

    /// Proof: fail closed on a handle from another session
    #[kani::proof]
    fn fail_closed_foreign_session() {
        let mut cspace = CapabilitySpace::new(SessionId(1));
        let mut handle = cspace.insert(Capability::new(ObjectType::DmaBuffer, 7));
        handle.session = SessionId(kani::any());
        kani::assume(handle.session != SessionId(1));

        kani::assert(
            cap_check(&cspace, handle, ObjectType::DmaBuffer).is_err(),
            "foreign handle must fail",
        );
    }
}
