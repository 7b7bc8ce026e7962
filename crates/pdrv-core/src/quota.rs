//! Quota guards
//!
//! A session owns one guard for DMA memory bytes and one for capability
//! slots. Debits either succeed in full or leave the guard untouched.
//! A [`Reservation`] credits its amount back when dropped unless it was
//! acknowledged, which keeps multi-step operations free of partial
//! allocations.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Unit a guard counts in
pub trait QuotaUnit {
    const NAME: &'static str;
}

/// Bytes of memory
pub struct Ram;

/// Capability slots
pub struct Caps;

impl QuotaUnit for Ram {
    const NAME: &'static str = "ram";
}

impl QuotaUnit for Caps {
    const NAME: &'static str = "caps";
}

/// Bounded counter with atomic debit/credit
pub struct QuotaGuard<U: QuotaUnit> {
    limit: usize,
    used: AtomicUsize,
    _unit: PhantomData<fn() -> U>,
}

pub type RamQuotaGuard = QuotaGuard<Ram>;
pub type CapQuotaGuard = QuotaGuard<Caps>;

impl<U: QuotaUnit> QuotaGuard<U> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            _unit: PhantomData,
        }
    }

    /// Debit `amount` if it fits into the remaining quota.
    pub fn try_debit(&self, amount: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(amount).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    /// Give back `amount` previously debited.
    pub fn credit(&self, amount: usize) {
        let result = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(amount)
            });
        if result.is_err() {
            log::error!("{} quota credited beyond its debits ({})", U::NAME, amount);
        }
    }

    /// Debit `amount`, returning a guard that undoes the debit unless
    /// acknowledged.
    pub fn reserve(&self, amount: usize) -> Option<Reservation<'_, U>> {
        if self.try_debit(amount) {
            Some(Reservation {
                guard: self,
                amount,
                acknowledged: false,
            })
        } else {
            None
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }
}

/// Pending debit
#[must_use]
pub struct Reservation<'a, U: QuotaUnit> {
    guard: &'a QuotaGuard<U>,
    amount: usize,
    acknowledged: bool,
}

impl<U: QuotaUnit> Reservation<'_, U> {
    /// Keep the debit.
    pub fn acknowledge(mut self) {
        self.acknowledged = true;
    }

    pub fn amount(&self) -> usize {
        self.amount
    }
}

impl<U: QuotaUnit> Drop for Reservation<'_, U> {
    fn drop(&mut self) {
        if !self.acknowledged {
            self.guard.credit(self.amount);
        }
    }
}

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: used never exceeds the limit
    #[kani::proof]
    fn debit_never_exceeds_limit() {
        let guard = RamQuotaGuard::new(kani::any());
        let a: usize = kani::any();
        let b: usize = kani::any();
        guard.try_debit(a);
        guard.try_debit(b);
        kani::assert(guard.used() <= guard.limit(), "used <= limit");
    }
}
