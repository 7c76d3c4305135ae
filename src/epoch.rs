//! Epoch-based grace periods.
//!
//! Every execution unit owns one slot. A unit that may hold references into
//! the fault-page table or the probe list publishes the global epoch it
//! observed ("pins"); a quiescent unit publishes [`QUIESCENT`]. Retiring
//! something bumps the global epoch and remembers the old value; the grace
//! period for it has elapsed once every slot is quiescent or pinned at a later
//! epoch.
//!
//! All accesses are `SeqCst`: a reader's pin store, its re-read of the global
//! epoch and a writer's retirement bump form one total order, which is what
//! makes the check in [`EpochDomain::grace_elapsed`] sound.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Slot value of a unit outside any read-side section.
pub const QUIESCENT: u64 = u64::MAX;

/// Global epoch counter plus one pin slot per execution unit.
pub struct EpochDomain {
    global: AtomicU64,
    local: Box<[AtomicU64]>,
}

impl EpochDomain {
    /// Create a domain for `units` execution units, all quiescent.
    pub fn new(units: usize) -> Self {
        let local: Vec<AtomicU64> = (0..units).map(|_| AtomicU64::new(QUIESCENT)).collect();
        Self {
            global: AtomicU64::new(0),
            local: local.into_boxed_slice(),
        }
    }

    /// Number of unit slots.
    pub fn units(&self) -> usize {
        self.local.len()
    }

    /// Current global epoch.
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Publish `unit` as reading at the current epoch. Returns the pinned epoch.
    ///
    /// The store is repeated until the global epoch is stable across it, so a
    /// retirement that missed this pin is guaranteed to precede every read the
    /// unit does afterwards.
    pub fn pin(&self, unit: usize) -> u64 {
        let slot = &self.local[unit];
        let mut epoch = self.global.load(Ordering::SeqCst);
        loop {
            slot.store(epoch, Ordering::SeqCst);
            let now = self.global.load(Ordering::SeqCst);
            if now == epoch {
                return epoch;
            }
            epoch = now;
        }
    }

    /// Mark `unit` quiescent.
    pub fn unpin(&self, unit: usize) {
        self.local[unit].store(QUIESCENT, Ordering::SeqCst);
    }

    /// Whether `unit` is currently pinned.
    pub fn is_pinned(&self, unit: usize) -> bool {
        self.local[unit].load(Ordering::SeqCst) != QUIESCENT
    }

    /// Start a grace period for something just unlinked. Returns its epoch.
    pub fn retire(&self) -> u64 {
        self.global.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether every unit pinned at or before `retired` has moved on.
    pub fn grace_elapsed(&self, retired: u64) -> bool {
        self.local.iter().all(|slot| {
            let pinned = slot.load(Ordering::SeqCst);
            pinned == QUIESCENT || pinned > retired
        })
    }
}
