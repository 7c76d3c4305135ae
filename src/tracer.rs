//! The tracer: shared state behind registration and the trap handshake.
//!
//! One [`Tracer`] owns the fault-page table, the registered probes and the
//! epoch domain. Registration and removal (`registry`) serialize on a single
//! `spin::Mutex`; the handshake entry points (`handler`) read the table and the
//! published probe list without locking.
//!
//! The mutation lock is only ever held with local interrupts disabled. The
//! step-completion handler takes it too, and an interrupt that touches a
//! traced page on a unit already holding it would otherwise spin forever.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

use crate::arm;
use crate::config::Config;
use crate::context::UnitContext;
use crate::epoch::EpochDomain;
use crate::error::{Error, Result};
use crate::fault_page::{FaultPageId, FaultPageTable, SlotAllocator};
use crate::page_table::PageTableOps;
use crate::platform::IrqGuard;
use crate::probe::{Probe, ProbeList};
use crate::reclaim::Reclaimer;
use crate::stats::{StatsSnapshot, TracerStats};

/// A registered probe and the fault pages it holds a reference on.
pub(crate) struct ProbeEntry {
    pub probe: Arc<Probe>,
    pub pages: Vec<FaultPageId>,
}

/// Everything guarded by the mutation lock.
pub(crate) struct State {
    /// Registered probes keyed by start address.
    pub probes: BTreeMap<usize, ProbeEntry>,
    pub alloc: SlotAllocator,
    pub reclaimer: Reclaimer,
}

/// Held mutation lock. Unlocks before interrupts come back.
pub(crate) struct StateGuard<'a> {
    state: MutexGuard<'a, State>,
    _irq: IrqGuard,
}

impl Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

/// Point-in-time view of one fault page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPageInfo {
    pub addr: usize,
    pub count: u32,
    pub armed: bool,
    pub old_presence: u64,
    pub scheduled_for_release: bool,
}

/// MMIO access tracer over a page-table implementation `P`.
pub struct Tracer<P: PageTableOps> {
    pub(crate) mmu: P,
    config: Config,
    pub(crate) table: FaultPageTable,
    pub(crate) epochs: EpochDomain,
    /// Current probe list; swapped under the mutation lock, read while pinned.
    probes: AtomicPtr<ProbeList>,
    state: Mutex<State>,
    /// Units whose context has been handed out.
    claimed: Box<[AtomicBool]>,
    pub(crate) stats: TracerStats,
    pub(crate) probe_count: AtomicUsize,
}

impl<P: PageTableOps> Tracer<P> {
    /// Create a tracer. Nothing is armed until a probe is registered.
    pub fn new(mmu: P, config: Config) -> Result<Self> {
        config.validate()?;

        let claimed: Vec<AtomicBool> = (0..config.max_units).map(|_| AtomicBool::new(false)).collect();
        let list = Box::into_raw(Box::new(ProbeList::default()));

        log::info!(
            "kmmio: tracer initialized ({} units, {} fault pages)",
            config.max_units,
            config.max_fault_pages
        );

        Ok(Self {
            mmu,
            config,
            table: FaultPageTable::new(config.max_fault_pages),
            epochs: EpochDomain::new(config.max_units),
            probes: AtomicPtr::new(list),
            state: Mutex::new(State {
                probes: BTreeMap::new(),
                alloc: SlotAllocator::new(config.max_fault_pages),
                reclaimer: Reclaimer::default(),
            }),
            claimed: claimed.into_boxed_slice(),
            stats: TracerStats::new(),
            probe_count: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The page-table implementation.
    pub fn mmu(&self) -> &P {
        &self.mmu
    }

    /// Take the mutation lock with local interrupts disabled.
    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        let irq = IrqGuard::new();
        StateGuard {
            state: self.state.lock(),
            _irq: irq,
        }
    }

    // =========================================================================
    // Execution units
    // =========================================================================

    /// Claim the context of execution unit `unit`.
    ///
    /// Each unit has exactly one context; claiming it again before
    /// [`release_unit`](Self::release_unit) fails.
    pub fn unit_context(&self, unit: usize) -> Result<UnitContext> {
        let slot = self.claimed.get(unit).ok_or(Error::UnitUnavailable(unit))?;
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::UnitUnavailable(unit));
        }
        Ok(UnitContext::new(unit))
    }

    /// Give a unit's context back.
    ///
    /// # Panics
    /// If the context is still in a handshake.
    pub fn release_unit(&self, ctx: UnitContext) {
        assert!(
            !ctx.is_active() && !ctx.is_pinned(),
            "kmmio: releasing unit {} mid-handshake",
            ctx.unit()
        );
        if let Some(slot) = self.claimed.get(ctx.unit()) {
            slot.store(false, Ordering::Release);
        }
    }

    // =========================================================================
    // Probe list publication
    // =========================================================================

    /// Current probe list.
    ///
    /// # Safety
    /// The calling unit must stay pinned for as long as the reference is used.
    pub(crate) unsafe fn probe_list(&self) -> &ProbeList {
        // SAFETY: the list is freed only after every unit pinned when it was
        // replaced has unpinned.
        unsafe { &*self.probes.load(Ordering::Acquire) }
    }

    /// Publish a new list built from `state.probes` and retire the old one.
    pub(crate) fn publish_probes(&self, state: &mut State) {
        let list = ProbeList::new(state.probes.values().map(|e| e.probe.clone()).collect());
        let new = Box::into_raw(Box::new(list));
        let old = self.probes.swap(new, Ordering::AcqRel);
        if let Some(old) = NonNull::new(old) {
            let epoch = self.epochs.retire();
            // SAFETY: `old` came from Box::into_raw and was just unpublished.
            unsafe { state.reclaimer.defer_list(old, epoch) };
        }
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Run every release step whose grace period has elapsed.
    /// Returns whether anything moved.
    pub fn reclaim(&self) -> bool {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.reclaimer.poll(&self.table, &self.epochs, &mut state.alloc)
    }

    /// Wait until every queued release has completed.
    ///
    /// Spins without holding the mutation lock. Never returns while some unit
    /// stays pinned, so it must not be called from a unit that is itself in a
    /// handshake.
    pub fn synchronize(&self) {
        loop {
            self.reclaim();
            if self.lock_state().reclaimer.is_idle() {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Drain reclamation; warns if fault pages are still in the table.
    pub fn cleanup(&self) {
        self.synchronize();
        if !self.table.is_empty() {
            log::warn!(
                "kmmio: {} fault pages remain at cleanup",
                self.table.len()
            );
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Number of registered probes.
    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::Acquire)
    }

    /// Handled faults that fell outside every probe range.
    pub fn miss_count(&self) -> u64 {
        self.stats.misses()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Accumulated time between access faults and their step completions.
    pub fn stepping_time_ns(&self) -> u64 {
        self.stats.stepping_ns()
    }

    pub fn reset_stepping_time(&self) {
        self.stats.reset_stepping_time();
    }

    /// Registered probes in address order.
    pub fn probes(&self) -> Vec<Arc<Probe>> {
        self.lock_state().probes.values().map(|e| e.probe.clone()).collect()
    }

    /// State of the fault page keyed by `page_base`.
    ///
    /// `page_base` is the address aligned to the granularity it is mapped at.
    pub fn fault_page(&self, page_base: usize) -> Option<FaultPageInfo> {
        // Slots are only recycled under the lock.
        let _state = self.lock_state();
        let page = self.table.get(self.table.lookup(page_base)?);
        Some(FaultPageInfo {
            addr: page.addr(),
            count: page.count(),
            armed: page.is_armed(),
            old_presence: page.old_presence(),
            scheduled_for_release: page.is_scheduled_for_release(),
        })
    }

    /// Fault pages waiting in the release queue.
    pub fn pending_releases(&self) -> usize {
        self.lock_state().reclaimer.pending_pages()
    }

    /// Free fault-page slots.
    pub fn free_fault_pages(&self) -> usize {
        self.lock_state().alloc.free_count()
    }
}

impl<P: PageTableOps> Drop for Tracer<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.probes.is_empty() {
            let mut restored = 0;
            for entry in state.probes.values() {
                for &id in &entry.pages {
                    let page = self.table.get(id);
                    if page.is_armed() && arm::disarm(&self.mmu, page).is_ok() {
                        restored += 1;
                    }
                }
            }
            log::warn!(
                "kmmio: tracer dropped with {} probes registered, restored {} pages",
                state.probes.len(),
                restored
            );
        }

        let list = *self.probes.get_mut();
        if !list.is_null() {
            // SAFETY: `&mut self` rules out readers; the pointer came from
            // Box::into_raw.
            drop(unsafe { Box::from_raw(list) });
        }
    }
}
