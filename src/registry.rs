//! Probe registration and removal.
//!
//! Both run under the tracer's mutation lock. Registration takes a reference
//! on every page the range touches, arming a page on its first reference;
//! removal drops those references and queues pages that reached zero for
//! deferred release.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::arm;
use crate::error::{Error, Result};
use crate::fault_page::FaultPageId;
use crate::page_table::{PAGE_MASK, PAGE_SIZE, PageTableOps, TaskId};
use crate::probe::Probe;
use crate::tracer::{ProbeEntry, State, Tracer};

impl<P: PageTableOps> Tracer<P> {
    /// Register a probe.
    ///
    /// Pages that fail to translate, allocate or arm are logged and skipped;
    /// the probe is registered for the rest of its range. Must not be called
    /// from a unit that is in a handshake.
    pub fn register(&self, probe: Arc<Probe>) -> Result<()> {
        self.register_with(probe, false)
    }

    /// Register a probe, failing without side effects if any page of its
    /// range cannot be armed.
    pub fn register_strict(&self, probe: Arc<Probe>) -> Result<()> {
        self.register_with(probe, true)
    }

    fn register_with(&self, probe: Arc<Probe>, strict: bool) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        // Registered ranges are disjoint, so only the last probe starting
        // before our end can overlap.
        if let Some((_, entry)) = state.probes.range(..probe.end()).next_back() {
            if entry.probe.overlaps(probe.addr(), probe.end()) {
                log::warn!(
                    "kmmio: probe {:#x}+{:#x} overlaps {:#x}+{:#x}",
                    probe.addr(),
                    probe.len(),
                    entry.probe.addr(),
                    entry.probe.len()
                );
                return Err(Error::DuplicateRange {
                    addr: entry.probe.addr(),
                    len: entry.probe.len(),
                });
            }
        }

        let task = probe.task();
        if self.mmu.translate_scoped(probe.addr(), task).is_none() {
            log::warn!("kmmio: no translation for probe at {:#x}", probe.addr());
            return Err(Error::TranslationNotFound(probe.addr()));
        }

        let mut pages = Vec::new();
        let mut cur = probe.addr() & PAGE_MASK;
        while cur < probe.end() {
            let (base, size, taken) = match self.mmu.translate_scoped(cur, task) {
                Some(t) => {
                    let base = t.page_base(cur);
                    (base, t.level.size(), self.add_fault_page(state, base, task))
                }
                None => (cur, PAGE_SIZE, Err(Error::TranslationNotFound(cur))),
            };

            match taken {
                Ok(id) => pages.push(id),
                Err(e) if strict => {
                    log::warn!("kmmio: strict registration at {:#x} failed: {}", probe.addr(), e);
                    let batch = self.drop_pages(&pages, false);
                    state.reclaimer.defer_pages(batch, self.epochs.retire());
                    state.reclaimer.poll(&self.table, &self.epochs, &mut state.alloc);
                    return Err(e);
                }
                Err(e) => log::warn!("kmmio: skipping page {:#x}: {}", base, e),
            }

            match base.checked_add(size) {
                Some(next) => cur = next,
                None => break,
            }
        }

        log::info!(
            "kmmio: registered probe {:#x}+{:#x} ({} pages)",
            probe.addr(),
            probe.len(),
            pages.len()
        );
        state.probes.insert(probe.addr(), ProbeEntry { probe, pages });
        self.publish_probes(state);
        self.probe_count.fetch_add(1, Ordering::AcqRel);
        state.reclaimer.poll(&self.table, &self.epochs, &mut state.alloc);
        Ok(())
    }

    /// Take a reference on the fault page at `base`, creating and arming it
    /// if needed.
    fn add_fault_page(&self, state: &mut State, base: usize, task: Option<TaskId>) -> Result<FaultPageId> {
        if let Some(id) = self.table.lookup(base) {
            let page = self.table.get(id);
            // Released but not reclaimed yet: arm it again.
            if page.count() == 0 {
                arm::arm(&self.mmu, page)?;
            }
            page.inc_count();
            return Ok(id);
        }

        let id = self
            .table
            .allocate(&mut state.alloc, base, task)
            .ok_or(Error::AllocationFailure(base))?;
        if let Err(e) = arm::arm(&self.mmu, self.table.get(id)) {
            self.table.discard(&mut state.alloc, id);
            return Err(e);
        }
        self.table.publish(&mut state.alloc, id);
        log::debug!("kmmio: new fault page {:#x}", base);
        Ok(id)
    }

    /// Drop one reference on each page. Pages reaching zero are disarmed and
    /// returned for release.
    ///
    /// A page whose mapping is gone cannot be restored; it is only marked
    /// disarmed. That is expected when `dirty` is set.
    fn drop_pages(&self, pages: &[FaultPageId], dirty: bool) -> Vec<FaultPageId> {
        let mut release = Vec::new();
        for &id in pages {
            let page = self.table.get(id);
            if page.dec_count() > 0 {
                continue;
            }

            if let Err(e) = arm::disarm(&self.mmu, page) {
                if dirty {
                    log::debug!("kmmio: mapping at {:#x} already gone: {}", page.addr(), e);
                } else {
                    log::warn!("kmmio: leaving fault page {:#x} as is", page.addr());
                }
            }

            if !page.is_scheduled_for_release() {
                page.set_scheduled_for_release(true);
                release.push(id);
            }
        }
        release
    }

    /// Unregister a probe.
    ///
    /// With `dirty` set the probe's start address is not re-validated, for
    /// when the mapping may already be gone. Entries that still translate are
    /// restored either way. A task-scoped probe whose task has exited is
    /// always removed this way.
    ///
    /// Must not be called from a unit that is in a handshake.
    pub fn unregister(&self, probe: &Arc<Probe>, dirty: bool) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        match state.probes.get(&probe.addr()) {
            Some(entry) if Arc::ptr_eq(&entry.probe, probe) => {}
            _ => return Err(Error::NotFound),
        }

        let dirty = dirty || probe.task().is_some_and(|t| !self.mmu.task_alive(t));
        if !dirty && self.mmu.translate_scoped(probe.addr(), probe.task()).is_none() {
            log::warn!("kmmio: no translation for probe at {:#x}", probe.addr());
            return Err(Error::TranslationNotFound(probe.addr()));
        }

        let entry = state.probes.remove(&probe.addr()).ok_or(Error::NotFound)?;
        let release = self.drop_pages(&entry.pages, dirty);

        self.publish_probes(state);
        self.probe_count.fetch_sub(1, Ordering::AcqRel);
        state.reclaimer.defer_pages(release, self.epochs.retire());
        state.reclaimer.poll(&self.table, &self.epochs, &mut state.alloc);

        log::info!(
            "kmmio: unregistered probe {:#x}+{:#x}{}",
            probe.addr(),
            probe.len(),
            if dirty { " (dirty)" } else { "" }
        );
        Ok(())
    }
}
