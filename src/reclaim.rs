//! Deferred release of fault pages and probe-list snapshots.
//!
//! A fault page dropped by `unregister` goes through two grace periods:
//!
//! 1. After the first, pages whose count is still zero are unlinked from the
//!    table. Pages that were taken again in the meantime leave the batch.
//! 2. After the second, the unlinked slots go back to the allocator.
//!
//! A unit that found a page through the table before it was unlinked may still
//! be using it until it unpins, which is what the second grace period waits
//! for. Retired probe lists need a single grace period.
//!
//! Everything here runs under the tracer's mutation lock and never on the
//! trap path.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::epoch::EpochDomain;
use crate::fault_page::{FaultPageId, FaultPageTable, SlotAllocator};
use crate::probe::ProbeList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting to be unlinked.
    Unlink,
    /// Unlinked, waiting to be freed.
    Free,
}

/// Pages released by one `unregister` call.
#[derive(Debug)]
struct ReleaseBatch {
    pages: Vec<FaultPageId>,
    stage: Stage,
    /// Epoch the current stage waits on.
    epoch: u64,
}

/// A probe list that was replaced and may still be read.
struct RetiredList {
    list: NonNull<ProbeList>,
    epoch: u64,
}

// SAFETY: the list is only freed, never accessed, by the owner of the entry.
unsafe impl Send for RetiredList {}

/// Grace-period driven release queue.
#[derive(Default)]
pub(crate) struct Reclaimer {
    batches: VecDeque<ReleaseBatch>,
    lists: VecDeque<RetiredList>,
}

impl Reclaimer {
    /// Queue pages whose count dropped to zero. `epoch` comes from
    /// [`EpochDomain::retire`].
    pub fn defer_pages(&mut self, pages: Vec<FaultPageId>, epoch: u64) {
        if pages.is_empty() {
            return;
        }
        log::debug!("kmmio: deferring release of {} fault pages", pages.len());
        self.batches.push_back(ReleaseBatch {
            pages,
            stage: Stage::Unlink,
            epoch,
        });
    }

    /// Queue a probe list that was swapped out.
    ///
    /// # Safety
    /// `list` must come from `Box::into_raw` and no longer be reachable by new
    /// readers.
    pub unsafe fn defer_list(&mut self, list: NonNull<ProbeList>, epoch: u64) {
        self.lists.push_back(RetiredList { list, epoch });
    }

    /// Pages still waiting for either stage.
    pub fn pending_pages(&self) -> usize {
        self.batches.iter().map(|b| b.pages.len()).sum()
    }

    /// Whether nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.batches.is_empty() && self.lists.is_empty()
    }

    /// Advance every entry whose grace period has elapsed, until nothing moves.
    pub fn poll(
        &mut self,
        table: &FaultPageTable,
        epochs: &EpochDomain,
        alloc: &mut SlotAllocator,
    ) -> bool {
        let mut progressed = false;
        loop {
            let moved = self.poll_lists(epochs) | self.poll_batches(table, epochs, alloc);
            if !moved {
                return progressed;
            }
            progressed = true;
        }
    }

    fn poll_lists(&mut self, epochs: &EpochDomain) -> bool {
        let before = self.lists.len();
        self.lists.retain(|retired| {
            if !epochs.grace_elapsed(retired.epoch) {
                return true;
            }
            // SAFETY: every reader that could see the list has unpinned.
            drop(unsafe { Box::from_raw(retired.list.as_ptr()) });
            false
        });
        self.lists.len() != before
    }

    fn poll_batches(
        &mut self,
        table: &FaultPageTable,
        epochs: &EpochDomain,
        alloc: &mut SlotAllocator,
    ) -> bool {
        let mut moved = false;
        let mut still_pending = VecDeque::with_capacity(self.batches.len());

        while let Some(mut batch) = self.batches.pop_front() {
            if !epochs.grace_elapsed(batch.epoch) {
                still_pending.push_back(batch);
                continue;
            }
            moved = true;
            match batch.stage {
                Stage::Unlink => {
                    unlink_released(table, alloc, &mut batch.pages);
                    if !batch.pages.is_empty() {
                        batch.stage = Stage::Free;
                        batch.epoch = epochs.retire();
                        still_pending.push_back(batch);
                    }
                }
                Stage::Free => free_released(table, alloc, &batch.pages),
            }
        }

        self.batches = still_pending;
        moved
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        for retired in self.lists.drain(..) {
            // SAFETY: the reclaimer is dropped with its tracer; no readers remain.
            drop(unsafe { Box::from_raw(retired.list.as_ptr()) });
        }
    }
}

/// First stage: unlink pages nobody took back.
fn unlink_released(table: &FaultPageTable, alloc: &mut SlotAllocator, pages: &mut Vec<FaultPageId>) {
    pages.retain(|&id| {
        let page = table.get(id);
        if page.count() == 0 {
            table.unlink(alloc, id);
            log::trace!("kmmio: unlinked fault page {:#x}", page.addr());
            true
        } else {
            // Re-registered since the release was queued.
            page.set_scheduled_for_release(false);
            false
        }
    });
}

/// Second stage: return slots to the allocator.
fn free_released(table: &FaultPageTable, alloc: &mut SlotAllocator, pages: &[FaultPageId]) {
    for &id in pages {
        let page = table.get(id);
        assert_eq!(
            page.count(),
            0,
            "kmmio: releasing fault page {:#x} still in use",
            page.addr()
        );
        page.set_scheduled_for_release(false);
        table.free(alloc, id);
        log::trace!("kmmio: freed fault page {:#x}", page.addr());
    }
}
