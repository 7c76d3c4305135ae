//! Fault-page records and the hash table that indexes them.
//!
//! Records live in a fixed arena and are chained into [`TABLE_SIZE`] buckets
//! through slot indices. Readers walk the chains without locking. Structural
//! changes take a [`SlotAllocator`], which only exists inside the tracer's
//! mutation lock, so holding `&mut SlotAllocator` is the proof of exclusivity.
//!
//! A slot is fully initialised before it is published into a bucket. An
//! unlinked slot keeps its `next` link so a reader standing on it can finish
//! its walk, and it is only handed back to the allocator after a grace period.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

use crate::page_table::TaskId;
use crate::platform::IrqGuard;

/// Bucket count is `1 << TABLE_BITS`.
pub const TABLE_BITS: u32 = 4;
pub const TABLE_SIZE: usize = 1 << TABLE_BITS;

/// Chain terminator.
const NIL: u32 = u32::MAX;

const NO_TASK: u64 = u64::MAX;

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

#[inline]
fn bucket_of(addr: usize) -> usize {
    ((addr as u64).wrapping_mul(GOLDEN_RATIO_64) >> (64 - TABLE_BITS)) as usize
}

/// Index of a fault-page slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaultPageId(u32);

impl FaultPageId {
    /// Raw slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Held entry lock of a [`FaultPage`]. Unlocks before interrupts come back.
pub(crate) struct EntryGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    _irq: IrqGuard,
}

/// One protected page.
///
/// `count` is only written under the mutation lock. `armed` and
/// `old_presence` are written by the arm/disarm engine while it holds the
/// page's entry lock, together with the entry itself.
#[derive(Debug)]
pub struct FaultPage {
    entry_lock: Mutex<()>,
    addr: AtomicUsize,
    task: AtomicU64,
    old_presence: AtomicU64,
    armed: AtomicBool,
    count: AtomicU32,
    scheduled_for_release: AtomicBool,
    next: AtomicU32,
}

impl FaultPage {
    const fn new() -> Self {
        Self {
            entry_lock: Mutex::new(()),
            addr: AtomicUsize::new(0),
            task: AtomicU64::new(NO_TASK),
            old_presence: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            count: AtomicU32::new(0),
            scheduled_for_release: AtomicBool::new(false),
            next: AtomicU32::new(NIL),
        }
    }

    /// Serializes updates of the backing entry and the `armed` flag.
    ///
    /// Local interrupts stay disabled while the lock is held.
    pub(crate) fn lock_entry(&self) -> EntryGuard<'_> {
        let irq = IrqGuard::new();
        EntryGuard {
            _lock: self.entry_lock.lock(),
            _irq: irq,
        }
    }

    /// Page-aligned address (aligned to the page's own granularity).
    pub fn addr(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    /// Address space the page was armed in, `None` for the current one.
    pub fn task(&self) -> Option<TaskId> {
        match self.task.load(Ordering::Acquire) {
            NO_TASK => None,
            task => Some(task as TaskId),
        }
    }

    /// Entry encoding saved by the last arm.
    pub fn old_presence(&self) -> u64 {
        self.old_presence.load(Ordering::Acquire)
    }

    pub(crate) fn set_old_presence(&self, val: u64) {
        self.old_presence.store(val, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub(crate) fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    /// Number of probes covering this page.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Take one more reference. Mutation lock held.
    pub(crate) fn inc_count(&self) -> u32 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference. Mutation lock held.
    ///
    /// # Panics
    /// If the count would go negative.
    pub(crate) fn dec_count(&self) -> u32 {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "kmmio: fault page {:#x} refcount underflow", self.addr());
        old - 1
    }

    pub fn is_scheduled_for_release(&self) -> bool {
        self.scheduled_for_release.load(Ordering::Acquire)
    }

    pub(crate) fn set_scheduled_for_release(&self, scheduled: bool) {
        self.scheduled_for_release.store(scheduled, Ordering::Release);
    }

    fn reset(&self, addr: usize, task: Option<TaskId>) {
        self.addr.store(addr, Ordering::Relaxed);
        self.task
            .store(task.map_or(NO_TASK, |t| t as u64), Ordering::Relaxed);
        self.old_presence.store(0, Ordering::Relaxed);
        self.armed.store(false, Ordering::Relaxed);
        self.count.store(1, Ordering::Relaxed);
        self.scheduled_for_release.store(false, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
    }
}

/// Free-slot list. Only reachable through the tracer's mutation lock.
pub struct SlotAllocator {
    free: Vec<u32>,
}

impl SlotAllocator {
    /// All `capacity` slots free, lowest index handed out first.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Fixed-size hash table of fault pages keyed by page address.
pub struct FaultPageTable {
    buckets: [AtomicU32; TABLE_SIZE],
    slots: Box<[FaultPage]>,
}

impl FaultPageTable {
    /// Create a table backed by `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<FaultPage> = (0..capacity).map(|_| FaultPage::new()).collect();
        Self {
            buckets: [const { AtomicU32::new(NIL) }; TABLE_SIZE],
            slots: slots.into_boxed_slice(),
        }
    }

    /// Slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Access a slot.
    pub fn get(&self, id: FaultPageId) -> &FaultPage {
        &self.slots[id.index()]
    }

    /// Find the published record for a page address.
    ///
    /// Safe to call concurrently with insert/unlink. The caller must be pinned
    /// for the returned id to keep naming the same page.
    pub fn lookup(&self, addr: usize) -> Option<FaultPageId> {
        let mut idx = self.buckets[bucket_of(addr)].load(Ordering::Acquire);
        while idx != NIL {
            let page = &self.slots[idx as usize];
            if page.addr() == addr {
                return Some(FaultPageId(idx));
            }
            idx = page.next.load(Ordering::Acquire);
        }
        None
    }

    /// Take a free slot and initialise it for `addr` with a count of one.
    /// The slot is not visible to readers until [`publish`](Self::publish).
    pub fn allocate(
        &self,
        alloc: &mut SlotAllocator,
        addr: usize,
        task: Option<TaskId>,
    ) -> Option<FaultPageId> {
        let idx = alloc.free.pop()?;
        self.slots[idx as usize].reset(addr, task);
        Some(FaultPageId(idx))
    }

    /// Return a slot that was allocated but never published.
    pub fn discard(&self, alloc: &mut SlotAllocator, id: FaultPageId) {
        alloc.free.push(id.0);
    }

    /// Link an allocated slot at the head of its bucket.
    pub fn publish(&self, _alloc: &mut SlotAllocator, id: FaultPageId) {
        let page = self.get(id);
        let bucket = &self.buckets[bucket_of(page.addr())];
        page.next.store(bucket.load(Ordering::Acquire), Ordering::Relaxed);
        bucket.store(id.0, Ordering::Release);
    }

    /// Remove a slot from its bucket chain. Readers already on it may still
    /// follow its `next` link.
    pub fn unlink(&self, _alloc: &mut SlotAllocator, id: FaultPageId) -> bool {
        let page = self.get(id);
        let next = page.next.load(Ordering::Acquire);
        let bucket = &self.buckets[bucket_of(page.addr())];

        let mut link = bucket;
        loop {
            let cur = link.load(Ordering::Acquire);
            if cur == NIL {
                log::warn!("kmmio: fault page {:#x} not linked", page.addr());
                return false;
            }
            if cur == id.0 {
                link.store(next, Ordering::Release);
                return true;
            }
            link = &self.slots[cur as usize].next;
        }
    }

    /// Hand a slot back after its grace periods.
    pub fn free(&self, alloc: &mut SlotAllocator, id: FaultPageId) {
        alloc.free.push(id.0);
    }

    /// Whether no record is linked.
    pub fn is_empty(&self) -> bool {
        self.buckets
            .iter()
            .all(|bucket| bucket.load(Ordering::Acquire) == NIL)
    }

    /// Number of linked records.
    pub fn len(&self) -> usize {
        let mut n = 0;
        for bucket in &self.buckets {
            let mut idx = bucket.load(Ordering::Acquire);
            while idx != NIL {
                n += 1;
                idx = self.slots[idx as usize].next.load(Ordering::Acquire);
            }
        }
        n
    }
}
