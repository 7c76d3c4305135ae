//! In-memory page tables.
//!
//! [`SoftMmu`] implements [`PageTableOps`] over a set of mappings held in
//! memory, so the tracer can run in user space: mappings are added with
//! [`SoftMmu::map`], and [`SoftMmu::access`] plays the part of the MMU by
//! reporting an access fault when the entry backing an address is not present.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::page_table::{EntryHandle, PageLevel, PageTableOps, TaskId, Translation, pte_bits};

/// Page-fault error code bit: the access was a write.
pub const PF_WRITE: u64 = 1 << 1;

/// Address space of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Space {
    Kernel,
    Task(TaskId),
}

#[derive(Default)]
struct Inner {
    /// Entry encodings, indexed by `EntryHandle`.
    entries: Vec<u64>,
    /// Page base → (entry index, level), per address space.
    spaces: BTreeMap<Space, BTreeMap<usize, (usize, PageLevel)>>,
    current_task: Option<TaskId>,
    dead: BTreeSet<TaskId>,
}

impl Inner {
    fn find(&self, space: Space, addr: usize) -> Option<Translation> {
        let pages = self.spaces.get(&space)?;
        [
            PageLevel::Size4K,
            PageLevel::Size2M,
            PageLevel::Size1G,
            PageLevel::Size512G,
        ]
        .into_iter()
        .find_map(|level| match pages.get(&(addr & level.mask())) {
            Some(&(idx, l)) if l == level => Some(Translation {
                entry: EntryHandle(idx),
                level,
            }),
            _ => None,
        })
    }

    fn translate(&self, addr: usize) -> Option<Translation> {
        self.find(Space::Kernel, addr).or_else(|| {
            let task = self.current_task?;
            self.find(Space::Task(task), addr)
        })
    }

    fn map(&mut self, space: Space, base: usize, level: PageLevel, entry: u64) -> EntryHandle {
        let base = base & level.mask();
        let idx = self.entries.len();
        self.entries.push(entry);
        self.spaces.entry(space).or_default().insert(base, (idx, level));
        EntryHandle(idx)
    }
}

/// Software translation tables with fault simulation.
pub struct SoftMmu {
    inner: Mutex<Inner>,
    flushes: AtomicUsize,
}

impl SoftMmu {
    /// Create an empty MMU with no mappings.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Map `base` (aligned down to `level`) in the kernel address space.
    pub fn map(&self, base: usize, level: PageLevel, entry: u64) -> EntryHandle {
        self.inner.lock().map(Space::Kernel, base, level, entry)
    }

    /// Map `base` in the address space of `task`.
    pub fn map_in(&self, task: TaskId, base: usize, level: PageLevel, entry: u64) -> EntryHandle {
        self.inner.lock().map(Space::Task(task), base, level, entry)
    }

    /// Remove the kernel mapping covering `addr`.
    pub fn unmap(&self, addr: usize) -> bool {
        let mut inner = self.inner.lock();
        let Some(t) = inner.find(Space::Kernel, addr) else {
            return false;
        };
        let base = t.page_base(addr);
        inner
            .spaces
            .get_mut(&Space::Kernel)
            .is_some_and(|pages| pages.remove(&base).is_some())
    }

    /// Select the task whose address space backs non-kernel translations.
    pub fn set_current_task(&self, task: Option<TaskId>) {
        self.inner.lock().current_task = task;
    }

    /// Tear down a task: its mappings disappear and it reports as dead.
    pub fn kill_task(&self, task: TaskId) {
        let mut inner = self.inner.lock();
        inner.spaces.remove(&Space::Task(task));
        inner.dead.insert(task);
        if inner.current_task == Some(task) {
            inner.current_task = None;
        }
    }

    /// Encoding of the entry mapping `addr` in the current address space.
    pub fn entry_at(&self, addr: usize) -> Option<u64> {
        let inner = self.inner.lock();
        let t = inner.translate(addr)?;
        Some(inner.entries[t.entry.0])
    }

    /// Encoding of the entry mapping `addr` in `task`'s address space.
    pub fn entry_in(&self, task: TaskId, addr: usize) -> Option<u64> {
        let inner = self.inner.lock();
        let t = inner.find(Space::Task(task), addr)?;
        Some(inner.entries[t.entry.0])
    }

    /// Simulate a load or store to `addr`.
    ///
    /// Returns the page-fault error code when the access faults: the address
    /// is unmapped or its entry is not present.
    pub fn access(&self, addr: usize, write: bool) -> Result<(), u64> {
        let code = if write { PF_WRITE } else { 0 };
        match self.entry_at(addr) {
            Some(entry) if entry & pte_bits::PRESENT != 0 => Ok(()),
            _ => Err(code),
        }
    }

    /// Number of TLB invalidations requested so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableOps for SoftMmu {
    fn translate(&self, addr: usize) -> Option<Translation> {
        self.inner.lock().translate(addr)
    }

    fn translate_in(&self, addr: usize, task: TaskId) -> Option<Translation> {
        self.inner.lock().find(Space::Task(task), addr)
    }

    fn task_alive(&self, task: TaskId) -> bool {
        !self.inner.lock().dead.contains(&task)
    }

    fn read_entry(&self, entry: EntryHandle) -> u64 {
        self.inner.lock().entries[entry.0]
    }

    fn write_entry(&self, entry: EntryHandle, val: u64) {
        self.inner.lock().entries[entry.0] = val;
    }

    fn flush_tlb_one(&self, _addr: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
