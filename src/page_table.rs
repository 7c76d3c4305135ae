//! Translation-table access used by the arm/disarm engine.
//!
//! The tracer never walks page tables itself; it consumes a [`PageTableOps`]
//! implementation that maps a virtual address to the entry backing it and the
//! granularity of that mapping. [`HwPageTable`] is the x86_64 implementation
//! for the kernel's own address space; `soft_mmu::SoftMmu` is an in-memory one.

/// Smallest page size (4KB)
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Task (address space) identifier for task-scoped probes.
pub type TaskId = u32;

/// x86_64 page table entry bits
pub mod pte_bits {
    /// Present bit
    pub const PRESENT: u64 = 1 << 0;
    /// Writable bit
    pub const RW: u64 = 1 << 1;
    /// Page size bit: entry maps a 2MB / 1GB page
    pub const HUGE: u64 = 1 << 7;
    /// Software PROT_NONE bit (aliases GLOBAL on present entries)
    pub const PROTNONE: u64 = 1 << 8;
    /// Address mask for next-level table or output address
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

/// Granularity at which an address is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageLevel {
    /// 4KB page (PTE)
    Size4K,
    /// 2MB page (PMD)
    Size2M,
    /// 1GB page (PUD)
    Size1G,
    /// 512GB page (P4D); never armed
    Size512G,
}

impl PageLevel {
    /// Bytes covered by one entry at this level.
    pub const fn size(self) -> usize {
        match self {
            PageLevel::Size4K => 1 << 12,
            PageLevel::Size2M => 1 << 21,
            PageLevel::Size1G => 1 << 30,
            PageLevel::Size512G => 1 << 39,
        }
    }

    /// Mask selecting the page base at this level.
    pub const fn mask(self) -> usize {
        !(self.size() - 1)
    }
}

/// Opaque handle to a translation-table entry.
///
/// For [`HwPageTable`] this is the virtual address of the entry itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryHandle(pub usize);

/// Result of a translation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Entry mapping the address.
    pub entry: EntryHandle,
    /// Granularity of that entry.
    pub level: PageLevel,
}

impl Translation {
    /// Base of the page containing `addr` at this translation's granularity.
    pub fn page_base(&self, addr: usize) -> usize {
        addr & self.level.mask()
    }
}

/// Translation lookup and entry access.
///
/// `translate` must return entries that are currently not present as long as
/// the mapping itself exists, so armed pages can be found again.
pub trait PageTableOps: Send + Sync {
    /// Translate in the current address space (kernel first, then the current task).
    fn translate(&self, addr: usize) -> Option<Translation>;

    /// Translate in the address space of `task`.
    fn translate_in(&self, addr: usize, task: TaskId) -> Option<Translation> {
        let _ = task;
        self.translate(addr)
    }

    /// Whether `task` still exists.
    fn task_alive(&self, task: TaskId) -> bool {
        let _ = task;
        true
    }

    /// Read the raw encoding of an entry.
    fn read_entry(&self, entry: EntryHandle) -> u64;

    /// Overwrite the raw encoding of an entry.
    fn write_entry(&self, entry: EntryHandle, val: u64);

    /// Invalidate the cached translation for `addr` on the calling unit.
    fn flush_tlb_one(&self, addr: usize);

    /// Translate in `task`'s address space when given one, else the current one.
    fn translate_scoped(&self, addr: usize, task: Option<TaskId>) -> Option<Translation> {
        match task {
            Some(task) => self.translate_in(addr, task),
            None => self.translate(addr),
        }
    }
}

// =============================================================================
// 4-level walk
// =============================================================================

/// Physical memory reader used by [`walk`].
pub trait PtReader {
    /// Read one 64-bit table entry at a physical address.
    fn read_u64(&self, paddr: u64) -> Option<u64>;
}

/// Walk the x86_64 4-level page table rooted at `root` for `vaddr`.
///
/// Returns the physical address of the entry that maps `vaddr` and its level.
/// Large and non-present (but non-empty) PDPT/PD entries terminate the walk at
/// their level, which is how armed superpages stay discoverable. Missing
/// intermediate tables yield `None`.
pub fn walk<R: PtReader + ?Sized>(reader: &R, root: u64, vaddr: usize) -> Option<(u64, PageLevel)> {
    use pte_bits::*;

    let vaddr = vaddr as u64;
    let l4_idx = (vaddr >> 39) & 0x1FF;
    let l3_idx = (vaddr >> 30) & 0x1FF;
    let l2_idx = (vaddr >> 21) & 0x1FF;
    let l1_idx = (vaddr >> 12) & 0x1FF;

    // PML4
    let l4_addr = (root & ADDR_MASK) + l4_idx * 8;
    let l4_entry = reader.read_u64(l4_addr)?;
    log::trace!("page_table: PML4[{}] = {:#x}", l4_idx, l4_entry);
    if l4_entry & PRESENT == 0 {
        return None;
    }

    // PDPT (1GB)
    let l3_addr = (l4_entry & ADDR_MASK) + l3_idx * 8;
    let l3_entry = reader.read_u64(l3_addr)?;
    log::trace!("page_table: PDPT[{}] = {:#x}", l3_idx, l3_entry);
    if l3_entry == 0 {
        return None;
    }
    if l3_entry & HUGE != 0 || l3_entry & PRESENT == 0 {
        return Some((l3_addr, PageLevel::Size1G));
    }

    // PD (2MB)
    let l2_addr = (l3_entry & ADDR_MASK) + l2_idx * 8;
    let l2_entry = reader.read_u64(l2_addr)?;
    log::trace!("page_table: PD[{}] = {:#x}", l2_idx, l2_entry);
    if l2_entry == 0 {
        return None;
    }
    if l2_entry & HUGE != 0 || l2_entry & PRESENT == 0 {
        return Some((l2_addr, PageLevel::Size2M));
    }

    // PT (4KB); the entry itself may be cleared while armed
    let l1_addr = (l2_entry & ADDR_MASK) + l1_idx * 8;
    Some((l1_addr, PageLevel::Size4K))
}

// =============================================================================
// Hardware implementation
// =============================================================================

#[cfg(target_arch = "x86_64")]
pub use hw::HwPageTable;

#[cfg(target_arch = "x86_64")]
mod hw {
    use alloc::collections::BTreeMap;
    use spin::Mutex;

    use super::*;

    /// Reads physical memory through a linear physical-memory mapping.
    struct DirectMap(usize);

    impl PtReader for DirectMap {
        fn read_u64(&self, paddr: u64) -> Option<u64> {
            let vaddr = self.0.checked_add(paddr as usize)?;
            Some(unsafe { core::ptr::read_volatile(vaddr as *const u64) })
        }
    }

    /// Read CR3 to get the current page table root (physical address).
    fn current_root() -> u64 {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3 & pte_bits::ADDR_MASK
    }

    /// x86_64 page tables accessed through the kernel's linear map.
    pub struct HwPageTable {
        phys_offset: usize,
        /// Page table roots of tasks that own task-scoped probes.
        task_roots: Mutex<BTreeMap<TaskId, u64>>,
    }

    impl HwPageTable {
        /// Create a page table accessor.
        ///
        /// # Safety
        /// `phys_offset + paddr` must be a valid, writable mapping of every
        /// physical address that holds a page table, and the caller must run at
        /// a privilege level allowed to read CR3 and execute `invlpg`.
        pub const unsafe fn new(phys_offset: usize) -> Self {
            Self {
                phys_offset,
                task_roots: Mutex::new(BTreeMap::new()),
            }
        }

        /// Record the page table root of `task`.
        pub fn set_task_root(&self, task: TaskId, root: u64) {
            self.task_roots.lock().insert(task, root);
        }

        /// Forget `task`; its probes will be removed through the dirty path.
        pub fn remove_task(&self, task: TaskId) {
            self.task_roots.lock().remove(&task);
        }

        fn translate_root(&self, root: u64, addr: usize) -> Option<Translation> {
            let (paddr, level) = walk(&DirectMap(self.phys_offset), root, addr)?;
            Some(Translation {
                entry: EntryHandle(self.phys_offset + paddr as usize),
                level,
            })
        }
    }

    impl PageTableOps for HwPageTable {
        fn translate(&self, addr: usize) -> Option<Translation> {
            self.translate_root(current_root(), addr)
        }

        fn translate_in(&self, addr: usize, task: TaskId) -> Option<Translation> {
            let root = self.task_roots.lock().get(&task).copied()?;
            self.translate_root(root, addr)
        }

        fn task_alive(&self, task: TaskId) -> bool {
            self.task_roots.lock().contains_key(&task)
        }

        fn read_entry(&self, entry: EntryHandle) -> u64 {
            unsafe { core::ptr::read_volatile(entry.0 as *const u64) }
        }

        fn write_entry(&self, entry: EntryHandle, val: u64) {
            unsafe { core::ptr::write_volatile(entry.0 as *mut u64, val) }
        }

        fn flush_tlb_one(&self, addr: usize) {
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
            }
        }
    }
}
