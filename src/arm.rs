//! Arm/disarm engine: revoke and restore access to a fault page.
//!
//! Arming saves the entry backing the page and rewrites it as not present;
//! disarming writes the saved encoding back. Both invalidate the cached
//! translation on the calling unit. Each call holds the page's entry lock, so
//! an unlocked disarm on the trap path cannot interleave with a re-arm issued
//! from another unit.

use crate::error::{Error, Result};
use crate::fault_page::FaultPage;
use crate::page_table::{PageLevel, PageTableOps, pte_bits};

/// Rewrite or restore the entry behind `page`.
///
/// With `clear`, `saved` receives the entry's current encoding unless
/// `keep_saved` is set, and the entry is made not present. Without `clear`,
/// the entry is set to `saved`.
fn set_presence<P: PageTableOps + ?Sized>(
    mmu: &P,
    page: &FaultPage,
    clear: bool,
    keep_saved: bool,
) -> Result<()> {
    let addr = page.addr();
    let Some(translation) = mmu.translate_scoped(addr, page.task()) else {
        log::error!("kmmio: no pte for addr {:#x}", addr);
        return Err(Error::TranslationNotFound(addr));
    };
    let entry = translation.entry;

    match translation.level {
        PageLevel::Size1G | PageLevel::Size2M => {
            if clear {
                let old = if keep_saved {
                    page.old_presence()
                } else {
                    let v = mmu.read_entry(entry);
                    page.set_old_presence(v);
                    v
                };
                mmu.write_entry(entry, old & !(pte_bits::PRESENT | pte_bits::PROTNONE));
            } else {
                mmu.write_entry(entry, page.old_presence());
            }
        }
        PageLevel::Size4K => {
            if clear {
                if !keep_saved {
                    page.set_old_presence(mmu.read_entry(entry));
                }
                mmu.write_entry(entry, 0);
            } else {
                mmu.write_entry(entry, page.old_presence());
            }
        }
        level => {
            log::error!("kmmio: unexpected page level {:?} at {:#x}", level, addr);
            return Err(Error::UnsupportedLevel(addr));
        }
    }

    mmu.flush_tlb_one(addr);
    Ok(())
}

/// Make `page` inaccessible so the next access to it faults.
///
/// Arming an already armed page is a protocol violation. The live entry is
/// then unreliable (it is the cleared encoding), so the previously saved
/// encoding is kept and only the entry is cleared again.
pub fn arm<P: PageTableOps + ?Sized>(mmu: &P, page: &FaultPage) -> Result<()> {
    let _entry = page.lock_entry();
    let double = page.is_armed();
    if double {
        log::warn!(
            "kmmio: double-arm: addr {:#x}, ref {}, old {}",
            page.addr(),
            page.count(),
            page.old_presence() & pte_bits::PRESENT != 0
        );
    }

    let ret = set_presence(mmu, page, true, double);
    if let Err(e) = ret {
        log::error!("kmmio: arming at {:#x} failed: {}", page.addr(), e);
        return Err(e);
    }
    page.set_armed(true);
    log::trace!("kmmio: armed {:#x} (old {:#x})", page.addr(), page.old_presence());
    Ok(())
}

/// Restore `page` to its saved encoding.
///
/// Double disarm is allowed; it happens when a fault and a removal race.
/// The page counts as disarmed afterwards even when the restore fails.
pub fn disarm<P: PageTableOps + ?Sized>(mmu: &P, page: &FaultPage) -> Result<()> {
    let _entry = page.lock_entry();
    let ret = set_presence(mmu, page, false, false);
    page.set_armed(false);
    if let Err(e) = ret {
        log::warn!("kmmio: disarming at {:#x} failed: {}", page.addr(), e);
        return Err(e);
    }
    log::trace!("kmmio: disarmed {:#x}", page.addr());
    Ok(())
}
