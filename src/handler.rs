//! Trap handshake: access fault, then single-step completion.
//!
//! The handshake for one access runs in two traps on the same unit:
//! 1. Access fault on an armed page - record the episode in the unit's
//!    context, run the pre callback, disarm the page and return to the
//!    faulting instruction with the trap flag set.
//! 2. Single-step completion - run the post callback, re-arm the page if it
//!    is still referenced, and restore the flags saved at step 1.
//!
//! The unit stays pinned from step 1 to step 2, which keeps the fault page
//! and the probe alive even if they are unregistered in between.

use crate::arm;
use crate::context::UnitContext;
use crate::page_table::PageTableOps;
use crate::platform;
use crate::tracer::Tracer;

/// Trap flag.
pub const TF: u64 = 1 << 8;
/// Interrupt enable flag.
pub const IF: u64 = 1 << 9;
/// Debug status: the trap was caused by single-stepping.
pub const DR6_BS: u64 = 1 << 14;

/// Result of [`Tracer::on_access_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was ours; resume the faulting instruction.
    Handled,
    /// Not ours, or ours but needing the regular fault path.
    Unhandled,
}

/// Result of [`Tracer::on_step_completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step completion consumed.
    Handled,
    /// No handshake was in flight on this unit.
    NotOurs,
    /// Consumed, but someone else is also single-stepping: keep processing
    /// the debug trap.
    NotExclusive,
}

impl<P: PageTableOps> Tracer<P> {
    /// Access-fault entry point.
    ///
    /// `flags` are the faulting context's saved flags and are modified in
    /// place when the fault is handled.
    pub fn on_access_fault(
        &self,
        ctx: &mut UnitContext,
        flags: &mut u64,
        addr: usize,
        error_code: u64,
    ) -> FaultOutcome {
        ctx.pin(&self.epochs);
        let outcome = self.begin_handshake(ctx, flags, addr, error_code);
        if outcome == FaultOutcome::Unhandled {
            ctx.unpin(&self.epochs);
        }
        outcome
    }

    fn begin_handshake(
        &self,
        ctx: &mut UnitContext,
        flags: &mut u64,
        addr: usize,
        error_code: u64,
    ) -> FaultOutcome {
        let Some(translation) = self.mmu.translate(addr) else {
            return FaultOutcome::Unhandled;
        };
        let page_base = translation.page_base(addr);

        // Either not a traced page, or its probe was pulled just now.
        let Some(id) = self.table.lookup(page_base) else {
            return FaultOutcome::Unhandled;
        };
        let page = self.table.get(id);

        if ctx.is_active() {
            if ctx.page_addr() == page_base {
                // Something else needs the regular fault path, most likely the
                // page really not being present.
                self.stats.record_secondary_hit();
                log::debug!("kmmio: secondary hit for {:#x} on unit {}", addr, ctx.unit());
                if page.old_presence() == 0 {
                    log::info!(
                        "kmmio: unexpected secondary hit for {:#x} on unit {}",
                        addr,
                        ctx.unit()
                    );
                }
            } else {
                // Keep the episode in flight; disarming at least lets the
                // access through.
                self.stats.record_recursive_fault();
                log::error!(
                    "kmmio: recursive probe hit on unit {} for {:#x}, ignoring",
                    ctx.unit(),
                    addr
                );
                log::error!("kmmio: previous hit was at {:#x}", ctx.page_addr());
                let _ = arm::disarm(&self.mmu, page);
            }
            return FaultOutcome::Unhandled;
        }

        // SAFETY: pinned above, until the step completes.
        let probe = unsafe { self.probe_list() }.find(addr).cloned();
        if probe.is_none() {
            self.stats.record_miss();
        }

        ctx.begin(id, page_base, probe, *flags & (TF | IF), platform::time_ns());

        if let Some(probe) = ctx.probe() {
            if let Some(handler) = probe.handler() {
                handler.pre_handler(probe, addr, error_code);
            }
        }

        // Interrupts stay off while stepping.
        *flags |= TF;
        *flags &= !IF;

        let _ = arm::disarm(&self.mmu, page);
        self.stats.record_hit();
        log::trace!("kmmio: stepping {:#x} on unit {}", addr, ctx.unit());
        FaultOutcome::Handled
    }

    /// Single-step completion entry point.
    pub fn on_step_completed(&self, ctx: &mut UnitContext, flags: &mut u64, condition: u64) -> StepOutcome {
        let Some(id) = ctx.page().filter(|_| ctx.is_active()) else {
            // External debugger, or a step we never asked for.
            self.stats.record_unexpected_step();
            log::warn!("kmmio: unexpected debug trap on unit {}", ctx.unit());
            return StepOutcome::NotOurs;
        };

        if let Some(probe) = ctx.probe() {
            if let Some(handler) = probe.handler() {
                handler.post_handler(probe, condition);
            }
        }

        {
            // Serializes against release of the page.
            let _state = self.lock_state();
            let page = self.table.get(id);
            if page.count() > 0 {
                let _ = arm::arm(&self.mmu, page);
            }
        }

        *flags &= !TF;
        *flags |= ctx.saved_flags();

        let started = ctx.finish();
        ctx.unpin(&self.epochs);
        self.stats
            .add_stepping_time(platform::time_ns().saturating_sub(started));

        if *flags & TF != 0 {
            StepOutcome::NotExclusive
        } else {
            StepOutcome::Handled
        }
    }

    /// Debug-trap notifier: acts on single-step traps only.
    ///
    /// Clears [`DR6_BS`] in `dr6` and returns `true` when the step completion
    /// was consumed by this tracer.
    pub fn notify_debug(&self, ctx: &mut UnitContext, flags: &mut u64, dr6: &mut u64) -> bool {
        if *dr6 & DR6_BS == 0 {
            return false;
        }
        if self.on_step_completed(ctx, flags, *dr6) == StepOutcome::Handled {
            *dr6 &= !DR6_BS;
            return true;
        }
        false
    }
}
