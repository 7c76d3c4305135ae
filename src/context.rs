//! Per-unit trace context.
//!
//! Each execution unit owns exactly one [`UnitContext`], obtained from
//! [`Tracer::unit_context`](crate::Tracer::unit_context) and passed by the trap
//! dispatcher into both handshake entry points. It is never shared, so none of
//! its fields need synchronization.

use alloc::sync::Arc;

use crate::epoch::EpochDomain;
use crate::fault_page::FaultPageId;
use crate::probe::Probe;

/// State of one unit's in-flight handshake.
#[derive(Debug)]
pub struct UnitContext {
    unit: usize,
    active: bool,
    page: Option<FaultPageId>,
    page_addr: usize,
    probe: Option<Arc<Probe>>,
    /// TF/IF as they were before the fault.
    saved_flags: u64,
    /// Nesting depth of read-side sections on this unit.
    pin_depth: u32,
    start_ns: u64,
}

impl UnitContext {
    pub(crate) fn new(unit: usize) -> Self {
        Self {
            unit,
            active: false,
            page: None,
            page_addr: 0,
            probe: None,
            saved_flags: 0,
            pin_depth: 0,
            start_ns: 0,
        }
    }

    /// Execution unit index.
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Whether a handshake is between its fault and its step completion.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Fault page being serviced.
    pub fn page(&self) -> Option<FaultPageId> {
        self.page
    }

    /// Faulting address.
    pub fn page_addr(&self) -> usize {
        self.page_addr
    }

    /// Probe covering the faulting address, if any.
    pub fn probe(&self) -> Option<&Arc<Probe>> {
        self.probe.as_ref()
    }

    pub fn saved_flags(&self) -> u64 {
        self.saved_flags
    }

    /// Whether the unit currently holds an epoch pin.
    pub fn is_pinned(&self) -> bool {
        self.pin_depth > 0
    }

    pub(crate) fn pin(&mut self, epochs: &EpochDomain) {
        if self.pin_depth == 0 {
            epochs.pin(self.unit);
        }
        self.pin_depth += 1;
    }

    pub(crate) fn unpin(&mut self, epochs: &EpochDomain) {
        debug_assert!(self.pin_depth > 0, "kmmio: unbalanced unpin");
        self.pin_depth = self.pin_depth.saturating_sub(1);
        if self.pin_depth == 0 {
            epochs.unpin(self.unit);
        }
    }

    /// Start a handshake.
    ///
    /// # Panics
    /// If a handshake is already active; its state would be lost.
    pub(crate) fn begin(
        &mut self,
        page: FaultPageId,
        addr: usize,
        probe: Option<Arc<Probe>>,
        saved_flags: u64,
        now_ns: u64,
    ) {
        assert!(
            !self.active,
            "kmmio: unit {} context already active at {:#x}",
            self.unit,
            self.page_addr
        );
        self.active = true;
        self.page = Some(page);
        self.page_addr = addr;
        self.probe = probe;
        self.saved_flags = saved_flags;
        self.start_ns = now_ns;
    }

    /// End the handshake. Returns when it started.
    ///
    /// The probe reference is dropped here, before the unit unpins.
    pub(crate) fn finish(&mut self) -> u64 {
        self.active = false;
        self.page = None;
        self.probe = None;
        self.saved_flags = 0;
        self.start_ns
    }
}
