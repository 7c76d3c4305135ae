//! Probe definitions and the read-side probe list.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::page_table::TaskId;

/// Callbacks invoked around an intercepted access.
///
/// Both run on the faulting unit in trap context: they must not block and
/// must not register or unregister probes.
pub trait ProbeHandler: Send + Sync {
    /// Called before the faulting instruction is re-executed.
    fn pre_handler(&self, probe: &Probe, addr: usize, error_code: u64) {
        let _ = (probe, addr, error_code);
    }

    /// Called after the instruction has been single-stepped.
    fn post_handler(&self, probe: &Probe, condition: u64) {
        let _ = (probe, condition);
    }
}

/// A traced address range.
pub struct Probe {
    addr: usize,
    len: usize,
    task: Option<TaskId>,
    handler: Option<Arc<dyn ProbeHandler>>,
}

impl core::fmt::Debug for Probe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Probe")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &format_args!("{:#x}", self.len))
            .field("task", &self.task)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl Probe {
    /// Create a probe for `[addr, addr + len)`.
    pub fn new(addr: usize, len: usize) -> Result<Self> {
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            addr,
            len,
            task: None,
            handler: None,
        })
    }

    /// Attach callbacks.
    pub fn with_handler(mut self, handler: Arc<dyn ProbeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Scope the probe to a task's address space.
    pub fn with_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// One past the last traced byte.
    pub fn end(&self) -> usize {
        self.addr + self.len
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn handler(&self) -> Option<&Arc<dyn ProbeHandler>> {
        self.handler.as_ref()
    }

    /// Whether `addr` falls inside the probe.
    pub fn contains(&self, addr: usize) -> bool {
        self.addr <= addr && addr < self.end()
    }

    /// Whether the probe shares at least one byte with `[addr, end)`.
    pub fn overlaps(&self, addr: usize, end: usize) -> bool {
        self.addr < end && addr < self.end()
    }
}

/// Immutable snapshot of the registered probes, sorted by start address.
///
/// Registered probes never overlap, so at most one contains a given address.
#[derive(Debug, Default)]
pub struct ProbeList {
    probes: Vec<Arc<Probe>>,
}

impl ProbeList {
    pub fn new(mut probes: Vec<Arc<Probe>>) -> Self {
        probes.sort_by_key(|p| p.addr());
        Self { probes }
    }

    /// Probe containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&Arc<Probe>> {
        let idx = self.probes.partition_point(|p| p.addr() <= addr);
        let probe = self.probes.get(idx.checked_sub(1)?)?;
        probe.contains(addr).then_some(probe)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Probe>> {
        self.probes.iter()
    }
}
