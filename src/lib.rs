//! kmmio: MMIO access tracing by page-fault interception
//!
//! Accesses to a traced address range are caught by making the pages behind
//! it not present. The resulting access fault runs the probe's pre callback,
//! restores the page and single-steps the faulting instruction; the step
//! completion runs the post callback and makes the page not present again.
//!
//! # Modules
//!
//! - [`page_table`] - translation lookup consumed by the tracer, plus an
//!   x86_64 walker
//! - [`fault_page`] - refcounted records of protected pages
//! - [`arm`] - revoke / restore access to a fault page
//! - `registry` - probe registration and removal ([`Tracer::register`])
//! - [`handler`] - the fault / single-step handshake
//! - [`soft_mmu`] - in-memory page tables for running in user space
//!
//! # Quick Start
//!
//! ```ignore
//! use alloc::sync::Arc;
//! use kmmio::{Config, Probe, Tracer};
//!
//! let tracer = Tracer::new(unsafe { kmmio::HwPageTable::new(PHYS_OFFSET) }, Config::default())?;
//! let probe = Arc::new(Probe::new(mmio_base, 0x1000)?.with_handler(Arc::new(MyHandler)));
//! tracer.register(probe.clone())?;
//!
//! // page fault handler, on unit `cpu`:
//! if tracer.on_access_fault(&mut ctx[cpu], &mut regs.rflags, cr2, error_code) == FaultOutcome::Handled {
//!     return;
//! }
//!
//! // debug trap handler:
//! if tracer.notify_debug(&mut ctx[cpu], &mut regs.rflags, &mut dr6) {
//!     return;
//! }
//!
//! tracer.unregister(&probe, false)?;
//! tracer.synchronize();
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Core
// =============================================================================

pub mod config;
pub mod error;
pub mod page_table;
pub mod soft_mmu;

pub mod arm;
pub mod epoch;
pub mod fault_page;

pub mod context;
pub mod probe;
pub mod stats;

mod reclaim;
mod registry;
pub mod tracer;

pub mod handler;

// Re-export key types for convenience
pub use config::Config;
pub use context::UnitContext;
pub use error::{Error, Result};
pub use handler::{DR6_BS, FaultOutcome, IF, StepOutcome, TF};
pub use page_table::{EntryHandle, PageLevel, PageTableOps, TaskId, Translation};
pub use probe::{Probe, ProbeHandler};
pub use stats::StatsSnapshot;
pub use tracer::{FaultPageInfo, Tracer};

#[cfg(target_arch = "x86_64")]
pub use page_table::HwPageTable;

/// Log the crate's build configuration.
pub fn init() {
    info!("Initializing kmmio...");
    #[cfg(feature = "axhal")]
    info!("  - axhal monotonic clock");
    #[cfg(not(feature = "axhal"))]
    info!("  - mock clock (no axhal)");
    info!("kmmio initialization complete");
}
