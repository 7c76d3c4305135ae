//! Tracer configuration.

use crate::error::{Error, Result};

/// Default number of execution units (CPUs) that may raise faults.
pub const DEFAULT_MAX_UNITS: usize = 64;

/// Default number of fault-page slots.
pub const DEFAULT_MAX_FAULT_PAGES: usize = 1024;

/// Sizing parameters for a [`Tracer`](crate::Tracer).
///
/// Both limits are fixed for the lifetime of the tracer: the per-unit epoch
/// slots and the fault-page arena are allocated once in `Tracer::new` so the
/// trap path never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of execution units; unit ids are `0..max_units`.
    pub max_units: usize,
    /// Capacity of the fault-page arena.
    pub max_fault_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Create a configuration with default limits.
    pub const fn new() -> Self {
        Self {
            max_units: DEFAULT_MAX_UNITS,
            max_fault_pages: DEFAULT_MAX_FAULT_PAGES,
        }
    }

    /// Set the number of execution units.
    pub const fn with_max_units(mut self, units: usize) -> Self {
        self.max_units = units;
        self
    }

    /// Set the fault-page arena capacity.
    pub const fn with_max_fault_pages(mut self, pages: usize) -> Self {
        self.max_fault_pages = pages;
        self
    }

    /// Check the limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_units == 0 {
            return Err(Error::InvalidConfig("max_units must be nonzero"));
        }
        if self.max_fault_pages == 0 {
            return Err(Error::InvalidConfig("max_fault_pages must be nonzero"));
        }
        // Slot indices are u32 with u32::MAX reserved as the chain terminator.
        if self.max_fault_pages >= u32::MAX as usize {
            return Err(Error::InvalidConfig("max_fault_pages too large"));
        }
        Ok(())
    }
}
