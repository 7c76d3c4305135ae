//! Handshake statistics.
//!
//! Counters are bumped on the trap path with relaxed atomics and read as a
//! [`StatsSnapshot`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters for one tracer.
#[derive(Debug)]
pub struct TracerStats {
    /// Faults serviced by a handshake.
    hits: AtomicU64,
    /// Handled faults outside every probe range.
    misses: AtomicU64,
    /// Faults on the page already being stepped.
    secondary_hits: AtomicU64,
    /// Faults on another fault page while stepping.
    recursive_faults: AtomicU64,
    /// Step completions with no handshake in flight.
    unexpected_steps: AtomicU64,
    /// Time spent between fault and step completion.
    stepping_ns: AtomicU64,
}

impl Default for TracerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TracerStats {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            secondary_hits: AtomicU64::new(0),
            recursive_faults: AtomicU64::new(0),
            unexpected_steps: AtomicU64::new(0),
            stepping_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_secondary_hit(&self) {
        self.secondary_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recursive_fault(&self) {
        self.recursive_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unexpected_step(&self) {
        self.unexpected_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stepping_time(&self, ns: u64) {
        self.stepping_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stepping_ns(&self) -> u64 {
        self.stepping_ns.load(Ordering::Relaxed)
    }

    pub fn reset_stepping_time(&self) {
        self.stepping_ns.store(0, Ordering::Relaxed);
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            secondary_hits: self.secondary_hits.load(Ordering::Relaxed),
            recursive_faults: self.recursive_faults.load(Ordering::Relaxed),
            unexpected_steps: self.unexpected_steps.load(Ordering::Relaxed),
            stepping_ns: self.stepping_ns.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.secondary_hits.store(0, Ordering::Relaxed);
        self.recursive_faults.store(0, Ordering::Relaxed);
        self.unexpected_steps.store(0, Ordering::Relaxed);
        self.stepping_ns.store(0, Ordering::Relaxed);
    }
}

/// Immutable snapshot of tracer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub secondary_hits: u64,
    pub recursive_faults: u64,
    pub unexpected_steps: u64,
    pub stepping_ns: u64,
}
