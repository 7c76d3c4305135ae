//! Platform abstraction layer for kernel operations.
//!
//! Provides the monotonic clock used for stepping-time accounting and local
//! interrupt masking for the tracer's spin locks, with a mock implementation
//! so the crate can be tested in user space.

#[cfg(any(test, not(feature = "axhal"), feature = "test-utils"))]
use core::sync::atomic::{AtomicU64, Ordering};

/// Platform operations trait.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Disable local interrupts, returning whether they were enabled.
    fn irq_save() -> bool;

    /// Undo a matching [`irq_save`](Self::irq_save).
    fn irq_restore(was_enabled: bool);

    /// Whether local interrupts are enabled.
    fn irqs_enabled() -> bool;
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn irq_save() -> bool {
        let was_enabled = axhal::asm::irqs_enabled();
        axhal::asm::disable_irqs();
        was_enabled
    }

    fn irq_restore(was_enabled: bool) {
        if was_enabled {
            axhal::asm::enable_irqs();
        }
    }

    fn irqs_enabled() -> bool {
        axhal::asm::irqs_enabled()
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

/// Mock time value for testing.
#[cfg(any(test, not(feature = "axhal"), feature = "test-utils"))]
static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000); // 1 second

/// Mock platform operations for testing.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn irq_save() -> bool {
        mock_irq::save()
    }

    fn irq_restore(_was_enabled: bool) {
        mock_irq::restore();
    }

    fn irqs_enabled() -> bool {
        mock_irq::depth() == 0
    }
}


#[cfg(all(not(test), not(feature = "axhal")))]
mod mock_irq {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DEPTH: AtomicUsize = AtomicUsize::new(0);

    pub fn save() -> bool {
        DEPTH.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub fn restore() {
        DEPTH.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn depth() -> usize {
        DEPTH.load(Ordering::Acquire)
    }
}

/// Set mock time for testing.
#[cfg(any(test, feature = "test-utils"))]
pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Advance mock time by given nanoseconds.
#[cfg(any(test, feature = "test-utils"))]
pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Whether local interrupts are enabled on the calling unit.
#[inline]
pub fn irqs_enabled() -> bool {
    Platform::irqs_enabled()
}

// =============================================================================
// Interrupt Guard
// =============================================================================

/// Keeps local interrupts disabled until dropped.
///
/// Every spin lock the trap handlers also take is held under one of these, so
/// an interrupt that touches a traced page cannot spin on a lock owned by the
/// code it interrupted.
#[must_use]
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            was_enabled: Platform::irq_save(),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        Platform::irq_restore(self.was_enabled);
    }
}
