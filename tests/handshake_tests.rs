//! Integration tests for the fault / single-step handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use kmmio::page_table::pte_bits::{HUGE, PRESENT, PROTNONE, RW};
use kmmio::soft_mmu::{PF_WRITE, SoftMmu};
use kmmio::{
    Config, DR6_BS, FaultOutcome, IF, PageLevel, Probe, ProbeHandler, StepOutcome, TF, Tracer,
};

const MMIO_BASE: usize = 0xfee0_0000;
/// Flags of the interrupted context: IF set plus the always-one bit.
const USER_FLAGS: u64 = IF | 0x2;

#[derive(Default)]
struct Recorder {
    pre: AtomicUsize,
    post: AtomicUsize,
    last_addr: AtomicUsize,
    last_code: AtomicU64,
    last_condition: AtomicU64,
}

impl ProbeHandler for Recorder {
    fn pre_handler(&self, _probe: &Probe, addr: usize, error_code: u64) {
        self.pre.fetch_add(1, Ordering::SeqCst);
        self.last_addr.store(addr, Ordering::SeqCst);
        self.last_code.store(error_code, Ordering::SeqCst);
    }

    fn post_handler(&self, _probe: &Probe, condition: u64) {
        self.post.fetch_add(1, Ordering::SeqCst);
        self.last_condition.store(condition, Ordering::SeqCst);
    }
}

fn entry_for(addr: usize) -> u64 {
    0x8_0000_0000 | (addr as u64 & 0xffff_f000) | PRESENT | RW
}

fn setup(pages: usize) -> Tracer<SoftMmu> {
    let mmu = SoftMmu::new();
    for i in 0..pages {
        let addr = MMIO_BASE + i * 0x1000;
        mmu.map(addr, PageLevel::Size4K, entry_for(addr));
    }
    Tracer::new(mmu, Config::new().with_max_units(4).with_max_fault_pages(16)).unwrap()
}

fn traced(tracer: &Tracer<SoftMmu>, addr: usize, len: usize) -> (Arc<Probe>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let probe = Arc::new(Probe::new(addr, len).unwrap().with_handler(recorder.clone()));
    tracer.register(probe.clone()).unwrap();
    (probe, recorder)
}

// =============================================================================
// Sequential handshake
// =============================================================================

#[test]
fn test_sequential_handshake() {
    let tracer = setup(1);
    let (_probe, rec) = traced(&tracer, MMIO_BASE + 0x30, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();

    let addr = MMIO_BASE + 0x34;
    let code = tracer.mmu().access(addr, true).unwrap_err();
    assert_eq!(code, PF_WRITE);

    let mut flags = USER_FLAGS;
    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, addr, code),
        FaultOutcome::Handled
    );
    assert_eq!(rec.pre.load(Ordering::SeqCst), 1);
    assert_eq!(rec.last_addr.load(Ordering::SeqCst), addr);
    assert_eq!(rec.last_code.load(Ordering::SeqCst), PF_WRITE);
    assert!(ctx.is_active());
    assert!(ctx.is_pinned());
    assert_eq!(ctx.page_addr(), MMIO_BASE);
    assert_eq!(ctx.probe().map(|p| p.addr()), Some(MMIO_BASE + 0x30));
    assert_eq!(flags & TF, TF);
    assert_eq!(flags & IF, 0);

    // The instruction can now complete.
    assert!(tracer.mmu().access(addr, true).is_ok());
    assert!(!tracer.fault_page(MMIO_BASE).unwrap().armed);

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::Handled
    );
    assert_eq!(rec.post.load(Ordering::SeqCst), 1);
    assert_eq!(rec.last_condition.load(Ordering::SeqCst), DR6_BS);
    assert_eq!(flags, USER_FLAGS);
    assert!(!ctx.is_active());
    assert!(!ctx.is_pinned());
    assert!(tracer.mmu().access(addr, false).is_err());
    assert!(tracer.fault_page(MMIO_BASE).unwrap().armed);

    let stats = tracer.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    tracer.release_unit(ctx);
}

fn huge_setup(base: usize, level: PageLevel, entry: u64) -> Tracer<SoftMmu> {
    let mmu = SoftMmu::new();
    mmu.map(base, level, entry);
    Tracer::new(mmu, Config::new().with_max_units(2).with_max_fault_pages(4)).unwrap()
}

#[test]
fn test_handshake_on_2m_page() {
    let base = 0x4000_0000;
    let orig = 0x1_0000_0000 | PRESENT | RW | HUGE | PROTNONE;
    let tracer = huge_setup(base, PageLevel::Size2M, orig);
    let (_probe, rec) = traced(&tracer, 0x4012_3000, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();

    let addr = 0x4012_3004;
    let code = tracer.mmu().access(addr, false).unwrap_err();
    let mut flags = USER_FLAGS;
    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, addr, code),
        FaultOutcome::Handled
    );
    // The whole superpage is one fault page.
    assert_eq!(ctx.page_addr(), base);
    assert_eq!(rec.pre.load(Ordering::SeqCst), 1);
    assert_eq!(tracer.mmu().entry_at(addr), Some(orig));
    assert!(tracer.mmu().access(addr, false).is_ok());

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::Handled
    );
    assert_eq!(flags, USER_FLAGS);
    assert_eq!(tracer.mmu().entry_at(addr), Some(orig & !(PRESENT | PROTNONE)));
    assert_eq!(rec.post.load(Ordering::SeqCst), 1);
    assert_eq!(tracer.fault_page(base).unwrap().old_presence, orig);
}

#[test]
fn test_handshake_on_1g_page() {
    let base = 0x80_0000_0000;
    let orig = 0x40_0000_0000 | PRESENT | RW | HUGE;
    let tracer = huge_setup(base, PageLevel::Size1G, orig);
    let (probe, rec) = traced(&tracer, base + 0x1234_5000, 0x100);
    let mut ctx = tracer.unit_context(0).unwrap();

    // Faults on different 4K frames of the same 1G page.
    for offset in [0x1234_5000, 0x1234_50f8] {
        let addr = base + offset;
        let mut flags = USER_FLAGS;
        assert_eq!(
            tracer.on_access_fault(&mut ctx, &mut flags, addr, 0),
            FaultOutcome::Handled
        );
        assert_eq!(ctx.page_addr(), base);
        assert_eq!(tracer.mmu().entry_at(addr), Some(orig));
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS);
        assert_eq!(tracer.mmu().entry_at(addr), Some(orig & !PRESENT));
    }
    assert_eq!(rec.post.load(Ordering::SeqCst), 2);

    tracer.unregister(&probe, false).unwrap();
    assert_eq!(tracer.mmu().entry_at(base), Some(orig));
}

#[test]
fn test_untraced_fault_is_unhandled() {
    let tracer = setup(2);
    let (_probe, rec) = traced(&tracer, MMIO_BASE, 0x10);
    let mut ctx = tracer.unit_context(1).unwrap();
    let mut flags = USER_FLAGS;

    // Mapped but not traced.
    let outcome = tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE + 0x1000, 0);
    assert_eq!(outcome, FaultOutcome::Unhandled);
    // Not mapped at all.
    let outcome = tracer.on_access_fault(&mut ctx, &mut flags, 0x1234_5000, 0);
    assert_eq!(outcome, FaultOutcome::Unhandled);

    assert_eq!(flags, USER_FLAGS);
    assert!(!ctx.is_active());
    assert!(!ctx.is_pinned());
    assert_eq!(rec.pre.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fault_outside_probe_counts_miss() {
    let tracer = setup(1);
    let (_probe, rec) = traced(&tracer, MMIO_BASE + 0x100, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();
    let mut flags = USER_FLAGS;

    // Same page, outside the probe range.
    let outcome = tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE + 0x800, 0);
    assert_eq!(outcome, FaultOutcome::Handled);
    assert!(ctx.probe().is_none());
    assert_eq!(tracer.miss_count(), 1);

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::Handled
    );
    assert_eq!(rec.pre.load(Ordering::SeqCst), 0);
    assert_eq!(rec.post.load(Ordering::SeqCst), 0);
    assert!(tracer.fault_page(MMIO_BASE).unwrap().armed);
}

// =============================================================================
// Protocol violations
// =============================================================================

#[test]
fn test_recursive_fault_disarms_second_page() {
    let tracer = setup(2);
    let (_a, rec_a) = traced(&tracer, MMIO_BASE, 0x10);
    let (_b, rec_b) = traced(&tracer, MMIO_BASE + 0x1000, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();
    let mut flags = USER_FLAGS;

    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE, 0),
        FaultOutcome::Handled
    );
    let stepping_flags = flags;

    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE + 0x1000, 0),
        FaultOutcome::Unhandled
    );
    // The first episode is untouched.
    assert_eq!(flags, stepping_flags);
    assert_eq!(ctx.page_addr(), MMIO_BASE);
    assert!(ctx.is_pinned());
    assert_eq!(rec_b.pre.load(Ordering::SeqCst), 0);
    assert_eq!(tracer.stats().recursive_faults, 1);

    // The second page is let through.
    assert!(!tracer.fault_page(MMIO_BASE + 0x1000).unwrap().armed);
    assert_eq!(
        tracer.mmu().entry_at(MMIO_BASE + 0x1000),
        Some(entry_for(MMIO_BASE + 0x1000))
    );

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::Handled
    );
    assert_eq!(rec_a.post.load(Ordering::SeqCst), 1);
    assert!(tracer.fault_page(MMIO_BASE).unwrap().armed);
    assert!(!ctx.is_pinned());
}

#[test]
fn test_secondary_hit_is_unhandled() {
    let tracer = setup(1);
    let (_probe, rec) = traced(&tracer, MMIO_BASE, 0x100);
    let mut ctx = tracer.unit_context(0).unwrap();
    let mut flags = USER_FLAGS;

    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE + 0x8, 0),
        FaultOutcome::Handled
    );
    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE + 0x10, 0),
        FaultOutcome::Unhandled
    );
    assert_eq!(tracer.stats().secondary_hits, 1);
    assert_eq!(rec.pre.load(Ordering::SeqCst), 1);
    assert!(ctx.is_active());
    assert!(ctx.is_pinned());

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::Handled
    );
    assert!(!ctx.is_pinned());
}

#[test]
fn test_step_without_fault_is_not_ours() {
    let tracer = setup(1);
    let (_probe, rec) = traced(&tracer, MMIO_BASE, 0x10);
    let mut ctx = tracer.unit_context(2).unwrap();
    let mut flags = USER_FLAGS | TF;

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::NotOurs
    );
    assert_eq!(flags, USER_FLAGS | TF);
    assert_eq!(rec.post.load(Ordering::SeqCst), 0);
    assert_eq!(tracer.stats().unexpected_steps, 1);
}

#[test]
fn test_foreign_single_step_is_not_exclusive() {
    let tracer = setup(1);
    let (_probe, rec) = traced(&tracer, MMIO_BASE, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();

    // A debugger was already stepping the faulting context.
    let mut flags = USER_FLAGS | TF;
    assert_eq!(
        tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE, 0),
        FaultOutcome::Handled
    );
    assert_eq!(ctx.saved_flags(), TF | IF);

    assert_eq!(
        tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
        StepOutcome::NotExclusive
    );
    assert_eq!(flags, USER_FLAGS | TF);
    assert_eq!(rec.post.load(Ordering::SeqCst), 1);
    assert!(!ctx.is_active());
}

// =============================================================================
// Debug-trap notifier
// =============================================================================

#[test]
fn test_notify_debug_consumes_single_step() {
    let tracer = setup(1);
    let (_probe, _rec) = traced(&tracer, MMIO_BASE, 0x10);
    let mut ctx = tracer.unit_context(0).unwrap();
    let mut flags = USER_FLAGS;

    // Not a single-step trap.
    let mut dr6 = 0x1;
    assert!(!tracer.notify_debug(&mut ctx, &mut flags, &mut dr6));
    assert_eq!(dr6, 0x1);
    assert_eq!(tracer.stats().unexpected_steps, 0);

    // Single-step, but nothing in flight.
    let mut dr6 = DR6_BS;
    assert!(!tracer.notify_debug(&mut ctx, &mut flags, &mut dr6));
    assert_eq!(dr6, DR6_BS);

    tracer.on_access_fault(&mut ctx, &mut flags, MMIO_BASE, 0);
    let mut dr6 = DR6_BS | 0x1;
    assert!(tracer.notify_debug(&mut ctx, &mut flags, &mut dr6));
    assert_eq!(dr6, 0x1);
    assert_eq!(flags, USER_FLAGS);
}

#[test]
fn test_repeated_handshakes_on_one_unit() {
    let tracer = setup(2);
    let (_probe, rec) = traced(&tracer, MMIO_BASE, 0x2000);
    let mut ctx = tracer.unit_context(3).unwrap();

    for i in 0..10 {
        let addr = MMIO_BASE + (i % 2) * 0x1000 + i * 8;
        let code = tracer.mmu().access(addr, false).unwrap_err();
        let mut flags = USER_FLAGS;
        assert_eq!(
            tracer.on_access_fault(&mut ctx, &mut flags, addr, code),
            FaultOutcome::Handled
        );
        assert!(tracer.mmu().access(addr, false).is_ok());
        assert_eq!(
            tracer.on_step_completed(&mut ctx, &mut flags, DR6_BS),
            StepOutcome::Handled
        );
        assert_eq!(flags, USER_FLAGS);
    }

    assert_eq!(rec.pre.load(Ordering::SeqCst), 10);
    assert_eq!(rec.post.load(Ordering::SeqCst), 10);
    assert_eq!(tracer.stats().hits, 10);
}
