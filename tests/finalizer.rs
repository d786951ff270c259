//! Finalization: readiness, once-only invocation, resurrection.

mod common;

use common::GcFixture;
use std::sync::atomic::{AtomicUsize, Ordering};

static ONCE_RUNS: AtomicUsize = AtomicUsize::new(0);
static CANCEL_RUNS: AtomicUsize = AtomicUsize::new(0);
static FOLLOW_RUNS: AtomicUsize = AtomicUsize::new(0);
static RESURRECT_RUNS: AtomicUsize = AtomicUsize::new(0);
static RESURRECT_SLOT: AtomicUsize = AtomicUsize::new(0);
static ORDER_LOG: AtomicUsize = AtomicUsize::new(0);

fn once_finalizer(_obj: usize) {
    ONCE_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn cancel_finalizer(_obj: usize) {
    CANCEL_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn follow_finalizer(_obj: usize) {
    FOLLOW_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn resurrecting_finalizer(obj: usize) {
    RESURRECT_RUNS.fetch_add(1, Ordering::SeqCst);
    RESURRECT_SLOT.store(obj, Ordering::SeqCst);
}

fn ordinary_order_finalizer(_obj: usize) {
    // Records that an ordinary finalizer ran while no critical one had.
    ORDER_LOG.fetch_add(1, Ordering::SeqCst);
}

fn critical_order_finalizer(_obj: usize) {
    // Critical finalizers run after all ordinary ones: encode by shifting.
    ORDER_LOG.fetch_add(100 + ORDER_LOG.load(Ordering::SeqCst), Ordering::SeqCst);
}

fn finalizable_class(finalizer: fn(usize), critical: bool) -> usize {
    common::make_class(common::ClassInfo {
        size: 32,
        ref_bits: 0,
        elem_size: 0,
        pairs: 0,
        critical,
        finalizer: Some(finalizer),
    })
}

/// An unreachable registered object becomes fin-ready in the collection
/// that finds it dead, survives that collection, and its finalizer runs
/// exactly once.
#[test]
fn test_finalizer_runs_once() {
    let fixture = GcFixture::with_defaults();
    let class = finalizable_class(once_finalizer, false);

    let obj = fixture.alloc(class);
    fixture.gc.register_finalizer(obj);

    fixture.gc.collect(0);
    assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 0, "ran during STW");
    assert_eq!(fixture.gc.run_finalizers(), 1);
    assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);

    // Nothing left to finalize.
    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 0);
    assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);
}

/// Resurrection: the finalizer stores `self` into a live root. The object
/// survives subsequent collections and the finalizer never runs again.
#[test]
fn test_finalizer_resurrection() {
    let fixture = GcFixture::with_defaults();
    let class = finalizable_class(resurrecting_finalizer, false);

    // The resurrection slot is a registered root.
    let slot_addr = &RESURRECT_SLOT as *const AtomicUsize as usize;
    fixture.gc.register_root(
        slot_addr,
        common::WORD,
        Some(gengc::Descriptor::bitmap_from_slots(&[0])),
    );

    let obj = fixture.alloc(class);
    fixture.gc.register_finalizer(obj);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 1);
    assert_eq!(RESURRECT_RUNS.load(Ordering::SeqCst), 1);
    let resurrected = RESURRECT_SLOT.load(Ordering::SeqCst);
    assert_ne!(resurrected, 0);

    // Second cycle: the object is rooted now; no further finalization.
    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 0);
    assert_eq!(RESURRECT_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.vtable_of(RESURRECT_SLOT.load(Ordering::SeqCst)), class);

    fixture.gc.deregister_root(slot_addr);
}

/// A reachable registered object is not finalized; unregistering cancels
/// the finalizer for good.
#[test]
fn test_unregister_cancels() {
    let fixture = GcFixture::with_defaults();
    let class = finalizable_class(cancel_finalizer, false);
    let roots = fixture.precise_root(1);

    let kept = fixture.alloc(class);
    roots[0] = kept;
    fixture.gc.register_finalizer(kept);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 0, "live object was finalized");

    // Drop the root but cancel the registration first.
    fixture.gc.unregister_finalizer(roots[0]);
    roots[0] = 0;
    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 0);
    assert_eq!(CANCEL_RUNS.load(Ordering::SeqCst), 0);
}

/// Ordinary finalizers drain before critical ones.
#[test]
fn test_critical_runs_after_ordinary() {
    let fixture = GcFixture::with_defaults();
    let ordinary = finalizable_class(ordinary_order_finalizer, false);
    let critical = finalizable_class(critical_order_finalizer, true);

    let a = fixture.alloc(critical);
    let b = fixture.alloc(ordinary);
    fixture.gc.register_finalizer(a);
    fixture.gc.register_finalizer(b);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.run_finalizers(), 2);
    // Ordinary bumped the log to 1, then critical added 100 + 1.
    assert_eq!(ORDER_LOG.load(Ordering::SeqCst), 102);
}

/// The finalizable registration follows the object when it moves.
#[test]
fn test_registration_follows_promotion() {
    let fixture = GcFixture::with_defaults();
    let class = finalizable_class(follow_finalizer, false);
    let roots = fixture.precise_root(1);

    let obj = fixture.alloc(class);
    roots[0] = obj;
    fixture.gc.register_finalizer(obj);

    // Two collections with the object alive: registration must survive
    // the move without firing.
    fixture.gc.collect(0);
    fixture.gc.collect(1);
    assert_eq!(fixture.gc.run_finalizers(), 0);
    assert_eq!(FOLLOW_RUNS.load(Ordering::SeqCst), 0);

    roots[0] = 0;
    fixture.gc.collect(1);
    assert_eq!(fixture.gc.run_finalizers(), 1);
    assert_eq!(FOLLOW_RUNS.load(Ordering::SeqCst), 1);
}
