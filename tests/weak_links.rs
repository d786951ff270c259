//! Disappearing links: clearing, address updates, resurrection tracking.

mod common;

use common::GcFixture;
use std::sync::atomic::{AtomicUsize, Ordering};

fn leaked_cell() -> usize {
    Box::leak(Box::new(0usize)) as *mut usize as usize
}

/// A non-tracking link to a dead object reads null after the collection.
#[test]
fn test_link_cleared_when_target_dies() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(16, &[]);
    let cell = leaked_cell();

    let obj = fixture.alloc(class);
    fixture.gc.weak_link_add(cell, obj, false);
    assert_eq!(fixture.gc.weak_link_get(cell), obj);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.weak_link_get(cell), 0);
}

/// A link to a surviving object follows it to its new address.
#[test]
fn test_link_follows_promotion() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(16, &[]);
    let roots = fixture.precise_root(1);
    let cell = leaked_cell();

    let obj = fixture.alloc(class);
    roots[0] = obj;
    fixture.gc.weak_link_add(cell, obj, false);

    fixture.gc.collect(0);
    let promoted = roots[0];
    assert_ne!(promoted, obj);
    assert_eq!(fixture.gc.weak_link_get(cell), promoted);
}

/// The stored word is bit-inverted: a conservative scan of the cell must
/// not keep the target alive.
#[test]
fn test_hidden_pointer_defeats_conservative_scan() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(16, &[]);
    let cell = leaked_cell();

    let obj = fixture.alloc(class);
    fixture.gc.weak_link_add(cell, obj, false);
    // Register the cell itself as a conservative root. If the pointer
    // were stored plainly this would pin the target.
    fixture.gc.register_root(cell, common::WORD, None);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.weak_link_get(cell), 0);
    assert_eq!(fixture.gc.count_nursery_objects(), 0);
    fixture.gc.deregister_root(cell);
}

/// A tracking link survives finalizer resurrection; a non-tracking link
/// to the same object clears in the same collection.
#[test]
fn test_tracking_link_sees_resurrection() {
    static RES_SLOT: AtomicUsize = AtomicUsize::new(0);
    fn resurrect(obj: usize) {
        RES_SLOT.store(obj, Ordering::SeqCst);
    }

    let fixture = GcFixture::with_defaults();
    let class = common::make_class(common::ClassInfo {
        size: 16,
        ref_bits: 0,
        elem_size: 0,
        pairs: 0,
        critical: false,
        finalizer: Some(resurrect),
    });
    let tracked = leaked_cell();
    let untracked = leaked_cell();

    let obj = fixture.alloc(class);
    fixture.gc.register_finalizer(obj);
    fixture.gc.weak_link_add(tracked, obj, true);
    fixture.gc.weak_link_add(untracked, obj, false);

    fixture.gc.collect(0);

    // The non-tracking link cleared before finalization could interfere.
    assert_eq!(fixture.gc.weak_link_get(untracked), 0);
    // The tracking link followed the object into the fin-ready state.
    let tracked_value = fixture.gc.weak_link_get(tracked);
    assert_ne!(tracked_value, 0);
    assert!(!fixture.in_nursery(tracked_value));

    assert_eq!(fixture.gc.run_finalizers(), 1);
    assert_eq!(RES_SLOT.load(Ordering::SeqCst), tracked_value);
}

/// Removing a link nulls the cell and forgets the registration.
#[test]
fn test_link_remove() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(16, &[]);
    let roots = fixture.precise_root(1);
    let cell = leaked_cell();

    let obj = fixture.alloc(class);
    roots[0] = obj;
    fixture.gc.weak_link_add(cell, obj, false);
    fixture.gc.weak_link_remove(cell);
    assert_eq!(fixture.gc.weak_link_get(cell), 0);

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.weak_link_get(cell), 0);
    assert!(!fixture.in_nursery(roots[0]));
}
