//! Degraded mode: when pinning eats the whole nursery, mutators are
//! served from the old generation until a major collection frees it up.

mod common;

use common::GcFixture;
use std::sync::atomic::Ordering;

#[test]
fn test_degraded_entry_and_exit() {
    let fixture = GcFixture::with_config(|config| {
        // Smallest legal nursery so it is cheap to fill completely.
        config.nursery_size = 64 * 1024;
        config.tlab_size = 8 * 1024;
    });
    let class = common::data_class(64, &[]);
    let conservative = fixture.pinned_root(1400);

    // Fill the nursery, pinning everything as we go. The collection
    // triggered by exhaustion finds no usable gap and degrades.
    for slot in conservative.iter_mut() {
        *slot = fixture.alloc(class);
    }
    assert!(fixture.gc.is_degraded(), "nursery full of pins must degrade");
    assert!(fixture.gc.collection_count(0) >= 1);

    // Degraded allocations land in the old generation.
    let degraded_obj = fixture.alloc(class);
    assert!(!fixture.in_nursery(degraded_obj));
    assert!(
        fixture
            .gc
            .stats()
            .objects_alloced_degraded
            .load(Ordering::Relaxed)
            > 0
    );

    // Release the pins; the next major collection rebuilds the nursery
    // and leaves degraded mode.
    for slot in conservative.iter_mut() {
        *slot = 0;
    }
    fixture.gc.collect(1);
    assert!(!fixture.gc.is_degraded());

    let young_again = fixture.alloc(class);
    assert!(fixture.in_nursery(young_again));
}
