//! Conservative pinning: interior pointers, fragment splitting.

mod common;

use common::GcFixture;

/// Interior pointers recorded in a conservative root pin their objects:
/// the objects keep their addresses, stay in the nursery, and the fragment
/// list splits around them.
#[test]
fn test_interior_pointers_pin_objects() {
    let fixture = GcFixture::with_defaults();
    let pinned_class = common::data_class(64, &[]);
    let garbage_class = common::data_class(1024, &[]);
    let conservative = fixture.pinned_root(10);

    let mut pinned_addrs = Vec::new();
    for i in 0..10 {
        let obj = fixture.alloc(pinned_class);
        // Interior pointer, halfway into the object.
        conservative[i] = obj + 32;
        pinned_addrs.push(obj);
        if i < 9 {
            // Dead spacer so the surviving objects are non-contiguous.
            fixture.alloc(garbage_class);
        }
    }

    fixture.gc.collect(0);

    // All ten survived in place.
    assert_eq!(fixture.gc.count_nursery_objects(), 10);
    assert_eq!(fixture.gc.count_major_objects(), 0);
    for (i, &obj) in pinned_addrs.iter().enumerate() {
        assert!(fixture.in_nursery(obj), "object {} left the nursery", i);
        assert_eq!(fixture.vtable_of(obj), pinned_class, "object {} moved", i);
        // The pin tag is per-collection and was cleared at rebuild.
        assert!(!unsafe { gengc::object::is_pinned(obj) });
        assert!(!unsafe { gengc::object::is_forwarded(obj) });
    }

    // Nine gaps between the survivors plus the tail.
    assert_eq!(fixture.gc.nursery_fragment_count(), 10);
    fixture.gc.verify_nursery();
    fixture.gc.check_consistency();
}

/// Multiple conservative words into the same object collapse to one pin.
#[test]
fn test_interior_pointer_dedup() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(64, &[]);
    let conservative = fixture.pinned_root(4);

    let obj = fixture.alloc(class);
    conservative[0] = obj;
    conservative[1] = obj + 8;
    conservative[2] = obj + 56;
    conservative[3] = obj + 32;

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.count_nursery_objects(), 1);
    assert!(fixture.in_nursery(obj));
}

/// Words that do not land in an object (stale addresses into reclaimed
/// space) pin nothing.
#[test]
fn test_non_object_words_rejected() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(64, &[]);
    let conservative = fixture.pinned_root(2);

    let obj = fixture.alloc(class);
    let (base, bits) = fixture.gc.nursery_base_and_bits();
    // An address far past the allocation frontier: zeroed nursery memory.
    conservative[0] = base + (1usize << bits) - 256;
    // Dead object address: no root keeps it, but the conservative word
    // does, so this one DOES pin.
    conservative[1] = obj;

    fixture.gc.collect(0);
    assert_eq!(fixture.gc.count_nursery_objects(), 1);
}

/// Pinned survivors go back to normal once the conservative reference
/// disappears: the next collection moves them out.
#[test]
fn test_pin_is_per_collection() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(64, &[]);
    let conservative = fixture.pinned_root(1);
    let precise = fixture.precise_root(1);

    let obj = fixture.alloc(class);
    conservative[0] = obj;
    precise[0] = obj;

    fixture.gc.collect(0);
    assert!(fixture.in_nursery(precise[0]));

    // Drop the conservative reference; the precise root alone promotes.
    conservative[0] = 0;
    fixture.gc.collect(0);
    assert!(!fixture.in_nursery(precise[0]));
    assert_eq!(fixture.gc.count_nursery_objects(), 0);
    assert_eq!(fixture.gc.count_major_objects(), 1);
}
