//! Minor collection behavior: promotion, forwarding, fragment rebuild.

mod common;

use common::GcFixture;

/// Allocate 100 000 small objects, keep every 100th in a precise root and
/// collect. Exactly the rooted 1 000 survive, their old addresses are gone
/// from the nursery, and the nursery collapses back to a single fragment
/// spanning its whole extent.
#[test]
fn test_minor_promotion_survivor_count() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(16, &[]);
    let roots = fixture.precise_root(1000);

    let mut old_addresses = Vec::with_capacity(1000);
    for i in 0..100_000usize {
        let obj = fixture.alloc(class);
        if i % 100 == 0 {
            roots[i / 100] = obj;
            old_addresses.push(obj);
        }
    }
    assert_eq!(fixture.gc.count_major_objects(), 0);

    fixture.gc.collect(0);

    // Exactly 1000 survivors, all promoted out of the nursery.
    assert_eq!(fixture.gc.count_major_objects(), 1000);
    assert_eq!(fixture.gc.count_nursery_objects(), 0);
    for (i, &old) in old_addresses.iter().enumerate() {
        let new = roots[i];
        assert_ne!(new, 0, "root {} was cleared", i);
        assert_ne!(new, old, "survivor {} did not move", i);
        assert!(!fixture.in_nursery(new), "survivor {} still young", i);
        assert_eq!(fixture.vtable_of(new), class, "survivor {} corrupted", i);
    }

    // One fragment covering the whole nursery.
    assert_eq!(fixture.gc.nursery_fragment_count(), 1);
    let (_, bits) = fixture.gc.nursery_base_and_bits();
    assert_eq!(fixture.gc.nursery_max_available(), 1usize << bits);

    assert_eq!(fixture.gc.collection_count(0), 1);
}

/// Promoted objects drag their reference graph along, and every slot is
/// rewritten to the new location (no forwarded pointer survives the
/// collection).
#[test]
fn test_minor_promotion_rewrites_references() {
    let fixture = GcFixture::with_defaults();
    let node = common::data_class(24, &[0]);
    let roots = fixture.precise_root(1);

    // A three-node chain rooted at the head.
    let a = fixture.alloc(node);
    let b = fixture.alloc(node);
    let c = fixture.alloc(node);
    fixture.store_ref(a, 0, b);
    fixture.store_ref(b, 0, c);
    roots[0] = a;

    fixture.gc.collect(0);

    let new_a = roots[0];
    assert!(!fixture.in_nursery(new_a));
    let new_b = fixture.read_ref(new_a, 0);
    assert!(!fixture.in_nursery(new_b));
    let new_c = fixture.read_ref(new_b, 0);
    assert!(!fixture.in_nursery(new_c));
    assert_eq!(fixture.read_ref(new_c, 0), 0);
    assert_eq!(fixture.gc.count_major_objects(), 3);

    fixture.gc.check_consistency();
}

/// Unreachable objects never show up in the old generation.
#[test]
fn test_minor_garbage_not_promoted() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(64, &[]);
    for _ in 0..1000 {
        fixture.alloc(class);
    }
    fixture.gc.collect(0);
    assert_eq!(fixture.gc.count_major_objects(), 0);
    assert_eq!(fixture.gc.count_nursery_objects(), 0);
}

/// The nursery walk and scan-start table stay consistent through
/// allocation and collection.
#[test]
fn test_scan_start_table_consistency() {
    let fixture = GcFixture::with_defaults();
    let small = common::data_class(16, &[]);
    let medium = common::data_class(120, &[]);
    let big = common::data_class(1024, &[]);
    let roots = fixture.precise_root(30);

    for i in 0..3000usize {
        let class = match i % 3 {
            0 => small,
            1 => medium,
            _ => big,
        };
        let obj = fixture.alloc(class);
        if i % 100 == 0 {
            roots[i / 100] = obj;
        }
    }
    fixture.gc.verify_nursery();
    fixture.gc.collect(0);
    fixture.gc.verify_nursery();
    fixture.gc.check_consistency();
}

/// Allocation continues normally after a collection; new objects land in
/// the rebuilt fragments.
#[test]
fn test_allocation_after_collection() {
    let fixture = GcFixture::with_defaults();
    let class = common::data_class(32, &[]);
    for _ in 0..100 {
        fixture.alloc(class);
    }
    fixture.gc.collect(0);

    let obj = fixture.alloc(class);
    assert!(fixture.in_nursery(obj));
    // Allocated memory is zeroed apart from the vtable word.
    for word in 1..4 {
        assert_eq!(
            unsafe { *((obj + word * common::WORD) as *const usize) },
            0,
            "payload word {} not zeroed",
            word
        );
    }
}
