//! Ephemeron semantics: value reachable only through a live key.

mod common;

use common::GcFixture;
use gengc::object::header::HEADER_SIZE;

/// Ephemeron array class: payload is (key, value) pairs, deliberately
/// invisible to the strong reference bitmap — the collector reaches the
/// pairs only through the ephemeron passes.
fn ephemeron_class(pairs: usize) -> usize {
    common::make_class(common::ClassInfo {
        size: HEADER_SIZE + pairs * 2 * common::WORD,
        ref_bits: 0,
        elem_size: 0,
        pairs,
        critical: false,
        finalizer: None,
    })
}

fn pair_slot(array: usize, index: usize) -> (usize, usize) {
    let base = array + HEADER_SIZE + index * 2 * common::WORD;
    (base, base + common::WORD)
}

/// Two pairs, one key kept alive, one dropped. After a major collection
/// the live key's value is still reachable through the array and the dead
/// pair reads (tombstone, null).
#[test]
fn test_ephemeron_live_and_dead_keys() {
    let fixture = GcFixture::with_defaults();
    let leaf = common::data_class(16, &[]);
    let eph = ephemeron_class(2);
    let roots = fixture.precise_root(2);

    let array = fixture.alloc(eph);
    let k1 = fixture.alloc(leaf);
    let v1 = fixture.alloc(leaf);
    let k2 = fixture.alloc(leaf);
    let v2 = fixture.alloc(leaf);

    let (k1_slot, v1_slot) = pair_slot(array, 0);
    let (k2_slot, v2_slot) = pair_slot(array, 1);
    unsafe {
        *(k1_slot as *mut usize) = k1;
        *(v1_slot as *mut usize) = v1;
        *(k2_slot as *mut usize) = k2;
        *(v2_slot as *mut usize) = v2;
    }
    fixture.gc.ephemeron_array_add(array);

    roots[0] = array;
    roots[1] = k1; // K2 is dropped.

    fixture.gc.collect(1);

    let new_array = roots[0];
    assert!(!fixture.in_nursery(new_array));
    let (k1_slot, v1_slot) = pair_slot(new_array, 0);
    let (k2_slot, v2_slot) = pair_slot(new_array, 1);
    unsafe {
        // Live pair: key follows the root, value was kept and relocated.
        assert_eq!(*(k1_slot as *const usize), roots[1]);
        let new_v1 = *(v1_slot as *const usize);
        assert_ne!(new_v1, 0);
        assert!(!fixture.in_nursery(new_v1));
        assert_eq!(fixture.vtable_of(new_v1), leaf);

        // Dead pair: tombstone key, null value.
        assert_eq!(*(k2_slot as *const usize), fixture.gc.ephemeron_tombstone());
        assert_eq!(*(v2_slot as *const usize), 0);
    }
}

/// Value chains: pair (K, V) where V is itself the key of another pair.
/// One live root key must keep the whole chain's values alive.
#[test]
fn test_ephemeron_value_chain() {
    let fixture = GcFixture::with_defaults();
    let leaf = common::data_class(16, &[]);
    let eph = ephemeron_class(2);
    let roots = fixture.precise_root(2);

    let array = fixture.alloc(eph);
    let k = fixture.alloc(leaf);
    let middle = fixture.alloc(leaf); // value of pair 0, key of pair 1
    let end = fixture.alloc(leaf);

    let (k0_slot, v0_slot) = pair_slot(array, 0);
    let (k1_slot, v1_slot) = pair_slot(array, 1);
    unsafe {
        *(k0_slot as *mut usize) = k;
        *(v0_slot as *mut usize) = middle;
        *(k1_slot as *mut usize) = middle;
        *(v1_slot as *mut usize) = end;
    }
    fixture.gc.ephemeron_array_add(array);
    roots[0] = array;
    roots[1] = k;

    fixture.gc.collect(1);

    let new_array = roots[0];
    let (_, v0_slot) = pair_slot(new_array, 0);
    let (k1_slot, v1_slot) = pair_slot(new_array, 1);
    unsafe {
        let new_middle = *(v0_slot as *const usize);
        assert_ne!(new_middle, 0);
        // The chained pair's key is the (moved) middle object, so its
        // value must have survived too.
        assert_eq!(*(k1_slot as *const usize), new_middle);
        let new_end = *(v1_slot as *const usize);
        assert_ne!(new_end, 0);
        assert_eq!(fixture.vtable_of(new_end), leaf);
    }
}

/// A dead ephemeron array is dropped from the registry without touching
/// its keys or values.
#[test]
fn test_dead_ephemeron_array() {
    let fixture = GcFixture::with_defaults();
    let leaf = common::data_class(16, &[]);
    let eph = ephemeron_class(1);
    let roots = fixture.precise_root(1);

    let array = fixture.alloc(eph);
    let key = fixture.alloc(leaf);
    let (k_slot, v_slot) = pair_slot(array, 0);
    unsafe {
        *(k_slot as *mut usize) = key;
        *(v_slot as *mut usize) = key;
    }
    fixture.gc.ephemeron_array_add(array);
    roots[0] = key; // the array itself dies

    fixture.gc.collect(1);
    // The key survived through its root; only the array is gone.
    assert!(!fixture.in_nursery(roots[0]));
    assert_eq!(fixture.vtable_of(roots[0]), leaf);
}
