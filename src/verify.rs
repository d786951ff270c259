//! Heap consistency checking and dumping.
//!
//! The checker is debug tooling (`check-at-minor-collections`,
//! `verify-nursery-at-minor-gc`, `heap-dump=FILE`) and the backing for the
//! crate's own invariant tests. A violation is a collector or runtime-
//! callback bug: the checker logs what it found and aborts.

use crate::collector::Collector;
use crate::object::header::{HEADER_SIZE, MIN_OBJ_SIZE, WORD_SIZE};
use crate::object::{fill_vtable, is_forwarded, safe_object_size, vtable};
use std::io::Write;
use std::sync::atomic::Ordering;

/// Walk the nursery object-by-object from `start` to `bound`, invoking
/// `f(obj, size, is_filler)`. Zeroed gaps are skipped word by word; filler
/// objects are stepped over in one go.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn walk_nursery(
    collector: &Collector,
    bound: usize,
    f: &mut dyn FnMut(usize, usize, bool),
) {
    let cb = collector.callbacks();
    let mut cursor = collector.nursery().start();
    while cursor < bound {
        if (cursor as *const usize).read() == 0 {
            cursor += WORD_SIZE;
            continue;
        }
        let size = safe_object_size(cb, cursor);
        assert!(
            size >= MIN_OBJ_SIZE && cursor + size <= collector.nursery().end(),
            "object {:#x} has impossible size {}",
            cursor,
            size
        );
        f(cursor, size, vtable(cursor) == fill_vtable());
        cursor += size;
    }
    assert!(
        cursor <= collector.nursery().end(),
        "nursery walk overran the section end"
    );
}

/// Walk the whole nursery extent, checking that every byte is accounted
/// for by an object, a filler or a zeroed gap, and that every scan-start
/// entry points at a walkable object start.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn verify_nursery_walk(collector: &Collector) {
    let mut starts = Vec::new();
    walk_nursery(collector, collector.nursery().end(), &mut |obj, _size, _filler| {
        starts.push(obj);
    });
    for (idx, entry) in collector.nursery().scan_starts().iter().enumerate() {
        let entry = entry.load(Ordering::Relaxed);
        if entry == 0 {
            continue;
        }
        assert!(
            starts.binary_search(&entry).is_ok(),
            "scan-start entry {} ({:#x}) is not an object start",
            idx,
            entry
        );
    }
    log::debug!("nursery walk verified: {} object starts", starts.len());
}

/// Check that no reachable reference slot holds a forwarded or
/// out-of-heap pointer.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn check_consistency(collector: &Collector) {
    let cb = *collector.callbacks();
    let mut checked = 0usize;

    let mut check_object = |obj: usize| {
        let descr = (cb.reference_bitmap)(vtable(obj));
        if !descr.has_references() {
            return;
        }
        let size = safe_object_size(&cb, obj);
        let mut slots: Vec<*mut usize> = Vec::new();
        descr.for_each_ref_slot(obj + HEADER_SIZE, obj + size, &mut |slot| slots.push(slot));
        for slot in slots {
            let value = slot.read();
            if value == 0 {
                continue;
            }
            if !collector.bounds().might_contain(value) {
                log::error!(
                    "slot {:#x} of object {:#x} holds non-heap value {:#x}",
                    slot as usize,
                    obj,
                    value
                );
                panic!("heap consistency check failed");
            }
            let addressable = collector.nursery().contains(value)
                || collector.los().contains_object(value)
                || {
                    let (lo, hi) = collector.major().heap_range();
                    value >= lo && value < hi
                };
            if addressable && is_forwarded(value) {
                log::error!(
                    "slot {:#x} of object {:#x} still holds forwarded pointer {:#x}",
                    slot as usize,
                    obj,
                    value
                );
                panic!("heap consistency check failed");
            }
        }
        checked += 1;
    };

    walk_nursery(collector, collector.nursery().end(), &mut |obj, _size, filler| {
        if !filler {
            check_object(obj);
        }
    });
    collector
        .major()
        .iterate_objects(true, true, &cb, &mut |obj, _size| check_object(obj));
    collector.los().iterate(&mut |obj, _size| check_object(obj));

    log::debug!("consistency check passed over {} objects", checked);
}

/// Log every nursery object (the `dump-nursery-at-minor-gc` flag).
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn dump_nursery(collector: &Collector) {
    walk_nursery(collector, collector.nursery().end(), &mut |obj, size, filler| {
        log::debug!(
            "nursery object {:#x}: size {}, vtable {:#x}{}",
            obj,
            size,
            vtable(obj),
            if filler { " (filler)" } else { "" }
        );
    });
}

/// Append a textual heap summary to `path` (the `heap-dump=FILE` flag).
pub(crate) fn heap_dump(collector: &Collector, path: &str, kind: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            writeln!(
                file,
                "[{} collection {}] nursery {}/{} bytes free, major {} bytes in {} sections, los {} bytes in {} objects",
                kind,
                collector.stats().minor_gcs.load(Ordering::Relaxed)
                    + collector.stats().major_gcs.load(Ordering::Relaxed),
                collector.fragments().total_free(),
                collector.nursery().size(),
                collector.major().used_bytes(),
                collector.major().sections_used(),
                collector.los().used_bytes(),
                collector.los().count(),
            )
        });
    if let Err(err) = result {
        log::warn!("heap dump to {} failed: {}", path, err);
    }
}
