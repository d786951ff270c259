//! Write barriers and the remembered-set backend contract.
//!
//! The mutator-facing barriers all reduce to the same filter: a store is
//! interesting only when the written value points into the nursery and the
//! slot itself lives neither in the nursery nor on the storing thread's
//! stack (both are scanned wholesale by the next minor collection). What
//! happens to an interesting slot is the backend's business — a store
//! buffer push or a card mark.
//!
//! Contract for backends: every recorded old→young slot must be delivered
//! to [`RemsetBackend::finish_scan_remsets`] at least once during the next
//! minor collection. Over-delivery is fine; the slot scan is idempotent.

pub mod cards;
pub mod ssb;

use crate::collect::CollectCtx;
use crate::collector::Collector;
use crate::gray::GrayQueue;
use crate::object::header::WORD_SIZE;
use crate::threads::ThreadInfo;

/// Array/value copies touching more than this many slots take the GC lock,
/// closing the race between a long barrier pass and a concurrent minor
/// collection.
pub const LARGE_COPY_SLOTS: usize = 256;

pub trait RemsetBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mutator fast path: remember `slot`. Must be cheap and must not block
    /// (overflow spills are the documented slow path).
    fn record_pointer(&self, info: &ThreadInfo, slot: usize);

    /// Remember `slot` without a thread context (collector-internal use,
    /// e.g. re-remembering ephemeron entries left in the nursery).
    fn record_global(&self, slot: usize);

    /// Sequential preparation before the remset scan job is enqueued.
    fn begin_scan_remsets(&self, collector: &Collector);

    /// Deliver every recorded slot. Runs during stop-the-world.
    fn finish_scan_remsets(&self, collector: &Collector, queue: &mut GrayQueue, ctx: &CollectCtx);

    fn prepare_for_minor_collection(&self, collector: &Collector);
    fn prepare_for_major_collection(&self, collector: &Collector);
    fn finish_minor_collection(&self, collector: &Collector);

    fn register_thread(&self, _info: &ThreadInfo) {}
    fn cleanup_thread(&self, collector: &Collector, info: &ThreadInfo);

    /// For card backends: `(table base, covered lo, covered hi)` so a
    /// managed-code emitter can inline the dirty-byte store.
    fn card_table_info(&self) -> Option<(usize, usize, usize)> {
        None
    }
}

/// Visit one remembered slot during a minor collection: if it holds a
/// nursery pointer, copy the target (rewriting the slot) and remember the
/// slot again if the target stayed young (pinned survivor).
///
/// # Safety
/// Must run during stop-the-world; `slot` must be a live, word-aligned
/// location recorded by a barrier.
pub(crate) unsafe fn scan_remset_slot(
    collector: &Collector,
    slot: usize,
    queue: &mut GrayQueue,
    ctx: &CollectCtx,
    readd: &mut Vec<usize>,
) {
    let ptr = slot as *mut usize;
    let value = ptr.read_volatile();
    if value == 0 || !collector.nursery().contains(value) {
        return;
    }
    collector.copy_object_slot(ptr, queue, ctx);
    collector
        .stats()
        .remset_slots_scanned
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if collector.nursery().contains(ptr.read_volatile()) {
        readd.push(slot);
    }
}

/// Is this store interesting for the remembered set?
#[inline]
fn store_needs_record(collector: &Collector, info: &ThreadInfo, slot: usize, value: usize) -> bool {
    value != 0
        && collector.nursery().contains(value)
        && !collector.nursery().contains(slot)
        && !info.ptr_on_stack(slot)
}

/// `*slot = value` plus barrier. The store happens first; hosts must not
/// abort a thread between this call's store and its record.
///
/// # Safety
/// `slot` must be a live, word-aligned reference slot.
pub(crate) unsafe fn generic_store(collector: &Collector, info: &ThreadInfo, slot: usize, value: usize) {
    (slot as *mut usize).write_volatile(value);
    if collector.nursery().contains(value) {
        generic_nostore(collector, info, slot);
    }
}

/// Barrier for a store that already happened.
///
/// # Safety
/// `slot` must be a live, word-aligned reference slot.
pub(crate) unsafe fn generic_nostore(collector: &Collector, info: &ThreadInfo, slot: usize) {
    let value = (slot as *const usize).read_volatile();
    if !store_needs_record(collector, info, slot, value) {
        log::trace!("skipping remset at {:#x}", slot);
        return;
    }
    log::trace!("adding remset at {:#x}", slot);
    collector
        .stats()
        .wbarrier_stores
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    collector.remset().record_pointer(info, slot);
}

/// Copy `count` reference slots from `src` to `dst` with barriers on the
/// destination. Overlapping ranges are allowed.
///
/// # Safety
/// Both ranges must be live, word-aligned reference-slot arrays.
pub(crate) unsafe fn arrayref_copy(
    collector: &Collector,
    info: &ThreadInfo,
    dst: usize,
    src: usize,
    count: usize,
) {
    if count == 0 {
        return;
    }
    // Destination inside the nursery needs no records at all.
    if collector.nursery().contains(dst) {
        std::ptr::copy(src as *const usize, dst as *mut usize, count);
        return;
    }
    let _gc_guard = if count > LARGE_COPY_SLOTS {
        Some(collector.lock_gc_polling(info))
    } else {
        None
    };
    std::ptr::copy(src as *const usize, dst as *mut usize, count);
    for i in 0..count {
        generic_nostore(collector, info, dst + i * WORD_SIZE);
    }
}

/// Copy `count` value-type elements described by `elem_vtable`, applying
/// barriers to each contained reference slot of the destination.
///
/// # Safety
/// Ranges must be live arrays of `count` elements of the given type.
pub(crate) unsafe fn value_copy(
    collector: &Collector,
    info: &ThreadInfo,
    dst: usize,
    src: usize,
    count: usize,
    elem_vtable: usize,
) {
    if count == 0 {
        return;
    }
    let cb = collector.callbacks();
    let elem_size = (cb.value_size)(elem_vtable);
    let descr = (cb.reference_bitmap)(elem_vtable);
    let total_slots = count * elem_size / WORD_SIZE;
    let _gc_guard = if total_slots > LARGE_COPY_SLOTS {
        Some(collector.lock_gc_polling(info))
    } else {
        None
    };
    std::ptr::copy(src as *const u8, dst as *mut u8, count * elem_size);
    if !descr.has_references() || collector.nursery().contains(dst) {
        return;
    }
    for i in 0..count {
        let elem = dst + i * elem_size;
        descr.for_each_ref_slot(elem, elem + elem_size, &mut |slot| {
            generic_nostore(collector, info, slot as usize);
        });
    }
}

/// Copy a whole object's payload from `src_obj` to `dst_obj` (same class),
/// with barriers on the destination's reference slots.
///
/// # Safety
/// Both objects must be live and of the same class.
pub(crate) unsafe fn object_copy(
    collector: &Collector,
    info: &ThreadInfo,
    dst_obj: usize,
    src_obj: usize,
) {
    use crate::object::header::HEADER_SIZE;
    let cb = collector.callbacks();
    let size = crate::object::safe_object_size(cb, src_obj);
    std::ptr::copy(
        (src_obj + HEADER_SIZE) as *const u8,
        (dst_obj + HEADER_SIZE) as *mut u8,
        size - HEADER_SIZE,
    );
    if collector.nursery().contains(dst_obj) {
        return;
    }
    let descr = (cb.reference_bitmap)(crate::object::vtable(dst_obj));
    if !descr.has_references() {
        return;
    }
    descr.for_each_ref_slot(dst_obj + HEADER_SIZE, dst_obj + size, &mut |slot| {
        generic_nostore(collector, info, slot as usize);
    });
}
