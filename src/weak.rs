//! Weak reference machinery: disappearing links, ephemerons, togglerefs
//! and the bridge handoff.
//!
//! Disappearing links store their referent bit-inverted so conservative
//! scans never mistake the cell for a live reference. The low bit of the
//! hidden word carries the resurrection-tracking flag: non-tracking links
//! are cleared before finalization promotes anything, tracking links only
//! after, so a resurrected object keeps its tracked links.

use crate::collect::CollectCtx;
use crate::collector::Collector;
use crate::gray::GrayQueue;
use crate::object::header::WORD_SIZE;
use crate::object::{ephemeron_tombstone, ToggleRefStatus};
use indexmap::IndexMap;
use std::sync::atomic::Ordering;

/// Bit-invert a pointer for storage in a disappearing-link cell. The low
/// bit of the hidden word encodes the tracking flag.
#[inline]
pub fn hide_pointer(ptr: usize, track: bool) -> usize {
    !(ptr | usize::from(track))
}

/// Recover the pointer from a hidden word.
#[inline]
pub fn reveal_pointer(hidden: usize) -> usize {
    !hidden & !3
}

/// Does this hidden word track resurrection?
#[inline]
pub fn link_is_tracked(hidden: usize) -> bool {
    !hidden & 1 != 0
}

struct StagedLink {
    slot: usize,
    obj: usize,
    track: bool,
    register: bool,
}

struct ToggleRefEntry {
    obj: usize,
    strong: bool,
}

#[derive(Default)]
pub struct WeakState {
    /// Registered disappearing-link cells, keyed by cell address.
    dislinks: IndexMap<usize, ()>,
    staged_links: Vec<StagedLink>,
    /// Registered ephemeron arrays.
    ephemerons: Vec<usize>,
    staged_ephemerons: Vec<usize>,
    togglerefs: Vec<ToggleRefEntry>,
    /// Unreachable bridge objects gathered this cycle, handed to the host
    /// after the world restarts.
    bridge_pending: Vec<usize>,
}

impl WeakState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dislink_count(&self) -> usize {
        self.dislinks.len()
    }

    pub fn ephemeron_count(&self) -> usize {
        self.ephemerons.len()
    }
}

// --- mutator-facing registration ----------------------------------------

/// Point the cell at `slot` to `obj` (hidden) and register it. With
/// `obj == 0` the registration is dropped and the cell nulled.
pub(crate) fn register_disappearing_link(
    collector: &Collector,
    slot: usize,
    obj: usize,
    track: bool,
) {
    let mut state = collector.weak().lock();
    if collector.is_collecting() {
        state.staged_links.push(StagedLink {
            slot,
            obj,
            track,
            register: obj != 0,
        });
        return;
    }
    apply_link(&mut state, slot, obj, track, obj != 0);
}

fn apply_link(state: &mut WeakState, slot: usize, obj: usize, track: bool, register: bool) {
    unsafe {
        if register {
            (slot as *mut usize).write_volatile(hide_pointer(obj, track));
            state.dislinks.insert(slot, ());
        } else {
            (slot as *mut usize).write_volatile(0);
            state.dislinks.shift_remove(&slot);
        }
    }
}

/// Read a disappearing link. Returns 0 once the referent has died.
pub(crate) fn read_disappearing_link(slot: usize) -> usize {
    let hidden = unsafe { (slot as *const usize).read_volatile() };
    if hidden == 0 {
        0
    } else {
        reveal_pointer(hidden)
    }
}

pub(crate) fn register_ephemeron_array(collector: &Collector, array: usize) {
    let mut state = collector.weak().lock();
    if collector.is_collecting() {
        state.staged_ephemerons.push(array);
    } else {
        state.ephemerons.push(array);
    }
}

pub(crate) fn register_toggleref(collector: &Collector, obj: usize) {
    collector.weak().lock().togglerefs.push(ToggleRefEntry {
        obj,
        strong: true,
    });
}

/// Merge staged registrations. Runs early in every collection.
pub(crate) fn process_stage_entries(collector: &Collector) {
    let mut state = collector.weak().lock();
    let links = std::mem::take(&mut state.staged_links);
    for link in links {
        apply_link(&mut state, link.slot, link.obj, link.track, link.register);
    }
    let ephemerons = std::mem::take(&mut state.staged_ephemerons);
    state.ephemerons.extend(ephemerons);
}

// --- collection passes ---------------------------------------------------

/// Ask the host which togglerefs to drop, strengthen or weaken. Runs at
/// world stop.
pub(crate) fn process_togglerefs(collector: &Collector) {
    let Some(status_fn) = collector.callbacks().toggleref_status else {
        return;
    };
    let mut state = collector.weak().lock();
    state.togglerefs.retain_mut(|entry| {
        if entry.obj == 0 {
            return true;
        }
        match status_fn(entry.obj) {
            ToggleRefStatus::Drop => false,
            ToggleRefStatus::Strong => {
                entry.strong = true;
                true
            }
            ToggleRefStatus::Weak => {
                entry.strong = false;
                true
            }
        }
    });
}

/// Trace strong togglerefs; let weak ones follow the object or null out.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn scan_togglerefs(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) {
    let mut state = collector.weak().lock();
    for entry in state.togglerefs.iter_mut() {
        if entry.obj == 0 {
            continue;
        }
        if entry.strong {
            let mut addr = entry.obj;
            collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
            entry.obj = addr;
        } else if collector.object_is_live(entry.obj, ctx) {
            let mut addr = entry.obj;
            collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
            entry.obj = addr;
        } else {
            entry.obj = 0;
        }
    }
}

/// One ephemeron marking round: for every live ephemeron array, copy the
/// array itself, then the value of every pair whose key is reachable.
/// Returns true when the round marked nothing new (the fixpoint).
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn mark_ephemerons_in_range(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) -> bool {
    let mut nothing_marked = true;
    let tombstone = ephemeron_tombstone();
    let cb = *collector.callbacks();
    let mut state = collector.weak().lock();

    for entry in state.ephemerons.iter_mut() {
        let array = *entry;
        if !collector.object_is_live(array, ctx) {
            continue;
        }
        let mut arr = array;
        collector.copy_object_slot(&mut arr as *mut usize, queue, ctx);
        *entry = arr;

        let (mut pair, count) = (cb.array_elements)(arr);
        for _ in 0..count {
            let key_slot = pair as *mut usize;
            let value_slot = (pair + WORD_SIZE) as *mut usize;
            let key = key_slot.read_volatile();
            if key != 0 && key != tombstone && collector.object_is_live(key, ctx) {
                collector.copy_object_slot(key_slot, queue, ctx);
                let value = value_slot.read_volatile();
                if value != 0 {
                    if !collector.object_is_live(value, ctx) {
                        nothing_marked = false;
                    }
                    collector.copy_object_slot(value_slot, queue, ctx);
                }
            }
            pair += 2 * WORD_SIZE;
        }
    }
    nothing_marked
}

/// Clear every ephemeron pair whose key stayed unreachable: the key slot
/// reads tombstone, the value slot null. Dead arrays are dropped from the
/// registry. Arrays that were promoted out of the nursery re-remember any
/// pair members left behind in it.
///
/// # Safety
/// Stop-the-world only; must run after the ephemeron fixpoint.
pub(crate) unsafe fn clear_unreachable_ephemerons(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) {
    let tombstone = ephemeron_tombstone();
    let cb = *collector.callbacks();
    let mut state = collector.weak().lock();

    let mut entries = std::mem::take(&mut state.ephemerons);
    entries.retain_mut(|entry| {
        let array = *entry;
        if !collector.object_is_live(array, ctx) {
            log::debug!("dead ephemeron array at {:#x}", array);
            return false;
        }
        let was_in_nursery = collector.nursery().contains(array);
        let mut arr = array;
        collector.copy_object_slot(&mut arr as *mut usize, queue, ctx);
        *entry = arr;
        let was_promoted = was_in_nursery && !collector.nursery().contains(arr);

        let (mut pair, count) = (cb.array_elements)(arr);
        for _ in 0..count {
            let key_slot = pair as *mut usize;
            let value_slot = (pair + WORD_SIZE) as *mut usize;
            pair += 2 * WORD_SIZE;
            let key = key_slot.read_volatile();
            if key == 0 || key == tombstone {
                continue;
            }
            if !collector.object_is_live(key, ctx) {
                key_slot.write_volatile(tombstone);
                value_slot.write_volatile(0);
                continue;
            }
            if was_promoted {
                // Pair members still in the nursery are old→young edges now.
                if collector.nursery().contains(key_slot.read_volatile()) {
                    collector.remset().record_global(key_slot as usize);
                }
                if collector.nursery().contains(value_slot.read_volatile()) {
                    collector.remset().record_global(value_slot as usize);
                }
            }
        }
        true
    });
    state.ephemerons = entries;
}

/// Null disappearing links whose referent died. The `before_finalization`
/// pass handles non-tracking links, the later pass tracking links; live
/// referents get their hidden word rewritten to the (possibly moved)
/// address.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn null_links_in_range(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
    before_finalization: bool,
) {
    let mut state = collector.weak().lock();
    let slots: Vec<usize> = state.dislinks.keys().copied().collect();
    for slot in slots {
        let hidden = (slot as *const usize).read_volatile();
        if hidden == 0 {
            state.dislinks.shift_remove(&slot);
            continue;
        }
        let target = reveal_pointer(hidden);
        let track = link_is_tracked(hidden);
        if track == before_finalization {
            continue;
        }
        if collector.object_is_live(target, ctx) {
            let mut addr = target;
            collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
            if addr != target {
                (slot as *mut usize).write_volatile(hide_pointer(addr, track));
            }
        } else {
            (slot as *mut usize).write_volatile(0);
            state.dislinks.shift_remove(&slot);
            collector
                .stats()
                .weak_links_cleared
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("cleared disappearing link at {:#x}", slot);
        }
    }
}

// --- bridge processing ---------------------------------------------------

/// Drop bridge state lingering from a previous cycle.
pub(crate) fn bridge_reset_data(collector: &Collector) {
    collector.weak().lock().bridge_pending.clear();
}

/// Gather unreachable bridge-class objects from the finalizable set, keep
/// them alive for the host's cycle analysis, and queue them for the
/// post-restart handoff.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn collect_bridge_objects(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) {
    if collector.callbacks().bridge_process.is_none() {
        return;
    }
    let is_bridge = collector.callbacks().is_bridge_class;
    let candidates = collector.take_unreachable_bridge_candidates(ctx, is_bridge);
    if candidates.is_empty() {
        return;
    }
    let mut state = collector.weak().lock();
    for obj in candidates {
        let mut addr = obj;
        collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
        state.bridge_pending.push(addr);
    }
}

/// Hand the gathered bridge objects to the host. Runs after the world has
/// restarted.
pub(crate) fn bridge_process_after_restart(collector: &Collector) {
    let Some(process) = collector.callbacks().bridge_process else {
        return;
    };
    let pending = std::mem::take(&mut collector.weak().lock().bridge_pending);
    if !pending.is_empty() {
        log::debug!("handing {} bridge objects to the host", pending.len());
        process(&pending);
    }
}
