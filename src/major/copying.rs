//! Section-based copying old generation.
//!
//! The old space is a set of bump-allocated sections. A major collection
//! flips every existing section to from-space and evacuates live objects
//! into fresh to-space sections, installing forwarding pointers as it goes.
//! Sections holding conservatively pinned objects cannot be evacuated
//! wholesale: survivors stay put and the dead gaps around them are covered
//! with filler objects so the section stays linearly walkable.
//!
//! This backend does not advertise card-table support: objects move, so
//! there is no fixed stride to re-derive object starts from a dirty card.

use crate::config::SCAN_START_SIZE;
use crate::error::Result;
use crate::gray::GrayQueue;
use crate::major::{ChunkedRegion, MajorBackend, SweepOutcome};
use crate::memory::zero_memory;
use crate::object::header::MIN_OBJ_SIZE;
use crate::object::{
    fill_vtable, forwarding_address, is_pinned, pin_object, safe_object_size, try_forward,
    unpin_object, vtable, write_fill_object, RuntimeCallbacks,
};
use crate::pin::SectionView;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub const COPY_SECTION_SIZE: usize = 128 * 1024;

struct CopySection {
    base: usize,
    next: usize,
    to_space: bool,
    scan_starts: Vec<AtomicUsize>,
}

impl CopySection {
    fn new(base: usize, to_space: bool) -> Self {
        let mut scan_starts = Vec::with_capacity(COPY_SECTION_SIZE / SCAN_START_SIZE);
        scan_starts.resize_with(COPY_SECTION_SIZE / SCAN_START_SIZE, || AtomicUsize::new(0));
        Self {
            base,
            next: base,
            to_space,
            scan_starts,
        }
    }

    fn record_scan_start(&self, obj: usize) {
        let idx = (obj - self.base) / SCAN_START_SIZE;
        let slot = &self.scan_starts[idx];
        let current = slot.load(Ordering::Relaxed);
        if current == 0 || current > obj {
            slot.store(obj, Ordering::Relaxed);
        }
    }

    fn view(&self) -> SectionView<'_> {
        SectionView {
            data: self.base,
            next_data: self.next,
            scan_starts: &self.scan_starts,
        }
    }

    /// Walk `(object, size)` pairs, skipping filler and zeroed gaps.
    ///
    /// # Safety
    /// Section must not be concurrently bumped.
    unsafe fn walk(&self, cb: &RuntimeCallbacks, f: &mut dyn FnMut(usize, usize)) {
        let mut cursor = self.base;
        while cursor < self.next {
            if (cursor as *const usize).read() == 0 {
                cursor += crate::object::WORD_SIZE;
                continue;
            }
            let size = safe_object_size(cb, cursor);
            if vtable(cursor) != fill_vtable() {
                f(cursor, size);
            }
            cursor += size;
        }
    }
}

struct CopyState {
    /// Keyed by chunk index within the reservation.
    sections: IndexMap<usize, CopySection>,
    /// Chunk index of the section currently taking allocations.
    current: Option<usize>,
    sections_alloced_since_reset: usize,
}

pub struct CopyingMajor {
    region: ChunkedRegion,
    state: Mutex<CopyState>,
    in_major: AtomicBool,
    used_bytes: AtomicUsize,
    vain_copies: AtomicU64,
}

impl CopyingMajor {
    pub fn new(max_heap_size: usize) -> Result<Self> {
        let region = ChunkedRegion::new(max_heap_size, COPY_SECTION_SIZE)?;
        log::debug!(
            "copying major heap at {:#x}-{:#x} ({} sections max)",
            region.lo(),
            region.hi(),
            region.max_chunks()
        );
        Ok(Self {
            region,
            state: Mutex::new(CopyState {
                sections: IndexMap::new(),
                current: None,
                sections_alloced_since_reset: 0,
            }),
            in_major: AtomicBool::new(false),
            used_bytes: AtomicUsize::new(0),
            vain_copies: AtomicU64::new(0),
        })
    }

    fn snapshot_objects(&self, range: Option<(usize, usize)>, cb: &RuntimeCallbacks) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for section in state.sections.values() {
            if let Some((start, end)) = range {
                if section.next <= start || section.base >= end {
                    continue;
                }
            }
            unsafe {
                section.walk(cb, &mut |obj, size| {
                    if let Some((start, end)) = range {
                        if obj + size <= start || obj >= end {
                            return;
                        }
                    }
                    out.push((obj, size));
                });
            }
        }
        out
    }
}

impl MajorBackend for CopyingMajor {
    fn name(&self) -> &'static str {
        "copying"
    }

    fn is_parallel(&self) -> bool {
        false
    }

    fn supports_card_table(&self) -> bool {
        false
    }

    fn heap_range(&self) -> (usize, usize) {
        (self.region.lo(), self.region.hi())
    }

    fn section_size(&self) -> usize {
        COPY_SECTION_SIZE
    }

    fn sections_used(&self) -> usize {
        self.state.lock().sections.len()
    }

    fn sections_free(&self) -> usize {
        self.region.free_chunk_count()
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn sections_alloced_since_reset(&self) -> usize {
        self.state.lock().sections_alloced_since_reset
    }

    fn reset_sections_alloced(&self) {
        self.state.lock().sections_alloced_since_reset = 0;
    }

    fn alloc_small(&self, size: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(idx) = state.current {
            let section = &mut state.sections[&idx];
            if section.next + size <= section.base + COPY_SECTION_SIZE {
                let addr = section.next;
                section.next += size;
                section.record_scan_start(addr);
                self.used_bytes.fetch_add(size, Ordering::Relaxed);
                return Some(addr);
            }
        }
        let base = self.region.allocate_chunk()?;
        let idx = self.region.chunk_index(base);
        let section = CopySection::new(base, self.in_major.load(Ordering::Relaxed));
        state.sections.insert(idx, section);
        state.current = Some(idx);
        state.sections_alloced_since_reset += 1;
        let section = &mut state.sections[&idx];
        let addr = section.next;
        section.next += size;
        section.record_scan_start(addr);
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        Some(addr)
    }

    fn ptr_in_heap(&self, ptr: usize) -> bool {
        if !self.region.contains(ptr) {
            return false;
        }
        let state = self.state.lock();
        state
            .sections
            .get(&self.region.chunk_index(ptr))
            .is_some_and(|s| ptr < s.next)
    }

    fn is_object_live(&self, obj: usize) -> bool {
        let state = self.state.lock();
        let Some(section) = state.sections.get(&self.region.chunk_index(obj)) else {
            return false;
        };
        if section.to_space {
            return true;
        }
        drop(state);
        unsafe { is_pinned(obj) || forwarding_address(obj).is_some() }
    }

    fn pin_object_at(
        &self,
        addr: usize,
        queue: &mut GrayQueue,
        cb: &RuntimeCallbacks,
    ) -> Option<usize> {
        let state = self.state.lock();
        let section = state.sections.get(&self.region.chunk_index(addr))?;
        if section.to_space {
            return None;
        }
        let obj = unsafe { section.view().find_object_containing(addr, cb) }?;
        drop(state);
        unsafe {
            if is_pinned(obj) || forwarding_address(obj).is_some() {
                return None;
            }
            pin_object(obj);
        }
        queue.enqueue(obj);
        Some(obj)
    }

    unsafe fn copy_or_mark_object(
        &self,
        slot: *mut usize,
        queue: &mut GrayQueue,
        cb: &RuntimeCallbacks,
    ) {
        let obj = slot.read();
        {
            let state = self.state.lock();
            let Some(section) = state.sections.get(&self.region.chunk_index(obj)) else {
                return;
            };
            if section.to_space {
                // Already a live copy.
                return;
            }
        }
        if is_pinned(obj) {
            return;
        }
        if let Some(fwd) = forwarding_address(obj) {
            slot.write(fwd);
            return;
        }
        let size = safe_object_size(cb, obj);
        let Some(new_addr) = self.alloc_small(size) else {
            // Evacuation failed for lack of space: keep the object in place.
            pin_object(obj);
            queue.enqueue(obj);
            return;
        };
        std::ptr::copy_nonoverlapping(obj as *const u8, new_addr as *mut u8, size);
        match try_forward(obj, new_addr) {
            Ok(()) => {
                slot.write(new_addr);
                queue.enqueue(new_addr);
            }
            Err(winner) => {
                slot.write(winner);
                self.vain_copies.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn iterate_objects(
        &self,
        include_pinned: bool,
        include_non_pinned: bool,
        cb: &RuntimeCallbacks,
        f: &mut dyn FnMut(usize, usize),
    ) {
        for (obj, size) in self.snapshot_objects(None, cb) {
            let pinned = unsafe { is_pinned(obj) };
            if (pinned && include_pinned) || (!pinned && include_non_pinned) {
                f(obj, size);
            }
        }
    }

    fn iterate_objects_in_range(
        &self,
        start: usize,
        end: usize,
        cb: &RuntimeCallbacks,
        f: &mut dyn FnMut(usize, usize),
    ) {
        for (obj, size) in self.snapshot_objects(Some((start, end)), cb) {
            f(obj, size);
        }
    }

    fn start_nursery_collection(&self) {}

    fn finish_nursery_collection(&self) {}

    fn start_major_collection(&self) {
        let mut state = self.state.lock();
        for section in state.sections.values_mut() {
            section.to_space = false;
        }
        // Force evacuation into fresh sections.
        state.current = None;
        self.in_major.store(true, Ordering::Release);
    }

    fn finish_major_collection(&self) {
        self.in_major.store(false, Ordering::Release);
    }

    fn sweep(&self, cb: &RuntimeCallbacks, clear_at_gc: bool) -> SweepOutcome {
        let mut state = self.state.lock();
        let state = &mut *state;
        let sections_before = state.sections.len();
        let mut freed = Vec::new();

        for (&idx, section) in state.sections.iter_mut() {
            if section.to_space {
                section.to_space = false;
                continue;
            }
            // From-space: keep pinned survivors, cover everything else.
            let mut survivors: Vec<(usize, usize)> = Vec::new();
            unsafe {
                section.walk(cb, &mut |obj, size| {
                    if is_pinned(obj) {
                        survivors.push((obj, size));
                    }
                });
            }
            if survivors.is_empty() {
                freed.push(idx);
                continue;
            }
            // Rewrite the section as pinned objects separated by filler.
            let mut cursor = section.base;
            for &(obj, size) in &survivors {
                let gap = obj - cursor;
                if gap >= MIN_OBJ_SIZE {
                    unsafe {
                        if clear_at_gc {
                            zero_memory(cursor, gap);
                        }
                        write_fill_object(cursor, gap);
                    }
                } else if gap > 0 {
                    unsafe { zero_memory(cursor, gap) };
                }
                unsafe { unpin_object(obj) };
                cursor = obj + size;
            }
            // Reclaim the dead tail by bumping the frontier back.
            let old_next = section.next;
            if cursor < old_next {
                unsafe { zero_memory(cursor, old_next - cursor) };
            }
            section.next = cursor;
            for slot in section.scan_starts.iter() {
                slot.store(0, Ordering::Relaxed);
            }
            for &(obj, _) in &survivors {
                section.record_scan_start(obj);
            }
        }

        for idx in freed {
            let section = state.sections.shift_remove(&idx).expect("freed section vanished");
            unsafe { zero_memory(section.base, section.next - section.base) };
            self.region.free_chunk(section.base);
            if state.current == Some(idx) {
                state.current = None;
            }
        }

        let used: usize = state.sections.values().map(|s| s.next - s.base).sum();
        self.used_bytes.store(used, Ordering::Relaxed);
        let sections_after = state.sections.len();
        log::debug!(
            "copying sweep: {} -> {} sections",
            sections_before,
            sections_after
        );
        SweepOutcome {
            sections_before,
            sections_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_bumps_within_section() {
        let major = CopyingMajor::new(4 * 1024 * 1024).unwrap();
        let a = major.alloc_small(64).unwrap();
        let b = major.alloc_small(64).unwrap();
        assert_eq!(b, a + 64);
        assert!(major.ptr_in_heap(a));
        assert!(!major.ptr_in_heap(a + 4 * COPY_SECTION_SIZE));
        assert_eq!(major.sections_used(), 1);
    }

    #[test]
    fn test_major_evacuates_unpinned() {
        fn fixed_size(_obj: usize, _vt: usize) -> usize {
            64
        }
        let cb = RuntimeCallbacks {
            object_size: fixed_size,
            ..Default::default()
        };
        let major = CopyingMajor::new(4 * 1024 * 1024).unwrap();
        let obj = major.alloc_small(64).unwrap();
        unsafe { crate::object::set_vtable(obj, 0x100) };

        major.start_major_collection();
        let mut q = GrayQueue::new();
        let mut slot = obj;
        unsafe { major.copy_or_mark_object(&mut slot as *mut usize, &mut q, &cb) };
        // The object moved to a to-space section and the slot was rewritten.
        assert_ne!(slot, obj);
        assert!(major.is_object_live(slot));
        assert_eq!(unsafe { forwarding_address(obj) }, Some(slot));
        assert_eq!(q.dequeue(), Some(slot));

        let outcome = major.sweep(&cb, false);
        major.finish_major_collection();
        assert_eq!(outcome.sections_before, 2);
        assert_eq!(outcome.sections_after, 1);
    }

    #[test]
    fn test_pinned_objects_stay_put() {
        fn fixed_size(_obj: usize, _vt: usize) -> usize {
            64
        }
        let cb = RuntimeCallbacks {
            object_size: fixed_size,
            ..Default::default()
        };
        let major = CopyingMajor::new(4 * 1024 * 1024).unwrap();
        let obj = major.alloc_small(64).unwrap();
        unsafe { crate::object::set_vtable(obj, 0x100) };

        major.start_major_collection();
        let mut q = GrayQueue::new();
        let pinned = major.pin_object_at(obj + 32, &mut q, &cb);
        assert_eq!(pinned, Some(obj));
        let mut slot = obj;
        unsafe { major.copy_or_mark_object(&mut slot as *mut usize, &mut q, &cb) };
        assert_eq!(slot, obj);

        let outcome = major.sweep(&cb, false);
        major.finish_major_collection();
        assert_eq!(outcome.sections_after, 1);
        assert!(!unsafe { is_pinned(obj) });
        assert!(major.ptr_in_heap(obj));
    }
}
