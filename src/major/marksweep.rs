//! Block-structured mark-sweep old generation.
//!
//! The reservation is carved into 16 KiB blocks, each dedicated to one
//! object size class and tracked with an allocation bitmap plus a free-slot
//! stack. Fixed object strides make address-to-object resolution trivial,
//! which is what lets this backend advertise card-table support.
//!
//! Liveness during a major collection lives in a side mark bitmap shared by
//! all blocks; marking is a single atomic `fetch_or`, so parallel workers
//! need no further coordination here.

use crate::gray::GrayQueue;
use crate::major::{ChunkedRegion, MajorBackend, MarkBitmap, SweepOutcome};
use crate::memory::zero_memory;
use crate::object::{pin_object, unpin_object, RuntimeCallbacks};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const MS_BLOCK_SIZE: usize = 16 * 1024;

/// Object size classes. The largest must cover the biggest small object.
const SIZE_CLASSES: &[usize] = &[
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 4096, 8192,
];

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size)
}

struct MsBlock {
    base: usize,
    obj_size: usize,
    n_slots: usize,
    /// Bit per slot: currently holds an object.
    allocated: Vec<u64>,
    /// Stack of free slot indexes.
    free: Vec<u16>,
}

impl MsBlock {
    fn new(base: usize, obj_size: usize) -> Self {
        let n_slots = MS_BLOCK_SIZE / obj_size;
        Self {
            base,
            obj_size,
            n_slots,
            allocated: vec![0; (n_slots + 63) / 64],
            free: (0..n_slots as u16).rev().collect(),
        }
    }

    #[inline]
    fn is_allocated(&self, slot: usize) -> bool {
        self.allocated[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    fn set_allocated(&mut self, slot: usize) {
        self.allocated[slot / 64] |= 1 << (slot % 64);
    }

    #[inline]
    fn clear_allocated(&mut self, slot: usize) {
        self.allocated[slot / 64] &= !(1 << (slot % 64));
    }

    #[inline]
    fn slot_addr(&self, slot: usize) -> usize {
        self.base + slot * self.obj_size
    }

    /// Slot index for an interior address, or `None` past the usable area.
    #[inline]
    fn slot_of(&self, addr: usize) -> Option<usize> {
        let slot = (addr - self.base) / self.obj_size;
        (slot < self.n_slots).then_some(slot)
    }
}

struct MsState {
    /// Indexed by chunk number; `None` for unallocated chunks.
    blocks: Vec<Option<MsBlock>>,
    /// Per size class: blocks with at least one free slot.
    class_blocks: Vec<Vec<usize>>,
    used_block_count: usize,
    blocks_alloced_since_reset: usize,
}

pub struct MarkSweep {
    region: ChunkedRegion,
    marks: MarkBitmap,
    state: Mutex<MsState>,
    in_major: AtomicBool,
    used_bytes: AtomicUsize,
    fixed: bool,
    parallel: bool,
}

impl MarkSweep {
    pub fn new(max_heap_size: usize, fixed: bool, parallel: bool) -> Result<Self> {
        let region = ChunkedRegion::new(max_heap_size, MS_BLOCK_SIZE)?;
        if fixed {
            region.prealloc_all();
        }
        let marks = MarkBitmap::new(region.lo(), region.hi())?;
        let max_chunks = region.max_chunks();
        let mut blocks = Vec::with_capacity(max_chunks);
        blocks.resize_with(max_chunks, || None);
        log::debug!(
            "mark-sweep major heap at {:#x}-{:#x} ({} blocks max, fixed={}, parallel={})",
            region.lo(),
            region.hi(),
            max_chunks,
            fixed,
            parallel
        );
        Ok(Self {
            region,
            marks,
            state: Mutex::new(MsState {
                blocks,
                class_blocks: vec![Vec::new(); SIZE_CLASSES.len()],
                used_block_count: 0,
                blocks_alloced_since_reset: 0,
            }),
            in_major: AtomicBool::new(false),
            used_bytes: AtomicUsize::new(0),
            fixed,
            parallel,
        })
    }

    /// Resolve an interior address to its allocated object start.
    fn object_containing(&self, addr: usize) -> Option<usize> {
        let state = self.state.lock();
        let block = state.blocks.get(self.region.chunk_index(addr))?.as_ref()?;
        let slot = block.slot_of(addr)?;
        block.is_allocated(slot).then(|| block.slot_addr(slot))
    }

    /// Snapshot `(object, size)` pairs under the lock so callbacks can
    /// allocate without deadlocking.
    fn snapshot_objects(&self, range: Option<(usize, usize)>) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for block in state.blocks.iter().flatten() {
            if let Some((start, end)) = range {
                if block.base + MS_BLOCK_SIZE <= start || block.base >= end {
                    continue;
                }
            }
            for slot in 0..block.n_slots {
                if !block.is_allocated(slot) {
                    continue;
                }
                let obj = block.slot_addr(slot);
                if let Some((start, end)) = range {
                    if obj + block.obj_size <= start || obj >= end {
                        continue;
                    }
                }
                out.push((obj, block.obj_size));
            }
        }
        out
    }
}

impl MajorBackend for MarkSweep {
    fn name(&self) -> &'static str {
        if self.fixed {
            "marksweep-fixed"
        } else {
            "marksweep"
        }
    }

    fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn supports_card_table(&self) -> bool {
        true
    }

    fn heap_range(&self) -> (usize, usize) {
        (self.region.lo(), self.region.hi())
    }

    fn section_size(&self) -> usize {
        MS_BLOCK_SIZE
    }

    fn sections_used(&self) -> usize {
        self.state.lock().used_block_count
    }

    fn sections_free(&self) -> usize {
        self.region.free_chunk_count()
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn sections_alloced_since_reset(&self) -> usize {
        self.state.lock().blocks_alloced_since_reset
    }

    fn reset_sections_alloced(&self) {
        self.state.lock().blocks_alloced_since_reset = 0;
    }

    fn alloc_small(&self, size: usize) -> Option<usize> {
        let ci = class_index(size)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        loop {
            if let Some(&bi) = state.class_blocks[ci].last() {
                let block = state.blocks[bi]
                    .as_mut()
                    .expect("class list references a freed block");
                if let Some(slot) = block.free.pop() {
                    let slot = slot as usize;
                    block.set_allocated(slot);
                    let addr = block.slot_addr(slot);
                    let obj_size = block.obj_size;
                    let now_full = block.free.is_empty();
                    if now_full {
                        state.class_blocks[ci].pop();
                    }
                    self.used_bytes.fetch_add(obj_size, Ordering::Relaxed);
                    if self.in_major.load(Ordering::Relaxed) {
                        // Born live: the upcoming sweep must not reclaim it.
                        self.marks.try_mark(addr);
                    }
                    return Some(addr);
                }
                state.class_blocks[ci].pop();
                continue;
            }
            let base = self.region.allocate_chunk()?;
            let bi = self.region.chunk_index(base);
            state.blocks[bi] = Some(MsBlock::new(base, SIZE_CLASSES[ci]));
            state.class_blocks[ci].push(bi);
            state.used_block_count += 1;
            state.blocks_alloced_since_reset += 1;
        }
    }

    fn ptr_in_heap(&self, ptr: usize) -> bool {
        self.region.contains(ptr) && self.object_containing(ptr).is_some()
    }

    fn is_object_live(&self, obj: usize) -> bool {
        self.marks.is_marked(obj)
    }

    fn pin_object_at(
        &self,
        addr: usize,
        queue: &mut GrayQueue,
        _cb: &RuntimeCallbacks,
    ) -> Option<usize> {
        let obj = self.object_containing(addr)?;
        if self.marks.try_mark(obj) {
            unsafe { pin_object(obj) };
            queue.enqueue(obj);
            Some(obj)
        } else {
            None
        }
    }

    unsafe fn copy_or_mark_object(
        &self,
        slot: *mut usize,
        queue: &mut GrayQueue,
        _cb: &RuntimeCallbacks,
    ) {
        let obj = slot.read();
        debug_assert!(self.region.contains(obj));
        if self.marks.try_mark(obj) {
            queue.enqueue(obj);
        }
    }

    fn iterate_objects(
        &self,
        include_pinned: bool,
        include_non_pinned: bool,
        _cb: &RuntimeCallbacks,
        f: &mut dyn FnMut(usize, usize),
    ) {
        for (obj, size) in self.snapshot_objects(None) {
            let pinned = unsafe { crate::object::is_pinned(obj) };
            if (pinned && include_pinned) || (!pinned && include_non_pinned) {
                f(obj, size);
            }
        }
    }

    fn iterate_objects_in_range(
        &self,
        start: usize,
        end: usize,
        _cb: &RuntimeCallbacks,
        f: &mut dyn FnMut(usize, usize),
    ) {
        for (obj, size) in self.snapshot_objects(Some((start, end))) {
            f(obj, size);
        }
    }

    fn start_nursery_collection(&self) {}

    fn finish_nursery_collection(&self) {}

    fn start_major_collection(&self) {
        self.marks.clear_all();
        self.in_major.store(true, Ordering::Release);
    }

    fn finish_major_collection(&self) {
        self.in_major.store(false, Ordering::Release);
    }

    fn sweep(&self, _cb: &RuntimeCallbacks, _clear_at_gc: bool) -> SweepOutcome {
        let mut state = self.state.lock();
        let state = &mut *state;
        let sections_before = state.used_block_count;
        let mut freed_blocks = Vec::new();

        for bi in 0..state.blocks.len() {
            let Some(block) = state.blocks[bi].as_mut() else {
                continue;
            };
            let mut live = 0usize;
            for slot in 0..block.n_slots {
                if !block.is_allocated(slot) {
                    continue;
                }
                let obj = block.slot_addr(slot);
                if self.marks.is_marked(obj) {
                    live += 1;
                    unsafe { unpin_object(obj) };
                } else {
                    block.clear_allocated(slot);
                    block.free.push(slot as u16);
                    // Freed slots hand out zeroed memory on reuse.
                    unsafe { zero_memory(obj, block.obj_size) };
                    self.used_bytes.fetch_sub(block.obj_size, Ordering::Relaxed);
                }
            }
            if live == 0 {
                freed_blocks.push(bi);
            }
        }

        for bi in freed_blocks {
            let block = state.blocks[bi].take().expect("freed block vanished");
            state.used_block_count -= 1;
            self.region.free_chunk(block.base);
        }

        // Rebuild the per-class allocation lists from scratch.
        for list in state.class_blocks.iter_mut() {
            list.clear();
        }
        for bi in 0..state.blocks.len() {
            if let Some(block) = &state.blocks[bi] {
                if !block.free.is_empty() {
                    let ci = class_index(block.obj_size).expect("unknown block class");
                    state.class_blocks[ci].push(bi);
                }
            }
        }

        self.marks.clear_all();
        let sections_after = state.used_block_count;
        log::debug!(
            "mark-sweep sweep: {} -> {} blocks",
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
    fn test_class_index() {
        assert_eq!(class_index(16), Some(0));
        assert_eq!(class_index(17), Some(1));
        assert_eq!(class_index(8192), Some(SIZE_CLASSES.len() - 1));
        assert_eq!(class_index(8193), None);
    }

    #[test]
    fn test_alloc_and_resolve() {
        let ms = MarkSweep::new(4 * 1024 * 1024, false, false).unwrap();
        let a = ms.alloc_small(48).unwrap();
        let b = ms.alloc_small(48).unwrap();
        assert_ne!(a, b);
        assert!(ms.ptr_in_heap(a));
        assert!(ms.ptr_in_heap(a + 20));
        assert_eq!(ms.object_containing(a + 47), Some(a));
        assert_eq!(ms.used_bytes(), 96);
        assert_eq!(ms.sections_used(), 1);
    }

    #[test]
    fn test_sweep_reclaims_unmarked() {
        let cb = RuntimeCallbacks::default();
        let ms = MarkSweep::new(4 * 1024 * 1024, false, false).unwrap();
        let keep = ms.alloc_small(64).unwrap();
        let drop_me = ms.alloc_small(64).unwrap();
        unsafe {
            crate::object::set_vtable(keep, 0x100);
            crate::object::set_vtable(drop_me, 0x100);
        }
        ms.start_major_collection();
        let mut q = GrayQueue::new();
        let mut slot = keep;
        unsafe { ms.copy_or_mark_object(&mut slot as *mut usize, &mut q, &cb) };
        assert_eq!(q.dequeue(), Some(keep));
        let outcome = ms.sweep(&cb, false);
        ms.finish_major_collection();
        assert_eq!(outcome.sections_before, 1);
        assert_eq!(ms.used_bytes(), 64);
        // The dead slot was zeroed for reuse.
        assert_eq!(unsafe { *(drop_me as *const usize) }, 0);
        // New allocation reuses the freed slot.
        let again = ms.alloc_small(64).unwrap();
        assert_eq!(again, drop_me);
    }

    #[test]
    fn test_fixed_heap_caps_blocks() {
        let ms = MarkSweep::new(4 * 1024 * 1024, true, false).unwrap();
        assert_eq!(ms.sections_free(), 4 * 1024 * 1024 / MS_BLOCK_SIZE);
        assert!(ms.alloc_small(64).is_some());
    }
}
