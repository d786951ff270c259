//! Pin queue: candidate addresses gathered by conservative scanning.
//!
//! During stop-the-world, every word that might be a pointer — from thread
//! stacks, register snapshots and pinned-kind roots — is staged here. The
//! queue is then sorted and deduplicated, partitioned into per-section
//! ranges, and resolved to actual object starts, which get the pinned tag
//! and a slot on the gray stack.

use crate::config::SCAN_START_SIZE;
use crate::gray::GrayQueue;
use crate::object::header::WORD_SIZE;
use crate::object::{fill_vtable, pin_object, safe_object_size, vtable, RuntimeCallbacks};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Append-only address queue with sort/dedup and range partitioning.
pub struct PinQueue {
    addrs: Vec<usize>,
}

impl PinQueue {
    pub fn new() -> Self {
        Self { addrs: Vec::new() }
    }

    #[inline]
    pub fn stage(&mut self, addr: usize) {
        self.addrs.push(addr);
    }

    /// Conservatively scan `[range_start, range_end)` word by word, staging
    /// every value that falls inside `[heap_lo, heap_hi)`.
    ///
    /// Reads go through a byte-derived word pointer; the range does not have
    /// to hold typed data (it is usually a raw stack snapshot).
    ///
    /// # Safety
    /// The range must be readable memory.
    pub unsafe fn stage_conservative_range(
        &mut self,
        range_start: usize,
        range_end: usize,
        heap_lo: usize,
        heap_hi: usize,
    ) {
        let mut cursor = crate::object::align_up(range_start, WORD_SIZE);
        while cursor + WORD_SIZE <= range_end {
            let value = (cursor as *const usize).read_volatile();
            if value >= heap_lo && value < heap_hi {
                self.addrs.push(value);
            }
            cursor += WORD_SIZE;
        }
    }

    /// Sort ascending and drop duplicates in place.
    pub fn sort_and_dedup(&mut self) {
        self.addrs.sort_unstable();
        self.addrs.dedup();
    }

    /// Contiguous index range of staged addresses inside `[start, end)`.
    /// Valid only after [`PinQueue::sort_and_dedup`].
    pub fn find_section_range(&self, start: usize, end: usize) -> std::ops::Range<usize> {
        let lo = self.addrs.partition_point(|&a| a < start);
        let hi = self.addrs.partition_point(|&a| a < end);
        lo..hi
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> &[usize] {
        &self.addrs[range]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.addrs
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
    }
}

impl Default for PinQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A linear-scannable object space: contiguous data with a scan-start table.
///
/// Implemented by the nursery section and by copying-old-space sections.
pub struct SectionView<'a> {
    /// First object address.
    pub data: usize,
    /// Allocation frontier; no object starts at or past it.
    pub next_data: usize,
    /// One entry per [`SCAN_START_SIZE`] bucket, pointing at or before the
    /// first object in that bucket (zero when unknown).
    pub scan_starts: &'a [AtomicUsize],
}

impl<'a> SectionView<'a> {
    /// Locate the object containing `addr` by scan-start descent and
    /// forward walking. Returns the object start, skipping filler objects
    /// and zeroed gaps.
    ///
    /// # Safety
    /// The section must be in the stopped-world state: nothing may allocate
    /// into it during the walk.
    pub unsafe fn find_object_containing(
        &self,
        addr: usize,
        cb: &RuntimeCallbacks,
    ) -> Option<usize> {
        let mut search = self.search_start_for(addr);
        while search <= addr {
            if (search as *const usize).read() == 0 {
                // Unallocated gap; step one word.
                search += WORD_SIZE;
                continue;
            }
            let size = safe_object_size(cb, search);
            if vtable(search) != fill_vtable() && addr >= search && addr < search + size {
                return Some(search);
            }
            search += size;
        }
        None
    }

    fn search_start_for(&self, addr: usize) -> usize {
        let mut idx = (addr - self.data) / SCAN_START_SIZE;
        debug_assert!(idx < self.scan_starts.len());
        let mut search = self.scan_starts[idx].load(Ordering::Relaxed);
        if search == 0 || search > addr {
            while idx > 0 {
                idx -= 1;
                search = self.scan_starts[idx].load(Ordering::Relaxed);
                if search != 0 && search <= addr {
                    break;
                }
            }
            if search == 0 || search > addr {
                search = self.data;
            }
        }
        search
    }
}

/// Resolve sorted candidate addresses to object starts and pin them.
///
/// Walks each address to its containing object via the section's scan-start
/// table, rejects addresses that do not land in an object (zeroed memory or
/// filler), collapses multiple interior pointers to one pin, tags each hit
/// `PINNED` and enqueues it for scanning. Returns the definitively pinned
/// object starts in ascending order.
///
/// # Safety
/// Must run during stop-the-world with `addrs` sorted ascending and all
/// inside the section.
pub unsafe fn pin_objects_from_addresses(
    view: &SectionView<'_>,
    addrs: &[usize],
    cb: &RuntimeCallbacks,
    queue: &mut GrayQueue,
) -> Vec<usize> {
    let mut pinned = Vec::new();
    let mut last_addr = 0usize;
    let mut last_obj = 0usize;
    let mut last_obj_size = 0usize;

    for &addr in addrs {
        if addr == last_addr || addr < view.data || addr >= view.next_data {
            continue;
        }
        // Another interior pointer into the object we just pinned.
        if addr >= last_obj && addr < last_obj + last_obj_size {
            last_addr = addr;
            continue;
        }

        let mut search = view.search_start_for(addr);
        if last_obj != 0 && search < last_obj + last_obj_size {
            search = last_obj + last_obj_size;
        }

        while search <= addr {
            if (search as *const usize).read() == 0 {
                search += WORD_SIZE;
                continue;
            }
            last_obj = search;
            last_obj_size = safe_object_size(cb, search);
            if vtable(search) == fill_vtable() {
                // Dead-area filler, never pinnable.
            } else if addr >= search && addr < search + last_obj_size {
                log::trace!("pinned object {:#x} for address {:#x}", search, addr);
                pin_object(search);
                queue.enqueue(search);
                pinned.push(search);
                break;
            }
            search += last_obj_size;
        }
        last_addr = addr;
    }

    pinned
}
