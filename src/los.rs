//! Large-object store.
//!
//! Objects above the small-object threshold (and explicitly pinned
//! allocations) each get their own page mapping and never move. Liveness
//! during a major collection is the pinned tag: tracing pins a reached
//! large object, and the sweep unpins survivors and unmaps the rest.

use crate::config::page_size;
use crate::error::Result;
use crate::memory::{HeapBounds, HeapRegion};
use crate::object::{align_up, is_pinned, pin_object, set_vtable, unpin_object};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

struct LosEntry {
    region: HeapRegion,
    size: usize,
}

pub struct LargeObjectStore {
    entries: Mutex<IndexMap<usize, LosEntry>>,
    used_bytes: AtomicUsize,
    alloced_since_reset: AtomicUsize,
}

impl LargeObjectStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            used_bytes: AtomicUsize::new(0),
            alloced_since_reset: AtomicUsize::new(0),
        }
    }

    /// Allocate a zeroed large object and write its vtable word.
    pub fn alloc(&self, vtable: usize, size: usize, bounds: &HeapBounds) -> Result<usize> {
        let map_size = align_up(size, page_size());
        let region = HeapRegion::new(map_size, page_size())?;
        let obj = region.start();
        unsafe { set_vtable(obj, vtable) };
        bounds.update(region.start(), region.end());
        self.entries.lock().insert(obj, LosEntry { region, size });
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.alloced_since_reset.fetch_add(size, Ordering::Relaxed);
        log::debug!("large object {:#x} allocated ({} bytes)", obj, size);
        Ok(obj)
    }

    /// Is `obj` exactly a large-object start?
    pub fn contains_object(&self, obj: usize) -> bool {
        self.entries.lock().contains_key(&obj)
    }

    /// Object whose mapping contains `addr`, if any.
    pub fn find_containing(&self, addr: usize) -> Option<usize> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|(_, e)| e.region.contains(addr))
            .map(|(&obj, _)| obj)
    }

    /// Conservative pinning: pin the large object containing `addr`.
    /// Returns it when this call pinned it.
    pub fn pin_address(&self, addr: usize) -> Option<usize> {
        let obj = self.find_containing(addr)?;
        unsafe {
            if is_pinned(obj) {
                return None;
            }
            pin_object(obj);
        }
        Some(obj)
    }

    /// Visit `(object, size)` for every large object.
    pub fn iterate(&self, f: &mut dyn FnMut(usize, usize)) {
        let entries = self.entries.lock();
        for (&obj, entry) in entries.iter() {
            f(obj, entry.size);
        }
    }

    /// Unpin survivors, unmap everything else. Returns freed bytes.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut freed = 0usize;
        entries.retain(|&obj, entry| {
            let keep = unsafe { is_pinned(obj) };
            if keep {
                unsafe { unpin_object(obj) };
            } else {
                freed += entry.size;
                log::debug!("large object {:#x} freed ({} bytes)", obj, entry.size);
            }
            keep
        });
        self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Bytes allocated since the last major collection.
    pub fn alloced_since_reset(&self) -> usize {
        self.alloced_since_reset.load(Ordering::Relaxed)
    }

    pub fn reset_alloced(&self) {
        self.alloced_since_reset.store(0, Ordering::Relaxed);
    }
}

impl Default for LargeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_sweep() {
        let los = LargeObjectStore::new();
        let bounds = HeapBounds::new();
        let keep = los.alloc(0x100, 10_000, &bounds).unwrap();
        let drop_me = los.alloc(0x100, 20_000, &bounds).unwrap();
        assert_eq!(los.count(), 2);
        assert_eq!(los.used_bytes(), 30_000);
        assert!(bounds.might_contain(keep));

        assert_eq!(los.pin_address(keep + 128), Some(keep));
        // Already pinned: second pin reports nothing new.
        assert_eq!(los.pin_address(keep), None);

        let freed = los.sweep();
        assert_eq!(freed, 20_000);
        assert!(los.contains_object(keep));
        assert!(!los.contains_object(drop_me));
        // Survivor left unpinned for the next cycle.
        assert!(!unsafe { is_pinned(keep) });
    }

    #[test]
    fn test_find_containing() {
        let los = LargeObjectStore::new();
        let bounds = HeapBounds::new();
        let obj = los.alloc(0x100, 9000, &bounds).unwrap();
        assert_eq!(los.find_containing(obj + 4096), Some(obj));
        assert_eq!(los.find_containing(0x10), None);
    }
}
