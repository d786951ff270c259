//! Nursery fragment management.
//!
//! After a collection, the free space between pinned survivors is carved
//! into a fragment list. TLAB refills and oversized nursery allocations are
//! served from it. Gaps too small to be worth allocating into are either
//! covered with a filler object (so linear walks can step over them) or
//! left zeroed (linear walks skip zero words).

use crate::config::FRAGMENT_MIN_SIZE;
use crate::nursery::NurserySection;
use crate::object::header::MIN_OBJ_SIZE;
use crate::object::{safe_object_size, unpin_object, write_fill_object, RuntimeCallbacks};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub start: usize,
    /// Allocation cursor within the fragment.
    pub next: usize,
    pub end: usize,
}

impl Fragment {
    pub fn available(&self) -> usize {
        self.end - self.next
    }
}

/// The list of allocatable nursery gaps.
pub struct FragmentAllocator {
    frags: Mutex<Vec<Fragment>>,
}

impl FragmentAllocator {
    pub fn new() -> Self {
        Self {
            frags: Mutex::new(Vec::new()),
        }
    }

    /// Replace the list (after a fragment rebuild).
    pub fn install(&self, frags: Vec<Fragment>) {
        *self.frags.lock() = frags;
    }

    /// Drop all fragments. Done at the start of a collection so the space
    /// being collected is never handed out mid-cycle.
    pub fn clear(&self) {
        self.frags.lock().clear();
    }

    /// Carve `[start, end)` of at least `min_size` and at most
    /// `preferred` bytes out of the first fragment that can serve it.
    pub fn alloc_range(&self, min_size: usize, preferred: usize) -> Option<(usize, usize)> {
        debug_assert!(min_size <= preferred);
        let mut frags = self.frags.lock();
        for frag in frags.iter_mut() {
            let available = frag.available();
            if available >= min_size {
                let take = preferred.min(available);
                let start = frag.next;
                frag.next += take;
                return Some((start, start + take));
            }
        }
        None
    }

    /// Total allocatable bytes left.
    pub fn total_free(&self) -> usize {
        self.frags.lock().iter().map(|f| f.available()).sum()
    }

    /// Largest single allocation the list can currently serve.
    pub fn max_available(&self) -> usize {
        self.frags
            .lock()
            .iter()
            .map(|f| f.available())
            .max()
            .unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.frags.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Fragment> {
        self.frags.lock().clone()
    }
}

impl Default for FragmentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the sorted pinned-survivor list and rebuild the fragment list over
/// the rest of the nursery. Pinned objects are unpinned as the walk passes
/// them; every non-pinned byte is zeroed or covered by a filler object so
/// the section stays linearly walkable. Returns the fragments and the total
/// usable bytes.
///
/// # Safety
/// Must run during stop-the-world, after all survivors have been copied
/// out: everything between pinned objects is dead.
pub unsafe fn build_fragments(
    nursery: &NurserySection,
    pinned: &[usize],
    cb: &RuntimeCallbacks,
) -> (Vec<Fragment>, usize) {
    let mut frags = Vec::new();
    let mut total = 0usize;
    let mut cursor = nursery.start();

    let mut handle_gap = |start: usize, end: usize| {
        let gap = end - start;
        if gap == 0 {
            return;
        }
        nursery.zero_range(start, end);
        if gap >= FRAGMENT_MIN_SIZE {
            frags.push(Fragment {
                start,
                next: start,
                end,
            });
            total += gap;
        } else if gap >= MIN_OBJ_SIZE {
            // Too small to allocate into; make it walkable in one step.
            write_fill_object(start, gap);
        }
        // A sub-header sliver stays zeroed; walks skip it word by word.
    };

    for &obj in pinned {
        debug_assert!(obj >= cursor, "pin queue not sorted");
        handle_gap(cursor, obj);
        let size = safe_object_size(cb, obj);
        unpin_object(obj);
        cursor = obj + size;
    }
    handle_gap(cursor, nursery.end());

    log::debug!(
        "nursery fragments rebuilt: {} fragments, {} bytes usable, {} pinned survivors",
        frags.len(),
        total,
        pinned.len()
    );
    (frags, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_range_carves_in_order() {
        let alloc = FragmentAllocator::new();
        alloc.install(vec![
            Fragment {
                start: 0x1000,
                next: 0x1000,
                end: 0x1400,
            },
            Fragment {
                start: 0x2000,
                next: 0x2000,
                end: 0x4000,
            },
        ]);
        assert_eq!(alloc.alloc_range(0x200, 0x200), Some((0x1000, 0x1200)));
        // First fragment can still serve a small request.
        assert_eq!(alloc.alloc_range(0x100, 0x200), Some((0x1200, 0x1400)));
        // Now only the second one can.
        assert_eq!(alloc.alloc_range(0x800, 0x800), Some((0x2000, 0x2800)));
        assert_eq!(alloc.total_free(), 0x4000 - 0x2800);
    }

    #[test]
    fn test_alloc_range_exhaustion() {
        let alloc = FragmentAllocator::new();
        alloc.install(vec![Fragment {
            start: 0x1000,
            next: 0x1000,
            end: 0x1100,
        }]);
        assert!(alloc.alloc_range(0x200, 0x200).is_none());
        assert_eq!(alloc.count(), 1);
        alloc.clear();
        assert_eq!(alloc.count(), 0);
    }
}
