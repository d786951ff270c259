//! OS memory mapping and heap bounds tracking.
//!
//! All heap memory comes from anonymous mappings obtained through `memmap2`.
//! The collector tracks the lowest and highest addresses it has ever handed
//! out so conservative scans can cheaply reject words that cannot be heap
//! pointers.

use crate::config::page_size;
use crate::error::{GcError, Result};
use memmap2::MmapMut;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An anonymous, zero-initialized mapping with an alignment guarantee.
///
/// The mapping is over-allocated so that `start()` can be aligned up to the
/// requested boundary; the slack is never handed out.
pub struct HeapRegion {
    map: MmapMut,
    start: usize,
    size: usize,
}

impl HeapRegion {
    /// Map `size` bytes aligned to `align` (a power of two, at least one
    /// page). The memory is zeroed by the OS.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(page_size());
        let map = MmapMut::map_anon(size + align)
            .map_err(|e| GcError::VirtualMemory(format!("anonymous mapping failed: {}", e)))?;
        let raw = map.as_ptr() as usize;
        let start = (raw + align - 1) & !(align - 1);
        Ok(Self { map, start, size })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Keep the borrow checker aware the mapping must outlive all pointers.
    pub fn as_map(&self) -> &MmapMut {
        &self.map
    }
}

/// Zero `len` bytes starting at `addr`.
///
/// # Safety
///
/// `addr..addr + len` must lie inside a live heap mapping owned by the
/// caller, with no concurrent access to the range.
#[inline]
pub unsafe fn zero_memory(addr: usize, len: usize) {
    std::ptr::write_bytes(addr as *mut u8, 0, len);
}

/// Lowest/highest addresses ever owned by the collector.
///
/// Updated with CAS loops so racing mappers (LOS allocations happen outside
/// the GC lock) cannot lose an extreme.
pub struct HeapBounds {
    lowest: AtomicUsize,
    highest: AtomicUsize,
}

impl HeapBounds {
    pub fn new() -> Self {
        Self {
            lowest: AtomicUsize::new(usize::MAX),
            highest: AtomicUsize::new(0),
        }
    }

    /// Record that `[start, end)` is now collector-owned memory.
    pub fn update(&self, start: usize, end: usize) {
        let mut lo = self.lowest.load(Ordering::Relaxed);
        while start < lo {
            match self.lowest.compare_exchange_weak(
                lo,
                start,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => lo = actual,
            }
        }
        let mut hi = self.highest.load(Ordering::Relaxed);
        while end > hi {
            match self.highest.compare_exchange_weak(
                hi,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => hi = actual,
            }
        }
    }

    #[inline]
    pub fn lowest(&self) -> usize {
        self.lowest.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn highest(&self) -> usize {
        self.highest.load(Ordering::Relaxed)
    }

    /// Quick filter for conservative scanning: can `addr` possibly be a
    /// pointer into collector-owned memory?
    #[inline]
    pub fn might_contain(&self, addr: usize) -> bool {
        addr >= self.lowest.load(Ordering::Relaxed) && addr < self.highest.load(Ordering::Relaxed)
    }
}

impl Default for HeapBounds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alignment() {
        let region = HeapRegion::new(1 << 20, 1 << 20).unwrap();
        assert_eq!(region.start() & ((1 << 20) - 1), 0);
        assert_eq!(region.size(), 1 << 20);
        assert!(region.contains(region.start()));
        assert!(!region.contains(region.end()));
    }

    #[test]
    fn test_region_is_zeroed() {
        let region = HeapRegion::new(64 * 1024, 4096).unwrap();
        let words = region.start() as *const usize;
        for i in 0..(64 * 1024 / 8) {
            assert_eq!(unsafe { *words.add(i) }, 0);
        }
    }

    #[test]
    fn test_bounds_update() {
        let bounds = HeapBounds::new();
        bounds.update(0x4000, 0x8000);
        bounds.update(0x2000, 0x3000);
        bounds.update(0x9000, 0xa000);
        assert_eq!(bounds.lowest(), 0x2000);
        assert_eq!(bounds.highest(), 0xa000);
        assert!(bounds.might_contain(0x4123));
        assert!(!bounds.might_contain(0x1000));
    }
}
