//! The nursery: a single contiguous young-generation section.
//!
//! The section is mapped aligned to its own (power-of-two) size, so the
//! nursery membership test is one shift and compare — cheap enough for
//! write-barrier fast paths, and exposable to a managed-code emitter as a
//! base/shift constant pair.
//!
//! A scan-start table with one slot per [`SCAN_START_SIZE`] bucket supports
//! interior-pointer lookup: each entry points at or before the first object
//! in its bucket. Entries are maintained on TLAB boundaries during mutation
//! and rebuilt from the pin queue after each collection.

use crate::config::SCAN_START_SIZE;
use crate::error::Result;
use crate::memory::{zero_memory, HeapRegion};
use crate::pin::SectionView;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct NurserySection {
    region: HeapRegion,
    data: usize,
    end_data: usize,
    bits: u32,
    scan_starts: Box<[AtomicUsize]>,
    /// Highest address handed to any allocation buffer; no object starts at
    /// or beyond it.
    next_data: AtomicUsize,
}

impl NurserySection {
    /// Map a nursery of `size` bytes (a power of two), aligned to `size`.
    pub fn new(size: usize) -> Result<Self> {
        debug_assert!(size.is_power_of_two());
        let region = HeapRegion::new(size, size)?;
        let data = region.start();
        let n_buckets = size / SCAN_START_SIZE;
        let mut scan_starts = Vec::with_capacity(n_buckets);
        scan_starts.resize_with(n_buckets, || AtomicUsize::new(0));
        log::debug!(
            "nursery mapped at {:#x}-{:#x} ({} KiB, {} scan-start buckets)",
            data,
            data + size,
            size / 1024,
            n_buckets
        );
        Ok(Self {
            region,
            data,
            end_data: data + size,
            bits: size.trailing_zeros(),
            scan_starts: scan_starts.into(),
            next_data: AtomicUsize::new(data),
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.data
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end_data
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end_data - self.data
    }

    /// Shift count such that `ptr >> bits == start >> bits` tests
    /// membership. Stable for the lifetime of the collector; suitable for
    /// inline fast-path emission by a managed-code generator.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    #[inline]
    pub fn contains(&self, ptr: usize) -> bool {
        (ptr >> self.bits) == (self.data >> self.bits)
    }

    /// Current allocation frontier (upper bound for object walks).
    #[inline]
    pub fn next_data(&self) -> usize {
        self.next_data.load(Ordering::Acquire)
    }

    /// Raise the allocation frontier to at least `end`.
    #[inline]
    pub fn update_next_data(&self, end: usize) {
        self.next_data.fetch_max(end, Ordering::AcqRel);
    }

    /// Reset the allocation frontier (after a fragment rebuild, to the end
    /// of the last pinned survivor).
    pub fn set_next_data(&self, value: usize) {
        debug_assert!(value >= self.data && value <= self.end_data);
        self.next_data.store(value, Ordering::Release);
    }

    /// Record `obj` as a scan start for its bucket if it improves on the
    /// current entry (entries must point at or before the bucket's first
    /// object).
    pub fn record_scan_start(&self, obj: usize) {
        let idx = (obj - self.data) / SCAN_START_SIZE;
        let slot = &self.scan_starts[idx];
        let mut current = slot.load(Ordering::Relaxed);
        while current == 0 || current > obj {
            match slot.compare_exchange_weak(current, obj, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reset the table to exactly the pinned survivors (ascending order).
    /// Everything else in the nursery is zeroed memory afterwards, which
    /// linear walks skip word by word.
    pub fn rebuild_scan_starts(&self, pinned: &[usize]) {
        for slot in self.scan_starts.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        for &obj in pinned {
            let idx = (obj - self.data) / SCAN_START_SIZE;
            let slot = &self.scan_starts[idx];
            let current = slot.load(Ordering::Relaxed);
            if current == 0 || current > obj {
                slot.store(obj, Ordering::Relaxed);
            }
        }
    }

    pub fn scan_starts(&self) -> &[AtomicUsize] {
        &self.scan_starts
    }

    /// View for pin-queue object lookup. Uses the full nursery extent as the
    /// walk bound.
    pub fn view(&self) -> SectionView<'_> {
        SectionView {
            data: self.data,
            next_data: self.next_data().max(self.data),
            scan_starts: &self.scan_starts,
        }
    }

    /// Zero `[start, end)` inside the nursery.
    pub fn zero_range(&self, start: usize, end: usize) {
        debug_assert!(start >= self.data && end <= self.end_data && start <= end);
        unsafe { zero_memory(start, end - start) };
    }

    /// Keep the mapping alive; used by consistency checks to assert the
    /// region still backs the section.
    pub fn region(&self) -> &HeapRegion {
        &self.region
    }
}
