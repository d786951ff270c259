//! Thread-local allocation buffers.
//!
//! Each mutator thread owns one TLAB carved out of a nursery fragment.
//! Allocation is a bump of `next` against a soft `limit`; the limit is kept
//! at the next scan-start bucket boundary so the slow path can record a
//! scan-start entry every time allocation crosses into a new bucket.
//!
//! Fields are atomics but the owner thread is the only writer outside
//! stop-the-world; the collector resets them only while the owner is
//! suspended.

use crate::config::SCAN_START_SIZE;
use crate::nursery::NurserySection;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Tlab {
    start: AtomicUsize,
    next: AtomicUsize,
    /// Soft limit: the lesser of `real_end` and the end of the scan-start
    /// bucket containing `next`.
    limit: AtomicUsize,
    real_end: AtomicUsize,
}

impl Tlab {
    pub const fn empty() -> Self {
        Self {
            start: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            real_end: AtomicUsize::new(0),
        }
    }

    /// Point the TLAB at a fresh, zeroed `[start, end)` range.
    pub fn install(&self, start: usize, end: usize, nursery: &NurserySection) {
        nursery.record_scan_start(start);
        self.start.store(start, Ordering::Relaxed);
        self.next.store(start, Ordering::Relaxed);
        self.real_end.store(end, Ordering::Relaxed);
        self.limit
            .store(end.min(bucket_end(start)), Ordering::Relaxed);
    }

    /// Bump-allocate `size` bytes (already aligned). Returns the object
    /// address, or `None` when the buffer cannot satisfy the request and
    /// must be refilled.
    #[inline]
    pub fn alloc(&self, size: usize, nursery: &NurserySection) -> Option<usize> {
        let p = self.next.load(Ordering::Relaxed);
        let new_next = p.checked_add(size)?;
        if new_next <= self.limit.load(Ordering::Relaxed) {
            self.next.store(new_next, Ordering::Relaxed);
            return Some(p);
        }
        // Crossing a scan-start boundary (or the buffer is exhausted).
        if new_next <= self.real_end.load(Ordering::Relaxed) {
            nursery.record_scan_start(p);
            self.limit.store(
                self.real_end.load(Ordering::Relaxed).min(bucket_end(new_next)),
                Ordering::Relaxed,
            );
            self.next.store(new_next, Ordering::Relaxed);
            return Some(p);
        }
        None
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.real_end
            .load(Ordering::Relaxed)
            .saturating_sub(self.next.load(Ordering::Relaxed))
    }

    /// Highest address this TLAB may have written an object into.
    pub fn frontier(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Detach the buffer. Done for every thread at the end of a collection;
    /// the next allocation refills from the rebuilt fragment list.
    pub fn clear(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
        self.limit.store(0, Ordering::Relaxed);
        self.real_end.store(0, Ordering::Relaxed);
    }

    pub fn is_installed(&self) -> bool {
        self.real_end.load(Ordering::Relaxed) != 0
    }
}

impl Default for Tlab {
    fn default() -> Self {
        Self::empty()
    }
}

/// End of the scan-start bucket containing `addr`.
#[inline]
fn bucket_end(addr: usize) -> usize {
    (addr | (SCAN_START_SIZE - 1)) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_refill_boundary() {
        let nursery = NurserySection::new(1 << 20).unwrap();
        let tlab = Tlab::empty();
        assert!(!tlab.is_installed());
        assert_eq!(tlab.alloc(16, &nursery), None);

        let base = nursery.start();
        tlab.install(base, base + 1024, &nursery);
        assert!(tlab.is_installed());
        let a = tlab.alloc(16, &nursery).unwrap();
        let b = tlab.alloc(32, &nursery).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + 16);
        assert_eq!(tlab.remaining(), 1024 - 48);

        // Exhaustion.
        assert!(tlab.alloc(2048, &nursery).is_none());
        tlab.clear();
        assert!(!tlab.is_installed());
    }

    #[test]
    fn test_scan_start_recorded_on_bucket_cross() {
        let nursery = NurserySection::new(1 << 20).unwrap();
        let base = nursery.start();
        let tlab = Tlab::empty();
        tlab.install(base, base + 2 * SCAN_START_SIZE, &nursery);
        // Fill most of the first bucket, then cross into the second.
        let mut allocated = 0;
        while allocated + 64 <= SCAN_START_SIZE - 32 {
            tlab.alloc(64, &nursery).unwrap();
            allocated += 64;
        }
        let crosser = tlab.alloc(64, &nursery).unwrap();
        assert!(crosser < base + SCAN_START_SIZE);
        assert!(crosser + 64 > base + SCAN_START_SIZE);
        // The crossing object was recorded in its own bucket.
        assert_eq!(
            nursery.scan_starts()[0].load(std::sync::atomic::Ordering::Relaxed),
            base
        );
    }
}
