//! Card-table remembered-set backend.
//!
//! One dirty byte per 512-byte card of the old-generation region. The
//! barrier is a single indexed store; the minor collection walks dirty
//! cards and re-derives the interesting slots by scanning the objects that
//! overlap each card. Slots outside the card-covered region (large objects
//! live in their own mappings) fall back to a global list.

use crate::collect::CollectCtx;
use crate::collector::Collector;
use crate::config::CARD_BITS;
use crate::gray::GrayQueue;
use crate::object::header::HEADER_SIZE;
use crate::remset::{scan_remset_slot, RemsetBackend};
use crate::threads::ThreadInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

pub const CARD_SIZE: usize = 1 << CARD_BITS;

pub struct CardTableRemset {
    region_lo: usize,
    region_hi: usize,
    cards: Box<[AtomicU8]>,
    overflow: Mutex<Vec<usize>>,
}

impl CardTableRemset {
    /// Build a table covering `[region_lo, region_hi)` — the old-generation
    /// reservation of the major backend.
    pub fn new(region_lo: usize, region_hi: usize) -> Self {
        let n_cards = (region_hi - region_lo) >> CARD_BITS;
        let mut cards = Vec::with_capacity(n_cards);
        cards.resize_with(n_cards, || AtomicU8::new(0));
        log::debug!(
            "card table over {:#x}-{:#x}: {} cards",
            region_lo,
            region_hi,
            n_cards
        );
        Self {
            region_lo,
            region_hi,
            cards: cards.into_boxed_slice(),
            overflow: Mutex::new(Vec::new()),
        }
    }

    /// Card-table base address, for inline barrier emission: the dirty byte
    /// for `addr` lives at `base + ((addr - region_lo) >> CARD_BITS)`.
    pub fn table_base(&self) -> usize {
        self.cards.as_ptr() as usize
    }

    pub fn covered_range(&self) -> (usize, usize) {
        (self.region_lo, self.region_hi)
    }

    #[inline]
    fn card_index(&self, addr: usize) -> usize {
        (addr - self.region_lo) >> CARD_BITS
    }
}

impl RemsetBackend for CardTableRemset {
    fn name(&self) -> &'static str {
        "cardtable"
    }

    fn record_pointer(&self, _info: &ThreadInfo, slot: usize) {
        if slot >= self.region_lo && slot < self.region_hi {
            self.cards[self.card_index(slot)].store(1, Ordering::Relaxed);
        } else {
            self.overflow.lock().push(slot);
        }
    }

    fn record_global(&self, slot: usize) {
        if slot >= self.region_lo && slot < self.region_hi {
            self.cards[self.card_index(slot)].store(1, Ordering::Relaxed);
        } else {
            self.overflow.lock().push(slot);
        }
    }

    fn begin_scan_remsets(&self, _collector: &Collector) {}

    fn finish_scan_remsets(&self, collector: &Collector, queue: &mut GrayQueue, ctx: &CollectCtx) {
        let cb = collector.callbacks();
        let mut readd = Vec::new();
        let mut dirty = 0usize;
        for (idx, card) in self.cards.iter().enumerate() {
            if card.swap(0, Ordering::Relaxed) == 0 {
                continue;
            }
            dirty += 1;
            let card_start = self.region_lo + (idx << CARD_BITS);
            let card_end = card_start + CARD_SIZE;
            // Visit every reference slot of every object overlapping the
            // card. Objects spanning cards are visited once per dirty
            // card; the scan is idempotent so over-delivery is harmless.
            collector.major().iterate_objects_in_range(
                card_start,
                card_end,
                cb,
                &mut |obj, size| {
                    let descr = (cb.reference_bitmap)(unsafe { crate::object::vtable(obj) });
                    if !descr.has_references() {
                        return;
                    }
                    unsafe {
                        descr.for_each_ref_slot(obj + HEADER_SIZE, obj + size, &mut |slot| {
                            let slot = slot as usize;
                            if slot >= card_start && slot < card_end {
                                scan_remset_slot(collector, slot, queue, ctx, &mut readd);
                            }
                        });
                    }
                },
            );
        }
        let overflow = std::mem::take(&mut *self.overflow.lock());
        log::debug!(
            "card scan: {} dirty cards, {} overflow slots",
            dirty,
            overflow.len()
        );
        for slot in overflow {
            unsafe { scan_remset_slot(collector, slot, queue, ctx, &mut readd) };
        }
        for slot in readd {
            self.record_global(slot);
        }
    }

    fn prepare_for_minor_collection(&self, _collector: &Collector) {}

    fn prepare_for_major_collection(&self, _collector: &Collector) {
        for card in self.cards.iter() {
            card.store(0, Ordering::Relaxed);
        }
        self.overflow.lock().clear();
    }

    fn finish_minor_collection(&self, _collector: &Collector) {}

    fn cleanup_thread(&self, _collector: &Collector, _info: &ThreadInfo) {}

    fn card_table_info(&self) -> Option<(usize, usize, usize)> {
        Some((self.table_base(), self.region_lo, self.region_hi))
    }
}
