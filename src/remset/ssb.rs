//! Sequential store buffer remembered-set backend.
//!
//! Each mutator owns a fixed-length buffer of slot addresses; the barrier
//! pushes and, on overflow, spills the whole buffer into a global list.
//! The minor collection drains the global list plus every thread buffer and
//! visits each recorded slot at least once.

use crate::collect::CollectCtx;
use crate::collector::Collector;
use crate::gray::GrayQueue;
use crate::remset::{scan_remset_slot, RemsetBackend};
use crate::threads::ThreadInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-thread slot buffer. The owning thread is the only writer; the
/// collector reads it only while the owner is suspended or unregistered.
pub struct StoreBuffer {
    slots: Box<[AtomicUsize]>,
    index: AtomicUsize,
}

impl StoreBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicUsize::new(0));
        Self {
            slots: slots.into_boxed_slice(),
            index: AtomicUsize::new(0),
        }
    }

    /// Append a slot address. Returns false when the buffer is full.
    #[inline]
    pub fn try_push(&self, slot: usize) -> bool {
        let idx = self.index.load(Ordering::Relaxed);
        if idx >= self.slots.len() {
            return false;
        }
        self.slots[idx].store(slot, Ordering::Relaxed);
        self.index.store(idx + 1, Ordering::Release);
        true
    }

    /// Take every recorded slot and reset the buffer.
    pub fn drain(&self) -> Vec<usize> {
        let n = self.index.swap(0, Ordering::AcqRel);
        (0..n).map(|i| self.slots[i].load(Ordering::Relaxed)).collect()
    }

    pub fn len(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Default buffer capacity, exposed so a managed-code emitter can inline
/// the push fast path.
pub const STORE_BUFFER_CAPACITY: usize = 1024;

/// The sequential-store-buffer backend.
pub struct SsbRemset {
    global: Mutex<Vec<usize>>,
}

impl SsbRemset {
    pub fn new() -> Self {
        Self {
            global: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SsbRemset {
    fn default() -> Self {
        Self::new()
    }
}

impl RemsetBackend for SsbRemset {
    fn name(&self) -> &'static str {
        "remset"
    }

    fn record_pointer(&self, info: &ThreadInfo, slot: usize) {
        if info.ssb.try_push(slot) {
            return;
        }
        // Overflow: spill the whole buffer, then retry.
        let mut global = self.global.lock();
        global.extend(info.ssb.drain());
        drop(global);
        let pushed = info.ssb.try_push(slot);
        debug_assert!(pushed);
    }

    fn record_global(&self, slot: usize) {
        self.global.lock().push(slot);
    }

    fn begin_scan_remsets(&self, _collector: &Collector) {}

    fn finish_scan_remsets(&self, collector: &Collector, queue: &mut GrayQueue, ctx: &CollectCtx) {
        let mut slots = std::mem::take(&mut *self.global.lock());
        for info in collector.threads().snapshot() {
            slots.extend(info.ssb.drain());
        }
        log::debug!("scanning {} remembered slots", slots.len());
        let mut readd = Vec::new();
        for slot in slots {
            unsafe { scan_remset_slot(collector, slot, queue, ctx, &mut readd) };
        }
        // Slots whose target is still young (a pinned survivor) stay
        // remembered for the next minor collection.
        if !readd.is_empty() {
            self.global.lock().extend(readd);
        }
    }

    fn prepare_for_minor_collection(&self, _collector: &Collector) {}

    fn prepare_for_major_collection(&self, collector: &Collector) {
        // A major collection scans the whole heap; recorded slots are
        // redundant and must not survive into the next minor.
        self.global.lock().clear();
        for info in collector.threads().snapshot() {
            info.ssb.drain();
        }
    }

    fn finish_minor_collection(&self, _collector: &Collector) {}

    fn cleanup_thread(&self, _collector: &Collector, info: &ThreadInfo) {
        let pending = info.ssb.drain();
        if !pending.is_empty() {
            self.global.lock().extend(pending);
        }
    }
}
