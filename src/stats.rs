//! Collection statistics and phase timing.
//!
//! All counters are plain atomics so mutators and workers can bump them
//! without coordination. Phase times are accumulated in microseconds.
//! Per-class pinning statistics are gathered only under the
//! `print-pinning` debug flag and reset after every collection.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Aggregated collector statistics.
#[derive(Default)]
pub struct GcStats {
    pub minor_gcs: AtomicU64,
    pub major_gcs: AtomicU64,

    pub pinned_objects: AtomicU64,
    pub copied_objects: AtomicU64,
    pub copied_bytes: AtomicU64,
    pub objects_alloced_degraded: AtomicU64,
    pub bytes_alloced_degraded: AtomicU64,
    pub los_objects_alloced: AtomicU64,

    /// Slots copied in vain by parallel workers losing a forwarding race.
    pub slots_allocated_in_vain: AtomicU64,

    pub wbarrier_stores: AtomicU64,
    pub remset_slots_scanned: AtomicU64,

    pub stw_restart_rounds: AtomicU64,
    pub threads_died_in_handshake: AtomicU64,

    /// Worst pause observed across all collections, in microseconds.
    pub max_pause_usec: AtomicU64,
    pub last_pause_usec: AtomicU64,

    pub time_minor_pinning_usec: AtomicU64,
    pub time_minor_scan_remsets_usec: AtomicU64,
    pub time_minor_scan_roots_usec: AtomicU64,
    pub time_minor_finish_gray_stack_usec: AtomicU64,
    pub time_minor_fragment_creation_usec: AtomicU64,
    pub time_major_pinning_usec: AtomicU64,
    pub time_major_scan_roots_usec: AtomicU64,
    pub time_major_finish_gray_stack_usec: AtomicU64,
    pub time_major_sweep_usec: AtomicU64,

    pub finalizers_run: AtomicU64,
    pub weak_links_cleared: AtomicU64,
    pub ephemeron_rounds: AtomicU64,

    pub fragments_built: AtomicUsize,

    /// Per-class pinning tally for the current collection. Only filled
    /// when `print-pinning` is set.
    pub pin_stats: PinStats,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pause(&self, usec: u64) {
        self.last_pause_usec.store(usec, Ordering::Relaxed);
        self.max_pause_usec.fetch_max(usec, Ordering::Relaxed);
    }
}

/// Pinned objects and bytes tallied per class (keyed by vtable word).
///
/// Gathered during the pinning phase, printed and reset at the end of it.
#[derive(Default)]
pub struct PinStats {
    per_class: Mutex<IndexMap<usize, ClassPinTally>>,
}

#[derive(Default, Clone, Copy)]
struct ClassPinTally {
    objects: u64,
    bytes: u64,
}

impl PinStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one pinned object of `size` bytes for its class.
    pub fn register_object(&self, vtable: usize, size: usize) {
        let mut per_class = self.per_class.lock();
        let tally = per_class.entry(vtable).or_default();
        tally.objects += 1;
        tally.bytes += size as u64;
    }

    pub fn class_count(&self) -> usize {
        self.per_class.lock().len()
    }

    /// Totals across all classes: `(objects, bytes)`.
    pub fn totals(&self) -> (u64, u64) {
        let per_class = self.per_class.lock();
        per_class
            .values()
            .fold((0, 0), |(objects, bytes), tally| {
                (objects + tally.objects, bytes + tally.bytes)
            })
    }

    /// Log the per-class breakdown for one collection, then reset.
    pub fn print_class_stats(&self, label: &str) {
        let mut per_class = self.per_class.lock();
        per_class.sort_by(|_, a, _, b| b.bytes.cmp(&a.bytes));
        let mut total_objects = 0u64;
        let mut total_bytes = 0u64;
        for (&vtable, tally) in per_class.iter() {
            log::info!(
                "{} pinning: class {:#x}: {} objects, {} bytes",
                label,
                vtable,
                tally.objects,
                tally.bytes
            );
            total_objects += tally.objects;
            total_bytes += tally.bytes;
        }
        log::info!(
            "{} pinning: {} objects, {} bytes across {} classes",
            label,
            total_objects,
            total_bytes,
            per_class.len()
        );
        per_class.clear();
    }

    pub fn reset(&self) {
        self.per_class.lock().clear();
    }
}

/// Stopwatch for a single collection phase.
pub struct PhaseTimer {
    start: Instant,
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Add the elapsed time to `counter` and restart the stopwatch.
    pub fn lap(&mut self, counter: &AtomicU64) {
        let now = Instant::now();
        let usec = now.duration_since(self.start).as_micros() as u64;
        counter.fetch_add(usec, Ordering::Relaxed);
        self.start = now;
    }

    pub fn elapsed_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pause_keeps_max() {
        let stats = GcStats::new();
        stats.record_pause(120);
        stats.record_pause(80);
        assert_eq!(stats.last_pause_usec.load(Ordering::Relaxed), 80);
        assert_eq!(stats.max_pause_usec.load(Ordering::Relaxed), 120);
    }

    #[test]
    fn test_phase_timer_accumulates() {
        let counter = AtomicU64::new(0);
        let mut timer = PhaseTimer::start();
        timer.lap(&counter);
        timer.lap(&counter);
        // Two laps happened; both contributed a (possibly zero) duration.
        let _ = counter.load(Ordering::Relaxed);
    }

    #[test]
    fn test_pin_stats_tally_and_reset() {
        let pin_stats = PinStats::new();
        pin_stats.register_object(0x1000, 64);
        pin_stats.register_object(0x1000, 64);
        pin_stats.register_object(0x2000, 128);
        assert_eq!(pin_stats.class_count(), 2);
        assert_eq!(pin_stats.totals(), (3, 256));

        pin_stats.print_class_stats("test");
        assert_eq!(pin_stats.class_count(), 0);
        assert_eq!(pin_stats.totals(), (0, 0));
    }
}
