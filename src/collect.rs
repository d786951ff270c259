//! The collection driver: minor and major cycles, object tracing, and the
//! reachability fixpoint.
//!
//! A minor cycle evacuates the nursery into the old generation; a major
//! cycle traces the whole tracked heap and lets the backend sweep. Both
//! share the same skeleton: merge staged registrations, pin from
//! conservative sources, seed the gray stack from remsets and registered
//! roots (as worker jobs when parallel marking is on), drain, run the
//! weak/finalization post-passes in their rigid order, rebuild nursery
//! fragments, and settle the accounting that drives the next need-major
//! decision.

use crate::alloc::fragment::build_fragments;
use crate::collector::Collector;
use crate::config::StackMark;
use crate::finalize;
use crate::gray::GrayQueue;
use crate::object::header::HEADER_SIZE;
use crate::object::{
    forwarding_address, is_pinned, pin_object, safe_object_size, try_forward, vtable,
};
use crate::pin::{pin_objects_from_addresses, PinQueue};
use crate::roots::RootKind;
use crate::stats::PhaseTimer;
use crate::weak;
use crate::workers::{GcJob, MarkParams};
use std::sync::atomic::Ordering;

/// Which generation a collection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Nursery,
    Old,
}

/// Per-collection parameters threaded through every trace operation.
#[derive(Debug, Clone, Copy)]
pub struct CollectCtx {
    pub gen: Generation,
    /// Collection bounds: objects outside `[scan_lo, scan_hi)` are not
    /// part of this collection and count as live.
    pub scan_lo: usize,
    pub scan_hi: usize,
    pub parallel: bool,
}

/// Heap-growth accounting between major collections.
pub(crate) struct AllowanceState {
    pub minor_collection_allowance: usize,
    need_calculate: bool,
    have_swept: bool,
    last_old_num_major_sections: usize,
    /// Large-object usage at the end of the previous major collection.
    last_los_memory_usage: usize,
    /// Large-object usage when the current major collection started.
    last_old_los_memory_usage: usize,
    /// Large-object bytes allocated between the last two majors.
    last_los_memory_alloced: usize,
}

impl AllowanceState {
    pub(crate) fn new(min_allowance: usize) -> Self {
        Self {
            minor_collection_allowance: min_allowance,
            need_calculate: false,
            have_swept: false,
            last_old_num_major_sections: 0,
            last_los_memory_usage: 0,
            last_old_los_memory_usage: 0,
            last_los_memory_alloced: 0,
        }
    }
}

impl Collector {
    pub(crate) fn make_ctx(&self, params: MarkParams) -> CollectCtx {
        CollectCtx {
            gen: params.gen,
            scan_lo: params.scan_lo,
            scan_hi: params.scan_hi,
            parallel: true,
        }
    }

    fn min_allowance(&self) -> usize {
        4 * self.config().nursery_size
    }

    // --- tracing ---------------------------------------------------------

    /// Trace step: make the object `*slot` refers to survive this
    /// collection, rewriting the slot when the object moves. No-op for
    /// null slots and for objects outside the collection bounds.
    pub(crate) fn copy_object_slot(
        &self,
        slot: *mut usize,
        queue: &mut GrayQueue,
        ctx: &CollectCtx,
    ) {
        unsafe {
            let obj = slot.read();
            if obj == 0 {
                return;
            }
            match ctx.gen {
                Generation::Nursery => {
                    if self.nursery().contains(obj) {
                        self.promote_nursery_object(slot, queue, ctx);
                    }
                }
                Generation::Old => self.major_copy_or_mark(slot, queue, ctx),
            }
        }
    }

    /// Evacuate a nursery object into the old generation, installing the
    /// forwarding pointer with a release CAS. Already-forwarded objects
    /// just get the slot rewritten; pinned objects stay. When the old
    /// generation cannot take the object it is pinned in place instead —
    /// a strong hint that a major collection should follow.
    unsafe fn promote_nursery_object(
        &self,
        slot: *mut usize,
        queue: &mut GrayQueue,
        _ctx: &CollectCtx,
    ) {
        let obj = slot.read();
        debug_assert!(self.nursery().contains(obj));
        if let Some(fwd) = forwarding_address(obj) {
            slot.write(fwd);
            return;
        }
        if is_pinned(obj) {
            return;
        }
        let size = safe_object_size(self.callbacks(), obj);
        match self.major().alloc_small(size) {
            Some(new_addr) => {
                std::ptr::copy_nonoverlapping(obj as *const u8, new_addr as *mut u8, size);
                match try_forward(obj, new_addr) {
                    Ok(()) => {
                        slot.write(new_addr);
                        queue.enqueue(new_addr);
                        self.stats().copied_objects.fetch_add(1, Ordering::Relaxed);
                        self.stats()
                            .copied_bytes
                            .fetch_add(size as u64, Ordering::Relaxed);
                    }
                    Err(winner) => {
                        // Another worker copied first; our copy is garbage
                        // the next sweep reclaims.
                        slot.write(winner);
                        self.stats()
                            .slots_allocated_in_vain
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            None => {
                pin_object(obj);
                self.late_pins().lock().push(obj);
                queue.enqueue(obj);
                log::warn!(
                    "old generation full: pinned {:#x} in the nursery instead of promoting",
                    obj
                );
            }
        }
    }

    /// Major-collection trace step, dispatching on where the object lives.
    unsafe fn major_copy_or_mark(&self, slot: *mut usize, queue: &mut GrayQueue, ctx: &CollectCtx) {
        let obj = slot.read();
        if self.nursery().contains(obj) {
            self.promote_nursery_object(slot, queue, ctx);
            return;
        }
        if self.los().contains_object(obj) {
            if !is_pinned(obj) {
                pin_object(obj);
                queue.enqueue(obj);
            }
            return;
        }
        let (lo, hi) = self.major().heap_range();
        if obj >= lo && obj < hi {
            self.major()
                .copy_or_mark_object(slot, queue, self.callbacks());
        }
        // Anything else (runtime statics etc.) is not collector memory.
    }

    /// Is `obj` reachable as far as this collection can tell? Objects
    /// outside the collection bounds are always live.
    pub(crate) fn object_is_live(&self, obj: usize, ctx: &CollectCtx) -> bool {
        if obj < ctx.scan_lo || obj >= ctx.scan_hi {
            return true;
        }
        unsafe {
            if self.nursery().contains(obj) {
                return is_pinned(obj) || forwarding_address(obj).is_some();
            }
            if self.los().contains_object(obj) {
                return is_pinned(obj);
            }
        }
        let (lo, hi) = self.major().heap_range();
        if obj >= lo && obj < hi {
            return self.major().is_object_live(obj);
        }
        true
    }

    /// Scan one object: apply the trace step to every reference slot its
    /// descriptor selects.
    unsafe fn scan_object(&self, obj: usize, queue: &mut GrayQueue, ctx: &CollectCtx) {
        let cb = self.callbacks();
        let descr = (cb.reference_bitmap)(vtable(obj));
        if !descr.has_references() {
            return;
        }
        let size = safe_object_size(cb, obj);
        let mut slots: Vec<*mut usize> = Vec::new();
        descr.for_each_ref_slot(obj + HEADER_SIZE, obj + size, &mut |slot| slots.push(slot));
        for slot in slots {
            self.copy_object_slot(slot, queue, ctx);
        }
    }

    /// Scan queued objects until the stack is empty (`max < 0`) or up to
    /// `max` objects. Returns true when the stack ended up empty.
    pub(crate) unsafe fn drain_gray_stack(
        &self,
        queue: &mut GrayQueue,
        max: isize,
        ctx: &CollectCtx,
    ) -> bool {
        if max < 0 {
            while let Some(obj) = queue.dequeue() {
                self.scan_object(obj, queue, ctx);
            }
            return true;
        }
        for _ in 0..max {
            match queue.dequeue() {
                Some(obj) => self.scan_object(obj, queue, ctx),
                None => return true,
            }
        }
        queue.is_empty()
    }

    // --- root scanning ---------------------------------------------------

    /// Run one marking job. Shared by the worker pool and the inline
    /// (non-parallel) path.
    pub(crate) unsafe fn execute_job(&self, job: GcJob, queue: &mut GrayQueue, ctx: &CollectCtx) {
        match job {
            GcJob::ScanRemsets => self.remset().finish_scan_remsets(self, queue, ctx),
            GcJob::ScanRootsNormal => self.scan_registered_roots(RootKind::Normal, queue, ctx),
            GcJob::ScanRootsWBarrier => self.scan_registered_roots(RootKind::WBarrier, queue, ctx),
            GcJob::ScanThreadData => self.scan_thread_data(queue, ctx),
            GcJob::ScanFinalizers => finalize::scan_finalizer_entries(self, ctx, queue),
        }
    }

    /// Precisely scan one registered-root table, draining after every
    /// visited slot for locality.
    unsafe fn scan_registered_roots(&self, kind: RootKind, queue: &mut GrayQueue, ctx: &CollectCtx) {
        let records = self.roots().lock().snapshot(kind);
        for (start, record) in records {
            let mut slots: Vec<*mut usize> = Vec::new();
            record
                .descr
                .for_each_ref_slot(start, record.end, &mut |slot| slots.push(slot));
            for slot in slots {
                if slot.read() != 0 {
                    self.copy_object_slot(slot, queue, ctx);
                    self.drain_gray_stack(queue, -1, ctx);
                }
            }
        }
    }

    /// Precise per-thread scanning for threads that registered a marker.
    /// Conservative threads were already covered by the pinning phase.
    unsafe fn scan_thread_data(&self, queue: &mut GrayQueue, ctx: &CollectCtx) {
        if self.config().stack_mark != StackMark::Precise {
            return;
        }
        for info in self.threads().snapshot() {
            if info.skip.load(Ordering::Acquire) {
                continue;
            }
            let Some(mark_func) = info.mark_func() else {
                continue;
            };
            let mut slots: Vec<*mut usize> = Vec::new();
            mark_func(&info, &mut |slot| slots.push(slot));
            for slot in slots {
                if slot.read() != 0 {
                    self.copy_object_slot(slot, queue, ctx);
                    self.drain_gray_stack(queue, -1, ctx);
                }
            }
        }
    }

    /// Stage pin candidates from every pinned-kind root range and every
    /// conservatively scanned thread stack and register snapshot.
    unsafe fn pin_from_roots(&self, pins: &mut PinQueue, heap_lo: usize, heap_hi: usize) {
        let pinned_roots = self.roots().lock().snapshot(RootKind::Pinned);
        for (start, record) in pinned_roots {
            pins.stage_conservative_range(start, record.end, heap_lo, heap_hi);
        }
        let precise_mode = self.config().stack_mark == StackMark::Precise;
        for info in self.threads().snapshot() {
            if info.skip.load(Ordering::Acquire) {
                continue;
            }
            if precise_mode && info.mark_func().is_some() {
                continue;
            }
            let cur = info.stack_cur();
            if cur == 0 || cur >= info.stack_base() {
                continue;
            }
            pins.stage_conservative_range(cur, info.stack_base(), heap_lo, heap_hi);
            for word in info.regs_snapshot() {
                if word >= heap_lo && word < heap_hi {
                    pins.stage(word);
                }
            }
        }
    }

    pub(crate) fn take_unreachable_bridge_candidates(
        &self,
        ctx: &CollectCtx,
        is_bridge: fn(usize) -> bool,
    ) -> Vec<usize> {
        finalize::take_unreachable_bridge_candidates(self, ctx, is_bridge)
    }

    // --- the reachability fixpoint ---------------------------------------

    /// Finish tracing: drain, then run the weak-semantics passes in their
    /// rigid order. The order is what makes ephemeron, finalization and
    /// disappearing-link semantics come out right; do not reorder.
    unsafe fn finish_gray_stack(&self, queue: &mut GrayQueue, ctx: &CollectCtx) {
        self.drain_gray_stack(queue, -1, ctx);

        // Stale bridge data from a previous cycle must not leak into this
        // one (the objects may have moved since).
        weak::bridge_reset_data(self);

        weak::scan_togglerefs(self, ctx, queue);
        self.drain_gray_stack(queue, -1, ctx);

        // Ephemerons before finalization and weak clearing: a value chain
        // may keep keys alive, so iterate to a fixpoint.
        loop {
            let done = weak::mark_ephemerons_in_range(self, ctx, queue);
            self.drain_gray_stack(queue, -1, ctx);
            self.stats().ephemeron_rounds.fetch_add(1, Ordering::Relaxed);
            if done {
                break;
            }
        }

        weak::collect_bridge_objects(self, ctx, queue);
        self.drain_gray_stack(queue, -1, ctx);

        // Non-tracking weak links clear before finalization can promote
        // their referents.
        weak::null_links_in_range(self, ctx, queue, true);
        self.drain_gray_stack(queue, -1, ctx);

        // Promote finalize-ready objects; each round can make more objects
        // ready, so loop until quiescent.
        let mut promotion_loops = 0usize;
        loop {
            let newly_ready = finalize::finalize_in_range(self, ctx, queue);
            self.drain_gray_stack(queue, -1, ctx);
            if newly_ready == 0 {
                break;
            }
            promotion_loops += 1;
        }
        if self.callbacks().bridge_process.is_some() {
            assert!(
                promotion_loops <= 1,
                "bridge processing requires finalization to settle in one pass"
            );
        }

        // Finalization may have revived keys; run ephemerons again.
        loop {
            let done = weak::mark_ephemerons_in_range(self, ctx, queue);
            self.drain_gray_stack(queue, -1, ctx);
            self.stats().ephemeron_rounds.fetch_add(1, Ordering::Relaxed);
            if done {
                break;
            }
        }

        weak::clear_unreachable_ephemerons(self, ctx, queue);

        // Tracking weak links last: their referents had every chance to be
        // resurrected. Updating a live link can trace, so loop to empty.
        loop {
            weak::null_links_in_range(self, ctx, queue, false);
            if queue.is_empty() {
                break;
            }
            self.drain_gray_stack(queue, -1, ctx);
        }

        assert!(queue.is_empty(), "gray stack not empty after the weak passes");
    }

    // --- marking orchestration -------------------------------------------

    /// Run the given jobs, in parallel through the worker pool when
    /// enabled, inline otherwise. The caller's queue seeds the distribute
    /// queue in parallel mode and is drained inline otherwise.
    unsafe fn run_marking(&self, jobs: &[GcJob], queue: &mut GrayQueue, ctx: &CollectCtx) {
        let parallel = ctx.parallel && self.workers().worker_count() > 1;
        if parallel {
            self.workers().start_marking(MarkParams {
                gen: ctx.gen,
                scan_lo: ctx.scan_lo,
                scan_hi: ctx.scan_hi,
            });
            // Seed workers with everything pinned so far.
            while let Some(section) = queue.take_section() {
                self.workers().distribute_section(section);
            }
            if !queue.is_empty() {
                let section: Vec<usize> = std::iter::from_fn(|| queue.dequeue()).collect();
                self.workers().distribute_section(section);
            }
            for &job in jobs {
                self.workers().enqueue_job(job);
            }
            while !self.workers().distribute_is_empty() {
                std::thread::yield_now();
            }
            self.workers().join();
        } else {
            for &job in jobs {
                self.execute_job(job, queue, ctx);
            }
            self.drain_gray_stack(queue, -1, ctx);
        }
    }

    // --- minor collection -------------------------------------------------

    /// Collect the nursery. World must be stopped, GC lock held.
    /// Returns true when a major collection should follow.
    pub(crate) unsafe fn collect_nursery(&self) -> bool {
        let stats = self.stats();
        let cb = self.callbacks();
        let mut timer = PhaseTimer::start();

        stats.minor_gcs.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "start nursery collection {} ({:#x}-{:#x})",
            stats.minor_gcs.load(Ordering::Relaxed),
            self.nursery().start(),
            self.nursery().end()
        );

        if self.config().debug.dump_nursery {
            crate::verify::dump_nursery(self);
        }
        if self.config().debug.verify_nursery {
            crate::verify::verify_nursery_walk(self);
        }
        if self.config().debug.check_at_minor_collections {
            crate::verify::check_consistency(self);
        }

        self.set_degraded(false);
        self.fragments().clear();
        self.major().start_nursery_collection();
        self.try_calculate_minor_collection_allowance(false);

        let ctx = CollectCtx {
            gen: Generation::Nursery,
            scan_lo: self.nursery().start(),
            scan_hi: self.nursery().end(),
            parallel: self.workers().worker_count() > 1,
        };
        let mut queue = GrayQueue::new();

        self.remset().prepare_for_minor_collection(self);
        finalize::process_stage_entries(self);
        weak::process_stage_entries(self);

        // Pinning: gather, sort, dedup, resolve to objects.
        let mut pinned = {
            let mut pins = self.pins().lock();
            pins.clear();
            self.pin_from_roots(&mut pins, self.nursery().start(), self.nursery().end());
            pins.sort_and_dedup();
            let range = pins.find_section_range(self.nursery().start(), self.nursery().end());
            let addrs = pins.slice(range).to_vec();
            pin_objects_from_addresses(&self.nursery().view(), &addrs, cb, &mut queue)
        };
        stats
            .pinned_objects
            .fetch_add(pinned.len() as u64, Ordering::Relaxed);
        if self.config().debug.print_pinning {
            for &obj in &pinned {
                stats
                    .pin_stats
                    .register_object(vtable(obj), safe_object_size(cb, obj));
            }
            stats.pin_stats.print_class_stats("minor");
        }
        timer.lap(&stats.time_minor_pinning_usec);

        self.remset().begin_scan_remsets(self);
        self.run_marking(
            &[
                GcJob::ScanRemsets,
                GcJob::ScanRootsNormal,
                GcJob::ScanRootsWBarrier,
                GcJob::ScanThreadData,
            ],
            &mut queue,
            &ctx,
        );
        timer.lap(&stats.time_minor_scan_roots_usec);

        self.finish_gray_stack(&mut queue, &ctx);
        timer.lap(&stats.time_minor_finish_gray_stack_usec);

        // Objects pinned because promotion ran out of space join the
        // survivor set now.
        let late = std::mem::take(&mut *self.late_pins().lock());
        let had_late_pins = !late.is_empty();
        pinned.extend(late);
        pinned.sort_unstable();
        pinned.dedup();

        let (frags, usable) = build_fragments(self.nursery(), &pinned, cb);
        self.nursery().rebuild_scan_starts(&pinned);
        let pinned_frontier = pinned
            .last()
            .map(|&obj| obj + safe_object_size(cb, obj))
            .unwrap_or(self.nursery().start());
        self.nursery().set_next_data(pinned_frontier);
        stats.fragments_built.store(frags.len(), Ordering::Relaxed);
        self.fragments().install(frags);
        if usable == 0 {
            log::warn!("no usable nursery fragments: entering degraded mode");
            self.set_degraded(true);
        }

        for info in self.threads().snapshot() {
            info.tlab.clear();
        }
        self.pins().lock().clear();
        timer.lap(&stats.time_minor_fragment_creation_usec);

        if self.fin().lock().has_ready() {
            (cb.finalize_notify)();
        }
        self.remset().finish_minor_collection(self);
        self.major().finish_nursery_collection();

        if self.config().debug.check_at_minor_collections {
            crate::verify::check_consistency(self);
        }
        if let Some(path) = &self.config().debug.heap_dump {
            crate::verify::heap_dump(self, path, "minor");
        }

        self.need_major_collection(0) || had_late_pins
    }

    // --- major collection -------------------------------------------------

    /// Major collection with the minor-fallback rules applied. World must
    /// be stopped, GC lock held.
    pub(crate) unsafe fn major_collection(&self, reason: &str) {
        if self.config().debug.disable_major {
            log::debug!("major collections disabled; collecting nursery instead");
            self.collect_nursery();
            return;
        }
        let needs_minor = self.do_major_collection(reason);
        if needs_minor {
            self.collect_nursery();
        }
    }

    /// The major cycle proper. Returns true when promotion failures pinned
    /// objects in the nursery and a minor collection should follow.
    unsafe fn do_major_collection(&self, reason: &str) -> bool {
        let stats = self.stats();
        let cb = self.callbacks();
        let mut timer = PhaseTimer::start();

        stats.major_gcs.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "start major collection {} ({})",
            stats.major_gcs.load(Ordering::Relaxed),
            reason
        );

        // Snapshot the before-collection numbers the allowance needs.
        {
            let mut allowance = self.allowance().lock();
            allowance.last_old_num_major_sections = self.major().sections_used();
            let los_usage = self.los().used_bytes();
            allowance.last_los_memory_alloced =
                los_usage - allowance.last_los_memory_usage.min(los_usage);
            allowance.last_old_los_memory_usage = los_usage;
            allowance.have_swept = false;
            allowance.need_calculate = true;
        }

        self.set_degraded(false);
        self.fragments().clear();
        self.remset().prepare_for_major_collection(self);
        finalize::process_stage_entries(self);
        weak::process_stage_entries(self);
        self.major().start_major_collection();

        let heap_lo = self.bounds().lowest();
        let heap_hi = self.bounds().highest();
        let ctx = CollectCtx {
            gen: Generation::Old,
            scan_lo: heap_lo,
            scan_hi: heap_hi,
            parallel: self.workers().worker_count() > 1 && self.major().is_parallel(),
        };
        let mut queue = GrayQueue::new();

        // Pin over the whole heap, large objects included.
        let mut nursery_pinned = {
            let mut pins = self.pins().lock();
            pins.clear();
            self.pin_from_roots(&mut pins, heap_lo, heap_hi);
            pins.sort_and_dedup();

            let nursery_range =
                pins.find_section_range(self.nursery().start(), self.nursery().end());
            let nursery_addrs = pins.slice(nursery_range).to_vec();
            let nursery_pinned =
                pin_objects_from_addresses(&self.nursery().view(), &nursery_addrs, cb, &mut queue);

            let tally_pins = self.config().debug.print_pinning;
            let (major_lo, major_hi) = self.major().heap_range();
            let mut major_pinned = 0usize;
            let mut los_pinned = 0usize;
            for &addr in pins.as_slice() {
                if self.nursery().contains(addr) {
                    continue;
                }
                if addr >= major_lo && addr < major_hi {
                    if let Some(obj) = self.major().pin_object_at(addr, &mut queue, cb) {
                        major_pinned += 1;
                        if tally_pins {
                            stats
                                .pin_stats
                                .register_object(vtable(obj), safe_object_size(cb, obj));
                        }
                    }
                } else if let Some(obj) = self.los().pin_address(addr) {
                    queue.enqueue(obj);
                    los_pinned += 1;
                    if tally_pins {
                        stats
                            .pin_stats
                            .register_object(vtable(obj), safe_object_size(cb, obj));
                    }
                }
            }
            stats.pinned_objects.fetch_add(
                (nursery_pinned.len() + major_pinned + los_pinned) as u64,
                Ordering::Relaxed,
            );
            if tally_pins {
                for &obj in &nursery_pinned {
                    stats
                        .pin_stats
                        .register_object(vtable(obj), safe_object_size(cb, obj));
                }
                stats.pin_stats.print_class_stats("major");
            }
            nursery_pinned
        };
        timer.lap(&stats.time_major_pinning_usec);

        self.run_marking(
            &[
                GcJob::ScanRootsNormal,
                GcJob::ScanRootsWBarrier,
                GcJob::ScanThreadData,
                GcJob::ScanFinalizers,
            ],
            &mut queue,
            &ctx,
        );
        timer.lap(&stats.time_major_scan_roots_usec);

        self.finish_gray_stack(&mut queue, &ctx);
        timer.lap(&stats.time_major_finish_gray_stack_usec);

        // Sweep: large objects first (they only depend on pin tags), then
        // the backend.
        self.los().sweep();
        self.major().sweep(cb, self.config().debug.clear_at_gc);
        timer.lap(&stats.time_major_sweep_usec);

        // Nursery epilogue, exactly as after a minor collection.
        let late = std::mem::take(&mut *self.late_pins().lock());
        let had_late_pins = !late.is_empty();
        nursery_pinned.extend(late);
        nursery_pinned.sort_unstable();
        nursery_pinned.dedup();
        let (frags, usable) = build_fragments(self.nursery(), &nursery_pinned, cb);
        self.nursery().rebuild_scan_starts(&nursery_pinned);
        let pinned_frontier = nursery_pinned
            .last()
            .map(|&obj| obj + safe_object_size(cb, obj))
            .unwrap_or(self.nursery().start());
        self.nursery().set_next_data(pinned_frontier);
        stats.fragments_built.store(frags.len(), Ordering::Relaxed);
        self.fragments().install(frags);
        if usable == 0 {
            self.set_degraded(true);
        }
        for info in self.threads().snapshot() {
            info.tlab.clear();
        }
        self.pins().lock().clear();

        // Settle accounting: sweep results feed the next allowance.
        {
            let mut allowance = self.allowance().lock();
            allowance.last_los_memory_usage = self.los().used_bytes();
            allowance.have_swept = true;
        }
        self.try_calculate_minor_collection_allowance(true);
        self.major().reset_sections_alloced();
        self.los().reset_alloced();
        self.major().finish_major_collection();

        if self.fin().lock().has_ready() {
            (cb.finalize_notify)();
        }
        if let Some(path) = &self.config().debug.heap_dump {
            crate::verify::heap_dump(self, path, "major");
        }

        had_late_pins
    }

    // --- allowance & triggers ---------------------------------------------

    /// Recompute the minor-collection allowance from the space the last
    /// major collection saved versus the space allocated since, clamped
    /// into `[minimum, soft limit headroom]`.
    pub(crate) fn try_calculate_minor_collection_allowance(&self, overwrite: bool) {
        let mut allowance = self.allowance().lock();
        if overwrite {
            debug_assert!(allowance.need_calculate);
        }
        if !allowance.need_calculate {
            return;
        }
        let min_allowance = self.min_allowance();
        if !allowance.have_swept {
            if overwrite {
                allowance.minor_collection_allowance = min_allowance;
            }
            return;
        }

        let section_size = self.major().section_size();
        let num_major_sections = self.major().sections_used();
        let sections_saved = allowance
            .last_old_num_major_sections
            .saturating_sub(num_major_sections);
        let los_saved = allowance
            .last_old_los_memory_usage
            .saturating_sub(allowance.last_los_memory_usage)
            .max(1);

        let new_major = num_major_sections * section_size;
        let new_heap_size = new_major + allowance.last_los_memory_usage;
        let save_target = (new_major + los_saved) / 2;

        // Allow allocating as much as should reclaim save_target in the
        // next cycle, assuming the ratio of the previous cycle holds:
        //
        //    sections_saved          save_target
        //  ------------------  ==  ----------------
        //  sections_alloced        allowance_target
        let alloced = self.major().sections_alloced_since_reset() * section_size
            + allowance.last_los_memory_alloced;
        let reclaimed = sections_saved * section_size + los_saved;
        let allowance_target = (save_target as f64 * alloced as f64 / reclaimed as f64) as usize;

        let cap = num_major_sections * section_size + self.los().used_bytes();
        let mut value = allowance_target.min(cap).max(min_allowance);

        let soft_limit = self.config().soft_heap_limit;
        if new_heap_size + value > soft_limit {
            value = if new_heap_size > soft_limit {
                min_allowance
            } else {
                (soft_limit - new_heap_size).max(min_allowance)
            };
        }
        allowance.minor_collection_allowance = value;
        allowance.need_calculate = false;

        if self.config().debug.print_allowance {
            log::info!(
                "heap after collection: {} bytes ({} major, {} LOS); allowance {} bytes",
                new_heap_size,
                new_major,
                allowance.last_los_memory_usage,
                value
            );
        }
    }

    /// Should the next collection be (or be followed by) a major one?
    pub(crate) fn need_major_collection(&self, space_needed: usize) -> bool {
        let allowance = self.allowance().lock();
        let los_usage = self.los().used_bytes();
        let los_alloced = los_usage - allowance.last_los_memory_usage.min(los_usage);
        let available = self.major().sections_free() * self.major().section_size();
        space_needed > available
            || self.major().sections_alloced_since_reset() * self.major().section_size()
                + los_alloced
                > allowance.minor_collection_allowance
    }
}
