//! Allocation entry paths.
//!
//! The fast path is a TLAB bump. On exhaustion the TLAB refills from the
//! nursery fragment list; when the nursery itself is exhausted the thread
//! stops the world for a minor collection (possibly escalating to a major
//! one), and if even that cannot make room the collector enters degraded
//! mode, serving mutators from the old generation until the next major
//! collection.
//!
//! Memory handed to the mutator is always zeroed except for the vtable
//! word written here; no post-allocation clearing is allowed anywhere.

pub mod fragment;
pub mod tlab;

use crate::collector::Collector;
use crate::config::{ALLOC_ALIGN, MAX_SMALL_OBJ_SIZE};
use crate::error::{GcError, Result};
use crate::object::header::MIN_OBJ_SIZE;
use crate::object::{align_up, set_vtable};
use crate::threads::ThreadInfo;
use std::sync::atomic::Ordering;

impl Collector {
    pub(crate) fn allocate_inner(&self, vtable: usize, size: usize, pinned: bool) -> Result<usize> {
        let size = align_up(size.max(MIN_OBJ_SIZE), ALLOC_ALIGN);

        if let Some(every) = self.config().debug.collect_before_allocs {
            let count = self.alloc_counter().fetch_add(1, Ordering::Relaxed) + 1;
            if count % every == 0 && !self.is_disabled() {
                self.collect(0);
            }
        }

        // Large and pinned objects go to the non-moving store.
        if pinned || size > MAX_SMALL_OBJ_SIZE {
            return self.los().alloc(vtable, size, self.bounds());
        }

        let info = self
            .threads()
            .current()
            .ok_or(GcError::ThreadNotRegistered)?;
        self.threads().safepoint(&info);

        info.in_managed_allocator.store(true, Ordering::Release);
        let result = self.allocate_small(&info, vtable, size);
        info.in_managed_allocator.store(false, Ordering::Release);
        result
    }

    fn allocate_small(&self, info: &ThreadInfo, vtable: usize, size: usize) -> Result<usize> {
        let mut collect_attempts = 0usize;
        loop {
            if self.is_degraded() {
                return self.allocate_degraded(vtable, size, &mut collect_attempts);
            }

            if let Some(obj) = info.tlab.alloc(size, self.nursery()) {
                unsafe { set_vtable(obj, vtable) };
                return Ok(obj);
            }

            // Objects around the buffer size would waste most of a fresh
            // TLAB; serve them straight from a fragment.
            if size > self.config().tlab_size / 2 {
                if let Some((start, _end)) = self.fragments().alloc_range(size, size) {
                    self.nursery().record_scan_start(start);
                    self.nursery().update_next_data(start + size);
                    unsafe { set_vtable(start, vtable) };
                    return Ok(start);
                }
            } else if let Some((start, end)) = self
                .fragments()
                .alloc_range(size, self.config().tlab_size)
            {
                info.tlab.install(start, end, self.nursery());
                self.nursery().update_next_data(end);
                continue;
            }

            // Nursery exhausted.
            if self.is_disabled() {
                return self.allocate_degraded(vtable, size, &mut collect_attempts);
            }
            if collect_attempts >= 2 {
                return Err(GcError::OutOfMemory {
                    requested: size,
                    available: self.fragments().total_free(),
                });
            }
            collect_attempts += 1;

            // The collection must not see us as parked inside the
            // allocator: we are the thread driving it.
            info.in_managed_allocator.store(false, Ordering::Release);
            self.minor_collect_or_expand(size);
            info.in_managed_allocator.store(true, Ordering::Release);
        }
    }

    /// Degraded-mode allocation: served by the old generation. One forced
    /// major collection and one retry before reporting out of memory.
    fn allocate_degraded(
        &self,
        vtable: usize,
        size: usize,
        collect_attempts: &mut usize,
    ) -> Result<usize> {
        loop {
            if let Some(obj) = self.major().alloc_small(size) {
                unsafe { set_vtable(obj, vtable) };
                self.stats()
                    .objects_alloced_degraded
                    .fetch_add(1, Ordering::Relaxed);
                self.stats()
                    .bytes_alloced_degraded
                    .fetch_add(size as u64, Ordering::Relaxed);
                return Ok(obj);
            }
            if *collect_attempts >= 2 || self.is_disabled() {
                return Err(GcError::OutOfMemory {
                    requested: size,
                    available: self.major().sections_free() * self.major().section_size(),
                });
            }
            *collect_attempts += 1;
            self.collect(1);
        }
    }

    /// Stop the world and collect the nursery because an allocation of
    /// `size` bytes could not be satisfied; escalate to a major collection
    /// when the minor one signals overflow, and fall into degraded mode
    /// when even that does not make room.
    pub(crate) fn minor_collect_or_expand(&self, size: usize) {
        let _gc = self.lock_gc_from_mutator();
        self.set_collecting(true);
        let session = self.stop_world(0);
        unsafe {
            let needs_major = if self.config().debug.disable_minor {
                true
            } else {
                self.collect_nursery()
            };
            if needs_major || self.need_major_collection(size) {
                self.major_collection("minor overflow");
            }
        }
        if !self.can_alloc_size(size) {
            log::debug!(
                "nursery collection did not find room for a {} byte allocation",
                size
            );
            self.set_degraded(true);
        }
        self.restart_world(0, session);
        self.set_collecting(false);
    }

    fn can_alloc_size(&self, size: usize) -> bool {
        self.fragments().max_available() >= size
    }
}
