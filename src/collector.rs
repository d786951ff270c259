//! The collector context and embedding API.
//!
//! One [`Collector`] owns the nursery, the old-generation backend, the
//! remembered set, the registries and the worker pool. Instances are
//! independent; a process-wide singleton (guarded by a tri-state
//! initialization flag so racing initializers are safe) serves hosts that
//! want the classic global surface.

use crate::alloc::fragment::FragmentAllocator;
use crate::collect::AllowanceState;
use crate::config::{GcConfig, WriteBarrierKind};
use crate::error::{GcError, Result};
use crate::finalize::{self, FinalizeState};
use crate::los::LargeObjectStore;
use crate::major::{create_backend, MajorBackend};
use crate::memory::HeapBounds;
use crate::nursery::NurserySection;
use crate::object::{Descriptor, RuntimeCallbacks};
use crate::pin::PinQueue;
use crate::remset::{self, cards::CardTableRemset, ssb::SsbRemset, RemsetBackend};
use crate::roots::{RootKind, RootTables};
use crate::stats::GcStats;
use crate::threads::{ThreadInfo, ThreadMarkFn, ThreadRegistry};
use crate::weak::{self, WeakState};
use crate::workers::WorkerPool;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct Collector {
    config: GcConfig,
    callbacks: RuntimeCallbacks,
    stats: GcStats,
    bounds: HeapBounds,

    nursery: NurserySection,
    fragments: FragmentAllocator,
    major: Box<dyn MajorBackend>,
    remset: Box<dyn RemsetBackend>,
    los: LargeObjectStore,

    roots: Mutex<RootTables>,
    threads: ThreadRegistry,
    fin: Mutex<FinalizeState>,
    weak: Mutex<WeakState>,
    pins: Mutex<PinQueue>,
    late_pins: Mutex<Vec<usize>>,
    allowance: Mutex<AllowanceState>,
    workers: Arc<WorkerPool>,

    /// Serializes collections and registry mutation. Non-reentrant.
    gc_lock: Mutex<()>,
    /// Held from world stop to restart; blocks mutator APIs that cannot
    /// run during a pause.
    interruption_lock: Mutex<()>,

    collecting: AtomicBool,
    degraded: AtomicBool,
    disabled: AtomicUsize,
    alloc_counter: AtomicU64,
}

impl Collector {
    /// Build a collector from a validated configuration and the host's
    /// callback record.
    pub fn new(config: GcConfig, callbacks: RuntimeCallbacks) -> Result<Arc<Self>> {
        config.validate()?;
        let mut config = config;
        if config.debug.xdomain_checks {
            log::warn!("xdomain-checks needs domain callbacks this collector does not consume");
        }

        let nursery = NurserySection::new(config.nursery_size)?;
        let major = create_backend(&config)?;
        let remset: Box<dyn RemsetBackend> = match config.wbarrier {
            WriteBarrierKind::Remset => Box::new(SsbRemset::new()),
            WriteBarrierKind::CardTable => {
                if major.supports_card_table() {
                    let (lo, hi) = major.heap_range();
                    Box::new(CardTableRemset::new(lo, hi))
                } else {
                    log::warn!(
                        "major backend `{}` cannot back a card table; falling back to remset",
                        major.name()
                    );
                    config.wbarrier = WriteBarrierKind::Remset;
                    Box::new(SsbRemset::new())
                }
            }
        };

        let bounds = HeapBounds::new();
        bounds.update(nursery.start(), nursery.end());
        let (major_lo, major_hi) = major.heap_range();
        bounds.update(major_lo, major_hi);

        let min_allowance = 4 * config.nursery_size;
        let workers = Arc::new(WorkerPool::new(config.workers));
        let threads = ThreadRegistry::new(remset::ssb::STORE_BUFFER_CAPACITY);

        let collector = Arc::new(Self {
            config,
            callbacks,
            stats: GcStats::new(),
            bounds,
            nursery,
            fragments: FragmentAllocator::new(),
            major,
            remset,
            los: LargeObjectStore::new(),
            roots: Mutex::new(RootTables::new()),
            threads,
            fin: Mutex::new(FinalizeState::new()),
            weak: Mutex::new(WeakState::new()),
            pins: Mutex::new(PinQueue::new()),
            late_pins: Mutex::new(Vec::new()),
            allowance: Mutex::new(AllowanceState::new(min_allowance)),
            workers: workers.clone(),
            gc_lock: Mutex::new(()),
            interruption_lock: Mutex::new(()),
            collecting: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            disabled: AtomicUsize::new(0),
            alloc_counter: AtomicU64::new(0),
        });

        // The nursery starts as one fragment spanning its whole extent.
        collector.fragments.install(vec![crate::alloc::fragment::Fragment {
            start: collector.nursery.start(),
            next: collector.nursery.start(),
            end: collector.nursery.end(),
        }]);

        workers.start(&collector);
        log::info!(
            "collector initialized: {} nursery, major={}, wbarrier={}, {} workers",
            collector.config.nursery_size,
            collector.major.name(),
            collector.remset.name(),
            collector.workers.worker_count()
        );
        Ok(collector)
    }

    // --- crate-internal accessors ----------------------------------------

    pub(crate) fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub(crate) fn nursery(&self) -> &NurserySection {
        &self.nursery
    }

    pub(crate) fn fragments(&self) -> &FragmentAllocator {
        &self.fragments
    }

    pub(crate) fn major(&self) -> &dyn MajorBackend {
        self.major.as_ref()
    }

    pub(crate) fn remset(&self) -> &dyn RemsetBackend {
        self.remset.as_ref()
    }

    pub(crate) fn los(&self) -> &LargeObjectStore {
        &self.los
    }

    pub(crate) fn callbacks(&self) -> &RuntimeCallbacks {
        &self.callbacks
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub(crate) fn bounds(&self) -> &HeapBounds {
        &self.bounds
    }

    pub(crate) fn roots(&self) -> &Mutex<RootTables> {
        &self.roots
    }

    pub(crate) fn fin(&self) -> &Mutex<FinalizeState> {
        &self.fin
    }

    pub(crate) fn weak(&self) -> &Mutex<WeakState> {
        &self.weak
    }

    pub(crate) fn pins(&self) -> &Mutex<PinQueue> {
        &self.pins
    }

    pub(crate) fn late_pins(&self) -> &Mutex<Vec<usize>> {
        &self.late_pins
    }

    pub(crate) fn allowance(&self) -> &Mutex<AllowanceState> {
        &self.allowance
    }

    pub(crate) fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub(crate) fn interruption_lock(&self) -> &Mutex<()> {
        &self.interruption_lock
    }

    pub(crate) fn lock_gc(&self) -> MutexGuard<'_, ()> {
        self.gc_lock.lock()
    }

    /// Take the GC lock from a mutator context. Parks at the safepoint
    /// while contending so a concurrent world stop is never deadlocked on
    /// this thread's acknowledgement.
    pub(crate) fn lock_gc_polling(&self, info: &ThreadInfo) -> MutexGuard<'_, ()> {
        loop {
            if let Some(guard) = self.gc_lock.try_lock() {
                return guard;
            }
            self.threads.safepoint(info);
            std::thread::yield_now();
        }
    }

    /// GC lock acquisition that stays safepoint-responsive when the
    /// calling thread is a registered mutator.
    pub(crate) fn lock_gc_from_mutator(&self) -> MutexGuard<'_, ()> {
        match self.threads.current() {
            Some(info) => self.lock_gc_polling(&info),
            None => self.lock_gc(),
        }
    }

    pub(crate) fn alloc_counter(&self) -> &AtomicU64 {
        &self.alloc_counter
    }

    pub(crate) fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    pub(crate) fn set_collecting(&self, value: bool) {
        self.collecting.store(value, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, value: bool) {
        self.degraded.store(value, Ordering::Release);
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire) > 0
    }

    // --- thread management -----------------------------------------------

    /// Register the calling thread as a mutator. Must precede any
    /// allocation or barrier call from this thread.
    pub fn register_thread(
        &self,
        stack_base: usize,
        mark_func: Option<ThreadMarkFn>,
    ) -> Arc<ThreadInfo> {
        // Taking the suspend lock keeps registration out of an in-flight
        // world stop.
        let _suspend = self.threads.suspend_lock.lock();
        let info = self.threads.register_current(stack_base, mark_func);
        self.remset.register_thread(&info);
        info
    }

    /// Unregister the calling thread, flushing its collector state. Parks
    /// first if a world stop is pending.
    pub fn unregister_thread(&self) {
        if let Some(info) = self.threads.current() {
            self.threads.safepoint(&info);
        }
        if let Some(info) = self.threads.unregister_current() {
            self.remset.cleanup_thread(self, &info);
        }
    }

    /// Cooperative safepoint for the calling thread.
    pub fn safepoint(&self) {
        if let Some(info) = self.threads.current() {
            self.threads.safepoint(&info);
        }
    }

    // --- allocation -------------------------------------------------------

    /// Allocate `size` zeroed bytes with the given vtable word installed.
    pub fn alloc(&self, size: usize, vtable: usize) -> Result<usize> {
        self.allocate_inner(vtable, size, false)
    }

    /// Allocate an object that will never move.
    pub fn alloc_pinned(&self, size: usize, vtable: usize) -> Result<usize> {
        self.allocate_inner(vtable, size, true)
    }

    /// Allocate an array of `count` elements; the byte size comes from the
    /// host's `array_byte_size` callback.
    pub fn alloc_array(&self, vtable: usize, count: usize) -> Result<usize> {
        let size = (self.callbacks.array_byte_size)(vtable, count);
        self.allocate_inner(vtable, size, false)
    }

    // --- roots ------------------------------------------------------------

    /// Register `[start, start + size)` as a root range. With a
    /// descriptor the range is scanned precisely; without one it is
    /// scanned conservatively and its referents are pinned.
    pub fn register_root(&self, start: usize, size: usize, descr: Option<Descriptor>) {
        let _gc = self.lock_gc_from_mutator();
        match descr {
            Some(descr) => self
                .roots
                .lock()
                .register(start, size, descr, RootKind::Normal),
            None => self
                .roots
                .lock()
                .register(start, size, Descriptor::EMPTY, RootKind::Pinned),
        }
    }

    /// Register a precise root range whose stores are covered by the
    /// write barrier.
    pub fn register_root_wbarrier(&self, start: usize, size: usize, descr: Descriptor) {
        let _gc = self.lock_gc_from_mutator();
        self.roots
            .lock()
            .register(start, size, descr, RootKind::WBarrier);
    }

    pub fn deregister_root(&self, start: usize) {
        let _gc = self.lock_gc_from_mutator();
        self.roots.lock().deregister(start);
    }

    // --- write barriers ---------------------------------------------------

    /// `*field_slot = value` with barrier.
    ///
    /// # Safety
    /// `field_slot` must be a live reference slot inside `obj`.
    pub unsafe fn wbarrier_set_field(&self, _obj: usize, field_slot: usize, value: usize) {
        self.barrier_store(field_slot, value);
    }

    /// `*slot = value` for an array element, with barrier.
    ///
    /// # Safety
    /// `slot` must be a live element slot inside `arr`.
    pub unsafe fn wbarrier_set_arrayref(&self, _arr: usize, slot: usize, value: usize) {
        self.barrier_store(slot, value);
    }

    /// Generic `*slot = value` with barrier.
    ///
    /// # Safety
    /// `slot` must be a live, word-aligned reference slot.
    pub unsafe fn wbarrier_generic_store(&self, slot: usize, value: usize) {
        self.barrier_store(slot, value);
    }

    /// Barrier for a reference store that already happened.
    ///
    /// # Safety
    /// `slot` must be a live, word-aligned reference slot.
    pub unsafe fn wbarrier_generic_nostore(&self, slot: usize) {
        match self.threads.current() {
            Some(info) => remset::generic_nostore(self, &info, slot),
            None => self.record_unregistered(slot),
        }
    }

    /// Copy `count` reference slots with destination barriers.
    ///
    /// # Safety
    /// Both ranges must be live reference-slot arrays of `count` slots.
    pub unsafe fn wbarrier_arrayref_copy(&self, dst: usize, src: usize, count: usize) {
        if let Some(info) = self.threads.current() {
            remset::arrayref_copy(self, &info, dst, src, count);
        } else {
            let _gc_guard = if count > remset::LARGE_COPY_SLOTS {
                Some(self.lock_gc())
            } else {
                None
            };
            std::ptr::copy(src as *const usize, dst as *mut usize, count);
            for i in 0..count {
                self.record_unregistered(dst + i * crate::object::WORD_SIZE);
            }
        }
    }

    /// Copy `count` value-type elements with destination barriers.
    ///
    /// # Safety
    /// Ranges must be live arrays of `count` elements described by
    /// `elem_vtable`.
    pub unsafe fn wbarrier_value_copy(
        &self,
        dst: usize,
        src: usize,
        count: usize,
        elem_vtable: usize,
    ) {
        if let Some(info) = self.threads.current() {
            remset::value_copy(self, &info, dst, src, count, elem_vtable);
            return;
        }
        // Unregistered caller: the copy still has to happen; interesting
        // slots go to the global remembered set.
        let elem_size = (self.callbacks.value_size)(elem_vtable);
        let descr = (self.callbacks.reference_bitmap)(elem_vtable);
        let _gc_guard = if count * elem_size / crate::object::WORD_SIZE > remset::LARGE_COPY_SLOTS {
            Some(self.lock_gc())
        } else {
            None
        };
        std::ptr::copy(src as *const u8, dst as *mut u8, count * elem_size);
        if !descr.has_references() || self.nursery.contains(dst) {
            return;
        }
        for i in 0..count {
            let elem = dst + i * elem_size;
            descr.for_each_ref_slot(elem, elem + elem_size, &mut |slot| {
                self.record_unregistered(slot as usize);
            });
        }
    }

    /// Copy a whole object's payload with destination barriers.
    ///
    /// # Safety
    /// Both objects must be live and of the same class.
    pub unsafe fn wbarrier_object_copy(&self, dst_obj: usize, src_obj: usize) {
        if let Some(info) = self.threads.current() {
            remset::object_copy(self, &info, dst_obj, src_obj);
            return;
        }
        // Unregistered caller: same contract as the registered path.
        use crate::object::header::HEADER_SIZE;
        let size = crate::object::safe_object_size(&self.callbacks, src_obj);
        std::ptr::copy(
            (src_obj + HEADER_SIZE) as *const u8,
            (dst_obj + HEADER_SIZE) as *mut u8,
            size - HEADER_SIZE,
        );
        if self.nursery.contains(dst_obj) {
            return;
        }
        let descr = (self.callbacks.reference_bitmap)(crate::object::vtable(dst_obj));
        if !descr.has_references() {
            return;
        }
        descr.for_each_ref_slot(dst_obj + HEADER_SIZE, dst_obj + size, &mut |slot| {
            self.record_unregistered(slot as usize);
        });
    }

    unsafe fn barrier_store(&self, slot: usize, value: usize) {
        match self.threads.current() {
            Some(info) => remset::generic_store(self, &info, slot, value),
            None => {
                (slot as *mut usize).write_volatile(value);
                if self.nursery.contains(value) {
                    self.record_unregistered(slot);
                }
            }
        }
    }

    unsafe fn record_unregistered(&self, slot: usize) {
        let value = (slot as *const usize).read_volatile();
        if value != 0 && self.nursery.contains(value) && !self.nursery.contains(slot) {
            self.remset.record_global(slot);
        }
    }

    // --- finalization & weak references ------------------------------------

    pub fn register_finalizer(&self, obj: usize) {
        finalize::register_finalizer(self, obj, true);
    }

    pub fn unregister_finalizer(&self, obj: usize) {
        finalize::register_finalizer(self, obj, false);
    }

    /// Drain the fin-ready lists; returns how many finalizers ran.
    pub fn run_finalizers(&self) -> usize {
        finalize::run_finalizers(self)
    }

    /// Point the weak cell at `slot` to `obj`. `track` keeps the link
    /// alive through finalizer resurrection.
    pub fn weak_link_add(&self, slot: usize, obj: usize, track: bool) {
        weak::register_disappearing_link(self, slot, obj, track);
    }

    pub fn weak_link_remove(&self, slot: usize) {
        weak::register_disappearing_link(self, slot, 0, false);
    }

    /// Read a weak cell; 0 once the referent died.
    pub fn weak_link_get(&self, slot: usize) -> usize {
        weak::read_disappearing_link(slot)
    }

    pub fn ephemeron_array_add(&self, array: usize) {
        weak::register_ephemeron_array(self, array);
    }

    pub fn register_toggleref(&self, obj: usize) {
        weak::register_toggleref(self, obj);
    }

    /// The tombstone written into dead ephemeron key slots.
    pub fn ephemeron_tombstone(&self) -> usize {
        crate::object::ephemeron_tombstone()
    }

    // --- collection control -----------------------------------------------

    /// Collect generation 0 (nursery) or 1 (whole heap).
    pub fn collect(&self, generation: u32) {
        if self.is_disabled() {
            return;
        }
        let _gc = self.lock_gc_from_mutator();
        self.set_collecting(true);
        let generation = generation.min(1);
        let session = self.stop_world(generation);
        unsafe {
            if generation == 0 {
                if !self.config.debug.disable_minor {
                    self.collect_nursery();
                }
            } else {
                self.major_collection("explicit");
            }
        }
        self.restart_world(generation, session);
        self.set_collecting(false);
    }

    pub fn max_generation(&self) -> u32 {
        1
    }

    pub fn collection_count(&self, generation: u32) -> u64 {
        if generation == 0 {
            self.stats.minor_gcs.load(Ordering::Relaxed)
        } else {
            self.stats.major_gcs.load(Ordering::Relaxed)
        }
    }

    /// Bytes currently considered in use across all spaces.
    pub fn used_size(&self) -> usize {
        let nursery_used = self.nursery.size() - self.fragments.total_free();
        nursery_used + self.major.used_bytes() + self.los.used_bytes()
    }

    /// Bytes of address space currently backing the heap.
    pub fn heap_size(&self) -> usize {
        self.nursery.size()
            + self.major.sections_used() * self.major.section_size()
            + self.los.used_bytes()
    }

    /// Suppress collections until [`Collector::enable`]. Nested calls
    /// stack.
    pub fn disable(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enable(&self) {
        let previous = self.disabled.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "enable() without matching disable()");
    }

    // --- inline-emitter constants ------------------------------------------

    /// Nursery base and shift for inline membership tests:
    /// `ptr >> bits == base >> bits`.
    pub fn nursery_base_and_bits(&self) -> (usize, u32) {
        (self.nursery.start(), self.nursery.bits())
    }

    /// Card table base and covered range, when the card barrier is active.
    pub fn card_table_info(&self) -> Option<(usize, usize, usize)> {
        self.remset.card_table_info()
    }

    /// Per-thread store buffer capacity, for inline push fast paths.
    pub fn store_buffer_capacity(&self) -> usize {
        remset::ssb::STORE_BUFFER_CAPACITY
    }

    // --- debug inspection ---------------------------------------------------

    /// Number of nursery fragments after the last rebuild.
    pub fn nursery_fragment_count(&self) -> usize {
        self.fragments.count()
    }

    /// Largest allocation the nursery can currently serve.
    pub fn nursery_max_available(&self) -> usize {
        self.fragments.max_available()
    }

    /// Walk the nursery and count live (non-filler) objects. Outside of a
    /// collection this includes everything allocated since the last one.
    pub fn count_nursery_objects(&self) -> usize {
        let _gc = self.lock_gc_from_mutator();
        let mut count = 0usize;
        unsafe {
            crate::verify::walk_nursery(self, self.nursery.end(), &mut |_obj, _size, filler| {
                if !filler {
                    count += 1;
                }
            });
        }
        count
    }

    /// Run the heap consistency checker (also used by the
    /// `check-at-minor-collections` debug flag).
    pub fn check_consistency(&self) {
        let _gc = self.lock_gc_from_mutator();
        unsafe { crate::verify::check_consistency(self) };
    }

    /// Verify the nursery walk and scan-start table.
    pub fn verify_nursery(&self) {
        let _gc = self.lock_gc_from_mutator();
        unsafe { crate::verify::verify_nursery_walk(self) };
    }

    /// Count old-generation objects.
    pub fn count_major_objects(&self) -> usize {
        let mut count = 0usize;
        self.major
            .iterate_objects(true, true, &self.callbacks, &mut |_obj, _size| count += 1);
        count
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.workers.shutdown();
    }
}

// --- process-wide context -------------------------------------------------

const INIT_NONE: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_DONE: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_NONE);

lazy_static::lazy_static! {
    static ref GLOBAL_COLLECTOR: Mutex<Option<Arc<Collector>>> = Mutex::new(None);
}

/// Initialize (or fetch) the process-wide collector. Idempotent under
/// racing callers: exactly one builds the collector, the rest spin until
/// it is published.
pub fn init_global(config: GcConfig, callbacks: RuntimeCallbacks) -> Result<Arc<Collector>> {
    loop {
        match INIT_STATE.compare_exchange(
            INIT_NONE,
            INIT_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => match Collector::new(config, callbacks) {
                Ok(collector) => {
                    *GLOBAL_COLLECTOR.lock() = Some(collector.clone());
                    INIT_STATE.store(INIT_DONE, Ordering::Release);
                    return Ok(collector);
                }
                Err(err) => {
                    INIT_STATE.store(INIT_NONE, Ordering::Release);
                    return Err(err);
                }
            },
            Err(INIT_DONE) => {
                return GLOBAL_COLLECTOR
                    .lock()
                    .clone()
                    .ok_or_else(|| GcError::HeapInitialization("global collector vanished".into()));
            }
            Err(_) => std::hint::spin_loop(),
        }
    }
}

/// The process-wide collector, if one has been initialized.
pub fn global() -> Option<Arc<Collector>> {
    if INIT_STATE.load(Ordering::Acquire) != INIT_DONE {
        return None;
    }
    GLOBAL_COLLECTOR.lock().clone()
}
