//! Finalization: registration, readiness promotion, and the drain API.
//!
//! Objects registered for finalization live in a table keyed by address.
//! When a collection finds a registered object unreachable, the object is
//! promoted (it must survive long enough for its finalizer to run) and
//! moved to a fin-ready list — ordinary or critical, depending on the
//! class. The host's finalizer thread drains the ready lists outside
//! stop-the-world through [`run_finalizers`]; each entry is unlinked under
//! the GC lock before its callback fires, so a finalizer runs exactly once.
//!
//! Registrations racing a collection are staged and merged at the start of
//! the next cycle.

use crate::collect::CollectCtx;
use crate::collector::Collector;
use crate::gray::GrayQueue;
use crate::object::vtable;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct StagedFinalizer {
    obj: usize,
    register: bool,
}

#[derive(Default)]
pub struct FinalizeState {
    /// Registered finalizable objects; the value is the critical flag.
    registered: IndexMap<usize, bool>,
    fin_ready: VecDeque<usize>,
    critical_ready: VecDeque<usize>,
    staged: Vec<StagedFinalizer>,
}

impl FinalizeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn ready_count(&self) -> usize {
        self.fin_ready.len() + self.critical_ready.len()
    }

    pub fn has_ready(&self) -> bool {
        !self.fin_ready.is_empty() || !self.critical_ready.is_empty()
    }
}

/// Register (or with `register == false`, cancel) finalization for `obj`.
/// Stages the request when a collection is in progress.
pub(crate) fn register_finalizer(collector: &Collector, obj: usize, register: bool) {
    let critical = (collector.callbacks().is_critical_finalizer)(unsafe { vtable(obj) });
    let mut state = collector.fin().lock();
    if collector.is_collecting() {
        state.staged.push(StagedFinalizer { obj, register });
        return;
    }
    if register {
        state.registered.insert(obj, critical);
    } else {
        state.registered.shift_remove(&obj);
    }
}

/// Merge staged registrations. Runs early in every collection.
pub(crate) fn process_stage_entries(collector: &Collector) {
    let mut state = collector.fin().lock();
    let staged = std::mem::take(&mut state.staged);
    for entry in staged {
        let critical =
            (collector.callbacks().is_critical_finalizer)(unsafe { vtable(entry.obj) });
        if entry.register {
            state.registered.insert(entry.obj, critical);
        } else {
            state.registered.shift_remove(&entry.obj);
        }
    }
}

/// One round of the finalizer promotion loop: move every registered object
/// that is not reachable to the fin-ready lists, promoting it (and thereby
/// everything it references). Returns how many objects became ready.
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn finalize_in_range(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) -> usize {
    let mut state = collector.fin().lock();
    let entries: Vec<(usize, bool)> = state.registered.iter().map(|(&o, &c)| (o, c)).collect();
    let mut newly_ready = 0usize;

    for (obj, critical) in entries {
        if collector.object_is_live(obj, ctx) {
            // Survivors that moved must be re-keyed to their new address.
            if let Some(new_addr) = crate::object::forwarding_address(obj) {
                state.registered.shift_remove(&obj);
                state.registered.insert(new_addr, critical);
            }
            continue;
        }
        let mut addr = obj;
        collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
        state.registered.shift_remove(&obj);
        if critical {
            state.critical_ready.push_back(addr);
        } else {
            state.fin_ready.push_back(addr);
        }
        newly_ready += 1;
        log::debug!("object {:#x} became finalize-ready (critical={})", addr, critical);
    }
    newly_ready
}

/// Trace the fin-ready lists as strong roots (objects waiting for their
/// finalizer must not be collected by an intervening major collection).
///
/// # Safety
/// Stop-the-world only.
pub(crate) unsafe fn scan_finalizer_entries(
    collector: &Collector,
    ctx: &CollectCtx,
    queue: &mut GrayQueue,
) {
    let mut state = collector.fin().lock();
    let state = &mut *state;
    for list in [&mut state.fin_ready, &mut state.critical_ready] {
        for entry in list.iter_mut() {
            let mut addr = *entry;
            collector.copy_object_slot(&mut addr as *mut usize, queue, ctx);
            *entry = addr;
        }
    }
}

/// Pull every unreachable bridge-class object out of the finalizable set.
/// Bridge processing takes ownership of their lifecycle from here on.
pub(crate) fn take_unreachable_bridge_candidates(
    collector: &Collector,
    ctx: &CollectCtx,
    is_bridge: fn(usize) -> bool,
) -> Vec<usize> {
    let mut state = collector.fin().lock();
    let entries: Vec<usize> = state.registered.keys().copied().collect();
    let mut out = Vec::new();
    for obj in entries {
        if is_bridge(unsafe { vtable(obj) }) && !collector.object_is_live(obj, ctx) {
            state.registered.shift_remove(&obj);
            out.push(obj);
        }
    }
    out
}

/// Drain the fin-ready lists, invoking each finalizer exactly once.
/// Ordinary entries run before critical ones. Called by the host's
/// finalizer thread, never during stop-the-world.
pub fn run_finalizers(collector: &Collector) -> usize {
    let mut count = 0usize;
    loop {
        let next = {
            let _gc = collector.lock_gc_from_mutator();
            let mut state = collector.fin().lock();
            state
                .fin_ready
                .pop_front()
                .or_else(|| state.critical_ready.pop_front())
        };
        let Some(obj) = next else { break };
        let vt = unsafe { vtable(obj) };
        (collector.callbacks().run_finalizer)(obj, vt);
        count += 1;
    }
    if count > 0 {
        collector
            .stats()
            .finalizers_run
            .fetch_add(count as u64, Ordering::Relaxed);
    }
    count
}

/// A minimal finalizer thread: parks until notified, then drains the
/// ready lists. Hosts with their own finalizer machinery ignore this and
/// wire `finalize_notify` to it instead.
pub struct FinalizerThread {
    shared: Arc<(Mutex<bool>, Condvar)>,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl FinalizerThread {
    pub fn start(collector: Arc<Collector>) -> Self {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let running = Arc::new(AtomicBool::new(true));
        let thread_shared = shared.clone();
        let thread_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("gengc-finalizer".into())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    {
                        let (lock, cv) = &*thread_shared;
                        let mut signalled = lock.lock();
                        while !*signalled && thread_running.load(Ordering::Acquire) {
                            cv.wait(&mut signalled);
                        }
                        *signalled = false;
                    }
                    run_finalizers(&collector);
                }
            })
            .expect("failed to spawn finalizer thread");
        Self {
            shared,
            running,
            handle: Some(handle),
        }
    }

    pub fn notify(&self) {
        let (lock, cv) = &*self.shared;
        *lock.lock() = true;
        cv.notify_one();
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        self.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
