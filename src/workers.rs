//! Parallel marking workers.
//!
//! The driver enqueues typed jobs; each worker owns a private gray queue
//! and pulls jobs from a shared injector. Rebalancing goes through the
//! distribute queue: a worker whose private queue grows past a couple of
//! sections donates full sections, and idle workers pull them back. The
//! main thread polls and yields while the distribute queue is non-empty,
//! then joins — a job enqueued after `start_marking` is never observable
//! as complete before `join` returns.

use crate::collector::Collector;
use crate::gray::{GrayQueue, GraySection};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Work items the driver hands to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcJob {
    ScanRemsets,
    ScanRootsNormal,
    ScanRootsWBarrier,
    ScanThreadData,
    ScanFinalizers,
}

/// Collection parameters broadcast to workers for one marking phase.
#[derive(Debug, Clone, Copy)]
pub struct MarkParams {
    pub gen: crate::collect::Generation,
    pub scan_lo: usize,
    pub scan_hi: usize,
}

/// Donate surplus sections once the private queue holds this many.
const DONATE_THRESHOLD: usize = 2;

struct PoolState {
    marking: bool,
    shutdown: bool,
    idle: usize,
    params: Option<MarkParams>,
}

pub struct WorkerPool {
    n_workers: usize,
    jobs: Injector<GcJob>,
    distribute: Injector<GraySection>,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    done_cv: Condvar,
    collector: Mutex<Weak<Collector>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers,
            jobs: Injector::new(),
            distribute: Injector::new(),
            state: Mutex::new(PoolState {
                marking: false,
                shutdown: false,
                idle: 0,
                params: None,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            collector: Mutex::new(Weak::new()),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.n_workers
    }

    /// Spawn the workers. They hold only a weak collector reference so the
    /// collector can still be dropped; `shutdown` reaps them.
    pub fn start(self: &Arc<Self>, collector: &Arc<Collector>) {
        if self.n_workers <= 1 || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.collector.lock() = Arc::downgrade(collector);
        let mut handles = self.handles.lock();
        for index in 0..self.n_workers {
            let pool = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("gengc-worker-{}", index))
                    .spawn(move || worker_main(pool))
                    .expect("failed to spawn marking worker"),
            );
        }
    }

    pub fn enqueue_job(&self, job: GcJob) {
        self.jobs.push(job);
    }

    /// Open a marking phase: workers wake up and start pulling jobs.
    pub fn start_marking(&self, params: MarkParams) {
        let mut state = self.state.lock();
        state.params = Some(params);
        state.marking = true;
        self.work_cv.notify_all();
    }

    pub fn distribute_section(&self, section: GraySection) {
        self.distribute.push(section);
        self.work_cv.notify_all();
    }

    pub fn distribute_is_empty(&self) -> bool {
        self.distribute.is_empty()
    }

    fn pop_job(&self) -> Option<GcJob> {
        steal_one(&self.jobs)
    }

    fn pull_section(&self) -> Option<GraySection> {
        steal_one(&self.distribute)
    }

    /// Wait until every job and every donated section has been processed,
    /// then close the marking phase.
    pub fn join(&self) {
        loop {
            if !self.distribute.is_empty() {
                std::thread::yield_now();
                continue;
            }
            let mut state = self.state.lock();
            if self.jobs.is_empty()
                && self.distribute.is_empty()
                && state.idle == self.n_workers
            {
                state.marking = false;
                state.params = None;
                self.work_cv.notify_all();
                return;
            }
            self.done_cv
                .wait_for(&mut state, Duration::from_millis(1));
        }
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            self.work_cv.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn steal_one<T>(injector: &Injector<T>) -> Option<T> {
    loop {
        match injector.steal() {
            Steal::Success(value) => return Some(value),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn worker_main(pool: Arc<WorkerPool>) {
    loop {
        // Wait for a marking phase (or shutdown).
        let params = {
            let mut state = pool.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if state.marking {
                    break state.params.expect("marking phase without parameters");
                }
                state.idle += 1;
                pool.done_cv.notify_all();
                pool.work_cv.wait(&mut state);
                state.idle -= 1;
            }
        };
        let Some(collector) = pool.collector.lock().upgrade() else {
            let mut state = pool.state.lock();
            state.marking = false;
            continue;
        };
        let ctx = collector.make_ctx(params);
        let mut queue = GrayQueue::new();

        loop {
            let mut did_work = false;
            while let Some(job) = pool.pop_job() {
                unsafe { collector.execute_job(job, &mut queue, &ctx) };
                donate_surplus(&pool, &mut queue);
                did_work = true;
            }
            if let Some(section) = pool.pull_section() {
                queue.push_section(section);
                did_work = true;
            }
            if !queue.is_empty() {
                unsafe { collector.drain_gray_stack(&mut queue, -1, &ctx) };
                donate_surplus(&pool, &mut queue);
                did_work = true;
            }
            if did_work {
                continue;
            }
            // Nothing left that we can see; park as idle until more work
            // shows up or the phase closes.
            let mut state = pool.state.lock();
            state.idle += 1;
            pool.done_cv.notify_all();
            let phase_over = loop {
                if state.shutdown || !state.marking {
                    break true;
                }
                if !pool.jobs.is_empty() || !pool.distribute.is_empty() {
                    break false;
                }
                pool.work_cv
                    .wait_for(&mut state, Duration::from_millis(1));
            };
            state.idle -= 1;
            if phase_over {
                debug_assert!(queue.is_empty());
                break;
            }
        }
    }
}

fn donate_surplus(pool: &WorkerPool, queue: &mut GrayQueue) {
    while queue.section_count() > DONATE_THRESHOLD {
        match queue.take_section() {
            Some(section) => pool.distribute_section(section),
            None => break,
        }
    }
}
