//! Stop-the-world protocol.
//!
//! Entry: the GC lock is already held by the initiating thread. The
//! interruption lock and the thread-suspend lock are taken for the whole
//! pause, the initiator captures its own stack window, and every other
//! registered thread is asked to suspend.
//!
//! A thread that suspended inside the managed allocator is restarted so it
//! can leave the allocator (its allocation is not atomic with respect to
//! collector state) and is then stopped again; the loop repeats, with a
//! growing sleep, until no live thread is inside the allocator. Threads
//! that stop acknowledging a handshake are marked `skip` and ignored for
//! the rest of the cycle.

use crate::collector::Collector;
use crate::threads::ThreadInfo;
use crate::weak;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Locks and timing held from stop to restart.
pub struct StwSession<'a> {
    _interruption: MutexGuard<'a, ()>,
    _suspend: MutexGuard<'a, ()>,
    start: Instant,
    pub stopped_count: usize,
}

impl Collector {
    /// Stop every other mutator thread. The GC lock must be held.
    pub(crate) fn stop_world(&self, generation: u32) -> StwSession<'_> {
        weak::process_togglerefs(self);

        let interruption = self.interruption_lock().lock();
        let suspend = self.threads().suspend_lock.lock();

        self.update_current_thread_stack();

        let me = self.threads().current().map(|info| info.id());
        log::debug!("stopping world for generation {}", generation);
        let start = Instant::now();

        let mut count = 0usize;
        for info in self.threads().snapshot() {
            if Some(info.id()) == me || info.skip.load(Ordering::Acquire) {
                continue;
            }
            if self.threads().request_suspend(&info) {
                count += 1;
            } else {
                info.skip.store(true, Ordering::Release);
            }
        }
        self.threads().wait_for_acks(count);
        let died = self.restart_threads_until_none_in_managed_allocator();
        count -= died;
        log::debug!("world stopped: {} thread(s)", count);

        StwSession {
            _interruption: interruption,
            _suspend: suspend,
            start,
            stopped_count: count,
        }
    }

    /// Capture the initiating thread's top-of-stack so conservative
    /// scanning covers the frames below the collection entry point.
    #[inline(never)]
    fn update_current_thread_stack(&self) {
        if let Some(info) = self.threads().current() {
            let probe: usize = 0;
            info.set_stack_cur(&probe as *const usize as usize);
        }
    }

    /// Restart threads stopped inside the managed allocator and re-suspend
    /// them once they are out, until none remain. Returns the number of
    /// threads that died during the handshake.
    fn restart_threads_until_none_in_managed_allocator(&self) -> usize {
        let me = self.threads().current().map(|info| info.id());
        let mut num_died = 0usize;
        let mut sleep_duration: Option<Duration> = None;

        loop {
            let mut restarted: Vec<Arc<ThreadInfo>> = Vec::new();
            for info in self.threads().snapshot() {
                if Some(info.id()) == me || info.skip.load(Ordering::Acquire) {
                    continue;
                }
                let must_retry = !info.dying.load(Ordering::Acquire)
                    && (info.stack_cur() == 0
                        || info.in_managed_allocator.load(Ordering::Acquire));
                if !must_retry {
                    continue;
                }
                if self.threads().resume(&info) {
                    restarted.push(info);
                } else {
                    info.skip.store(true, Ordering::Release);
                }
            }
            if restarted.is_empty() {
                break;
            }
            self.stats()
                .stw_restart_rounds
                .fetch_add(1, Ordering::Relaxed);
            self.threads().wait_for_acks(restarted.len());

            match sleep_duration {
                None => {
                    std::thread::yield_now();
                    sleep_duration = Some(Duration::ZERO);
                }
                Some(d) => {
                    std::thread::sleep(d);
                    sleep_duration = Some(d + Duration::from_micros(10));
                }
            }

            let mut resuspended = 0usize;
            for info in &restarted {
                if self.threads().request_suspend(info) {
                    resuspended += 1;
                } else {
                    info.skip.store(true, Ordering::Release);
                }
            }
            num_died += restarted.len() - resuspended;
            self.threads().wait_for_acks(resuspended);
        }

        if num_died > 0 {
            self.stats()
                .threads_died_in_handshake
                .fetch_add(num_died as u64, Ordering::Relaxed);
        }
        num_died
    }

    /// Restart the world, release the pause locks and run the bridge
    /// post-step. Returns the pause time in microseconds.
    pub(crate) fn restart_world(&self, generation: u32, session: StwSession<'_>) -> u64 {
        let me = self.threads().current().map(|info| info.id());
        for info in self.threads().snapshot() {
            info.set_stack_cur(0);
            info.set_regs(Vec::new());
        }

        let start = session.start;
        drop(session);

        let mut count = 0usize;
        for info in self.threads().snapshot() {
            if Some(info.id()) == me || info.skip.load(Ordering::Acquire) {
                continue;
            }
            if info.suspend_requested() && self.threads().resume(&info) {
                count += 1;
            }
        }
        self.threads().wait_for_acks(count);

        let pause_usec = start.elapsed().as_micros() as u64;
        self.stats().record_pause(pause_usec);
        log::debug!(
            "world restarted after generation {} collection: {} thread(s), pause {} usec",
            generation,
            count,
            pause_usec
        );

        weak::bridge_process_after_restart(self);
        pause_usec
    }
}
