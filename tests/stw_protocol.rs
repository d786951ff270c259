//! Stop-the-world handshake: the managed-allocator retry loop.

mod common;

use common::GcFixture;
use gengc::approximate_stack_base;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A mutator parked inside the managed allocator at stop time is
/// restarted until it leaves the allocator, then re-suspended; the
/// collection proceeds normally and the pause is measured.
#[test]
fn test_thread_stopped_in_allocator_is_retried() {
    let fixture = GcFixture::with_defaults();
    let gc = fixture.gc.clone();

    let ready = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let thread_ready = ready.clone();
    let thread_done = done.clone();
    let thread_gc = gc.clone();

    let mutator = std::thread::spawn(move || {
        let info = thread_gc.register_thread(approximate_stack_base(), None);
        // Simulate being mid-allocation when the stop request lands.
        info.in_managed_allocator.store(true, Ordering::Release);
        thread_ready.store(true, Ordering::Release);
        while !thread_done.load(Ordering::Acquire) {
            if info.suspend_requested() {
                // Park while still "inside" the allocator; once restarted,
                // finish the allocation and leave it. The collector's
                // retry loop relies on exactly this.
                thread_gc.safepoint();
                info.in_managed_allocator.store(false, Ordering::Release);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
        thread_gc.unregister_thread();
    });

    while !ready.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let class = common::data_class(16, &[]);
    let _obj = fixture.alloc(class);
    let rounds_before = fixture
        .gc
        .stats()
        .stw_restart_rounds
        .load(Ordering::Relaxed);

    fixture.gc.collect(0);

    let rounds = fixture
        .gc
        .stats()
        .stw_restart_rounds
        .load(Ordering::Relaxed)
        - rounds_before;
    assert!(rounds >= 1, "the in-allocator thread was never retried");
    assert!(rounds <= 16, "retry loop failed to converge");
    assert!(fixture.gc.stats().last_pause_usec.load(Ordering::Relaxed) > 0);
    assert_eq!(fixture.gc.collection_count(0), 1);

    done.store(true, Ordering::Release);
    mutator.join().unwrap();
}

/// A second registered thread that polls safepoints does not block the
/// collection, and its stack snapshot is taken and released.
#[test]
fn test_cooperative_thread_suspends_and_resumes() {
    let fixture = GcFixture::with_defaults();
    let gc = fixture.gc.clone();

    let done = Arc::new(AtomicBool::new(false));
    let thread_done = done.clone();
    let thread_gc = gc.clone();
    let mutator = std::thread::spawn(move || {
        thread_gc.register_thread(approximate_stack_base(), None);
        while !thread_done.load(Ordering::Acquire) {
            thread_gc.safepoint();
            std::thread::sleep(Duration::from_micros(50));
        }
        thread_gc.unregister_thread();
    });

    // Let the thread register before collecting.
    std::thread::sleep(Duration::from_millis(10));
    fixture.gc.collect(0);
    fixture.gc.collect(0);
    assert_eq!(fixture.gc.collection_count(0), 2);

    done.store(true, Ordering::Release);
    mutator.join().unwrap();
}
