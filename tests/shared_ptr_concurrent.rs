//! SharedPtr concurrency tests
//!
//! Many threads cloning and dropping handles to one control block:
//! - the strong count ends at the number of surviving handles
//! - the deletion strategy runs exactly once, after the last release

mod common;

use common::{ assert_drops, DropCounter, ITERATIONS, THREAD_COUNT };
use hawl_core::SharedPtr;
use std::sync::{
    Arc,
    Barrier,
    atomic::{ AtomicUsize, Ordering }
};
use std::thread;

/// Clone/drop storms on a handle shared by reference
#[test]
fn test_concurrent_clone_and_drop() {
    // Arrange
    let drops = Arc::new(AtomicUsize::new(0));
    let shared = SharedPtr::make_shared(DropCounter(drops.clone()));
    let barrier = Barrier::new(THREAD_COUNT);
    let keep_per_thread = 3;

    // Act - every thread churns, then hands back a few survivors
    let survivors: Vec<SharedPtr<DropCounter>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREAD_COUNT).map(|_| s.spawn(|| {
            barrier.wait();
            for _ in 0..ITERATIONS {
                let copy = shared.clone();
                drop(copy);
            }
            (0..keep_per_thread).map(|_| shared.clone()).collect::<Vec<_>>()
        })).collect();
        handles.into_iter()
            .flat_map(|h| h.join().expect("Thread should not panic"))
            .collect()
    });

    // Assert
    assert_eq!(shared.strong_count(), 1 + THREAD_COUNT * keep_per_thread,
        "Strong count should equal the number of live handles");
    assert_drops(&drops, 0);
    drop(survivors);
    assert_eq!(shared.strong_count(), 1, "Only the original handle should remain");
    drop(shared);
    assert_drops(&drops, 1);
}

/// Last reference released on a worker thread while others race to drop theirs
#[test]
fn test_custom_deleter_fires_once_across_threads() {
    // Arrange
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_d = calls.clone();
    let raw = Box::into_raw(Box::new(0xF00Du32));
    let shared = unsafe {
        SharedPtr::with_deleter(raw, move |p: *mut u32| {
            calls_d.fetch_add(1, Ordering::SeqCst);
            drop(Box::from_raw(p));
        })
    };
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));

    // Act - each thread owns its own handle and releases it after the barrier
    let handles: Vec<_> = (0..THREAD_COUNT).map(|_| {
        let mine = shared.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            assert_eq!(*mine, 0xF00D, "Payload should be readable from every thread");
            for _ in 0..ITERATIONS / 10 {
                drop(mine.clone());
            }
        })
    }).collect();
    drop(shared);
    for handle in handles {
        handle.join().expect("Thread should not panic");
    }

    // Assert
    assert_eq!(calls.load(Ordering::SeqCst), 1, "Deleter should run exactly once across all threads");
}

/// Moves between threads never change the count
#[test]
fn test_move_across_threads_keeps_count() {
    let drops = Arc::new(AtomicUsize::new(0));
    let shared = SharedPtr::make_shared(DropCounter(drops.clone()));
    let copy = shared.clone();

    let returned = thread::spawn(move || {
        assert_eq!(copy.strong_count(), 2, "Moving into a thread should not touch the count");
        copy
    }).join().expect("Thread should not panic");

    assert_eq!(shared.strong_count(), 2, "Handle moved back should still be counted once");
    drop(returned);
    drop(shared);
    assert_drops(&drops, 1);
}
