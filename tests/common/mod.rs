//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use allocator_api2::alloc::{ AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{ AtomicUsize, Ordering }
    }
};

/// Number of threads used by the stress tests
pub const THREAD_COUNT: usize = 8;

/// Iterations of clone/drop per thread
pub const ITERATIONS: usize = 10_000;

/// Counts how many times the owned object was dropped
pub struct DropCounter(pub Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

/// Allocator that forwards to Global and keeps track of live allocations
#[derive(Clone, Default)]
pub struct CountingAlloc {
    pub allocs: Arc<AtomicUsize>,
    pub frees: Arc<AtomicUsize>
}

impl CountingAlloc {
    pub fn live(&self) -> usize {
        self.allocs.load(Ordering::SeqCst) - self.frees.load(Ordering::SeqCst)
    }
}

unsafe impl Allocator for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let mem = Global.allocate(layout)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(mem)
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        Global.deallocate(ptr, layout)
    }
}

pub fn assert_drops(drops: &AtomicUsize, expected: usize) {
    let got = drops.load(Ordering::SeqCst);
    assert_eq!(got, expected, "Owned object should be dropped {} times, got {}", expected, got);
}
