//! Helpers shared by the unit test modules.

use allocator_api2::alloc::{ AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{ AtomicUsize, Ordering }
    }
};

pub type TestReturn = Result<(), Box<dyn std::error::Error>>;

/// Counts how many times the owned object was dropped
pub struct DropCounter(pub Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

/// Refuses every allocation
#[derive(Clone, Copy)]
pub struct NoMemory;

unsafe impl Allocator for NoMemory {
    fn allocate(&self, _: Layout) -> Result<NonNull<[u8]>, AllocError> { Err(AllocError) }
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

// succeeds for the first `budget` allocations, then refuses
#[derive(Clone)]
pub struct Budget(pub Arc<AtomicUsize>);

unsafe impl Allocator for Budget {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        match self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Global.allocate(layout),
            Err(_) => Err(AllocError)
        }
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) { Global.deallocate(ptr, layout) }
}

pub fn check_strong_count(get: usize, expect: usize) {
    assert!(get == expect, "Strong count should be {} instead of {}", expect, get);
}

pub fn check_drops(drops: &AtomicUsize, expect: usize) {
    let get = drops.load(Ordering::SeqCst);
    assert!(get == expect, "Object should have been dropped {} times instead of {}", expect, get);
}
