//! Object header consumed by an external mark/sweep collector.
//!
//! Layout of a headered allocation:
//! ┌──────────────────────────────┐
//! │ ObjectHeader (1 byte)        │  <- flags: marked, dead
//! │ padding up to align_of::<T>  │
//! ├──────────────────────────────┤
//! │ payload: T                   │  <- address handed out to users
//! └──────────────────────────────┘
//!
//! The offset between header and payload depends only on `T`, so the header is
//! recovered from a payload address with a single subtraction. Nothing in
//! `smart_ptr` reads or writes these bits; a collector that does owns its own
//! synchronization.

use std::{
    fmt::Debug,
    mem::offset_of,
    sync::atomic::{ AtomicU8, Ordering }
};

const MARKED_MASK: u8 = 1 << 0;
const DEAD_MASK: u8 = 1 << 1;

#[repr(C)]
pub struct ObjectHeader {
    // Relaxed everywhere, no ordering is promised to other threads
    flags: AtomicU8
}

impl ObjectHeader {
    pub const fn new() -> Self { Self { flags: AtomicU8::new(0) } }

    /// Recover the header stored in front of `payload`.
    ///
    /// # Safety
    /// `payload` must point at the `value` field of a live [`Headered<T>`] and
    /// carry provenance over the whole allocation (use
    /// [`crate::SharedPtr::as_ptr`] or [`Headered::payload_ptr`], not a
    /// pointer cast from a `&T`).
    pub unsafe fn from_payload<'a, T>(payload: *const T) -> &'a ObjectHeader {
        let base = (payload as *const u8).sub(offset_of!(Headered<T>, value)) as *const Headered<T>;
        &(*base).header
    }

    pub fn is_marked(&self) -> bool { self.flags.load(Ordering::Relaxed) & MARKED_MASK != 0 }
    pub fn mark(&self) { self.flags.fetch_or(MARKED_MASK, Ordering::Relaxed); }
    pub fn unmark(&self) { self.flags.fetch_and(!MARKED_MASK, Ordering::Relaxed); }

    /// One way: there is no operation that clears the dead bit.
    pub fn mark_dead(&self) { self.flags.fetch_or(DEAD_MASK, Ordering::Relaxed); }
    pub fn is_dead(&self) -> bool { self.flags.load(Ordering::Relaxed) & DEAD_MASK != 0 }
}

impl Default for ObjectHeader {
    fn default() -> Self { Self::new() }
}

impl Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHeader {{ marked: {}, dead: {} }}", self.is_marked(), self.is_dead())
    }
}

/// A payload with an [`ObjectHeader`] at a fixed offset in front of it
#[repr(C)]
#[derive(Debug, Default)]
pub struct Headered<T> {
    header: ObjectHeader,
    value: T
}

impl<T> Headered<T> {
    pub fn new(value: T) -> Self { Self { header: ObjectHeader::new(), value } }

    pub fn header(&self) -> &ObjectHeader { &self.header }
    pub fn payload(&self) -> &T { &self.value }
    pub fn payload_mut(&mut self) -> &mut T { &mut self.value }
    pub fn into_inner(self) -> T { self.value }

    /// Payload address derived from `this` without going through a
    /// reference, suitable for [`ObjectHeader::from_payload`].
    ///
    /// # Safety
    /// `this` must point to a live `Headered<T>`.
    pub unsafe fn payload_ptr(this: *mut Self) -> *mut T {
        std::ptr::addr_of_mut!((*this).value)
    }
}
