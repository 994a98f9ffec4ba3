//! Errors surfaced by the constructing operations of the smart pointer types.

use std::alloc::Layout;
use thiserror::Error;

/// Main error type for every fallible operation in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SmartPtrError {
    /// The allocator refused the memory needed for a control block.
    ///
    /// When the block was meant to adopt an existing object, that object has
    /// already been destroyed through its deletion strategy by the time this
    /// is returned.
    #[error("Control block allocation failed: requested {size} bytes aligned to {align}")]
    AllocFailed { size: usize, align: usize },
}

impl SmartPtrError {
    pub fn alloc_failed(layout: Layout) -> Self {
        Self::AllocFailed { size: layout.size(), align: layout.align() }
    }

    /// Layout of the request that failed, used to hand off to
    /// [`std::alloc::handle_alloc_error`]
    pub fn layout(&self) -> Layout {
        match *self {
            // size and align were read from a valid Layout
            Self::AllocFailed { size, align } => unsafe {
                Layout::from_size_align_unchecked(size, align)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SmartPtrError>;
