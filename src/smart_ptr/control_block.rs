//! Reference-counted control blocks.
//!
//! Every block starts with a [`ControlBlock`] header (vtable + counters) and is
//! followed by whatever the deletion strategy needs:
//!
//! - [`RefCount`]: a pointer adopted from an allocator box, destroyed by
//!   rebuilding the box (std::_Ref_count)
//! - [`RefCountResource`]: a pointer plus a caller supplied deleter
//!   (std::_Ref_count_resource)
//! - [`RefCountObject`]: the value itself, stored inline (std::_Ref_count_obj2)
//!
//! Handles only ever see `NonNull<ControlBlock>`; the concrete layout is
//! reached through the vtable.

use allocator_api2::{
    alloc::{ Allocator, Global },
    boxed::Box as ABox
};
use crate::error::{ Result, SmartPtrError };
use log::{ error, trace };
use std::{
    alloc::Layout,
    fmt::Debug,
    mem::ManuallyDrop,
    ptr::{ self, NonNull },
    sync::atomic::{ self, AtomicUsize, Ordering }
};

struct BlockVtable {
    // Self::destroy, runs the deletion strategy. Called once, when uses hits 0
    destroy: unsafe fn(NonNull<ControlBlock>),
    // Self::delete_this, returns the block's memory to its allocator
    delete_this: unsafe fn(NonNull<ControlBlock>),
    kind: &'static str
}

#[repr(C)]
pub struct ControlBlock {
    vtable: &'static BlockVtable,
    uses: AtomicUsize,
    // reserved for weak pointers, stays at 0
    weaks: AtomicUsize
}

impl ControlBlock {
    fn new(vtable: &'static BlockVtable) -> Self {
        Self {
            vtable,
            uses: AtomicUsize::new(1),
            weaks: AtomicUsize::new(0)
        }
    }

    /// Create a block owning `ptr`, which is destroyed and freed by rebuilding
    /// the `ABox` it came from.
    ///
    /// If the block itself can't be allocated, `ptr` is destroyed before the
    /// error is returned.
    ///
    /// # Safety
    /// `ptr` must come from [`ABox::into_raw_with_allocator`] with an
    /// allocator equal to `alloc`, and must not be owned by anything else.
    pub unsafe fn allocate_default<T, A>(ptr: *mut T, alloc: A) -> Result<NonNull<ControlBlock>>
    where T: ?Sized,
          A: Allocator + Clone
    {
        let mem = match allocate_raw::<RefCount<T, A>, A>(&alloc) {
            Ok(mem) => mem,
            Err(e) => {
                drop(ABox::from_raw_in(ptr, alloc));
                return Err(e);
            }
        };
        mem.as_ptr().write(RefCount {
            base: ControlBlock::new(&RefCount::<T, A>::VTABLE),
            ptr,
            _allocator: alloc
        });
        trace!("allocated {} control block {:p}", RefCount::<T, A>::VTABLE.kind, mem);
        Ok(mem.cast())
    }

    /// Create a block owning `ptr` whose deletion strategy is `deleter(ptr)`.
    /// `ptr` may be null, the deleter still runs once with it.
    ///
    /// If the block itself can't be allocated, `deleter(ptr)` runs before the
    /// error is returned.
    pub fn allocate_custom<T, D, A>(ptr: *mut T, deleter: D, alloc: A) -> Result<NonNull<ControlBlock>>
    where T: ?Sized,
          D: FnOnce(*mut T) + Send + 'static,
          A: Allocator + Clone
    {
        let mem = match allocate_raw::<RefCountResource<T, D, A>, A>(&alloc) {
            Ok(mem) => mem,
            Err(e) => {
                deleter(ptr);
                return Err(e);
            }
        };
        unsafe {
            mem.as_ptr().write(RefCountResource {
                base: ControlBlock::new(&RefCountResource::<T, D, A>::VTABLE),
                ptr,
                deleter: ManuallyDrop::new(deleter),
                _allocator: alloc
            });
        }
        trace!("allocated {} control block {:p}", RefCountResource::<T, D, A>::VTABLE.kind, mem);
        Ok(mem.cast())
    }

    /// Create a block that stores `value` inline. Returns the block and the
    /// address of the value inside it.
    pub fn allocate_inline<T, A>(value: T, alloc: A) -> Result<(NonNull<ControlBlock>, NonNull<T>)>
    where A: Allocator + Clone
    {
        let mem = allocate_raw::<RefCountObject<T, A>, A>(&alloc)?;
        let data = unsafe {
            mem.as_ptr().write(RefCountObject {
                base: ControlBlock::new(&RefCountObject::<T, A>::VTABLE),
                value: ManuallyDrop::new(value),
                _allocator: alloc
            });
            RefCountObject::<T, A>::get_data_ptr(mem.as_ptr())
        };
        trace!("allocated {} control block {:p}", RefCountObject::<T, A>::VTABLE.kind, mem);
        // the value lives inside a non-null allocation
        Ok((mem.cast(), unsafe { NonNull::new_unchecked(data) }))
    }

    /// Take one more strong reference. The caller must already hold one.
    pub fn add_strong_ref(&self) {
        // a new reference can only be made from an existing one, no ordering needed
        let old = self.uses.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old != 0, "add_strong_ref on a control block whose object was already destroyed");
    }

    /// Give back one strong reference. The thread dropping the last one runs
    /// the deletion strategy and, with no weak references left, frees the block.
    ///
    /// # Safety
    /// `this` must be a live block and the caller must own one strong
    /// reference to it, which is consumed. `this` may be dangling afterwards.
    pub unsafe fn release_strong_ref(this: NonNull<Self>) {
        let block = this.as_ref();
        if block.uses.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // every other release happens-before the deletion strategy
        atomic::fence(Ordering::Acquire);
        let vtable = block.vtable;
        trace!("destroying object of {} control block {:p}", vtable.kind, this);
        (vtable.destroy)(this);
        if this.as_ref().weaks.load(Ordering::Acquire) == 0 {
            trace!("releasing {} control block {:p}", vtable.kind, this);
            (vtable.delete_this)(this);
        }
    }

    pub fn strong_count(&self) -> usize { self.uses.load(Ordering::Acquire) }
    pub fn weak_count(&self) -> usize { self.weaks.load(Ordering::Acquire) }
}

impl Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ControlBlock {{ kind: {}, strong: {}, weak: {} }}",
            self.vtable.kind, self.strong_count(), self.weak_count())
    }
}

fn allocate_raw<B, A>(alloc: &A) -> Result<NonNull<B>>
where A: Allocator
{
    let layout = Layout::new::<B>();
    match alloc.allocate(layout) {
        Ok(mem) => Ok(mem.cast()),
        Err(_) => {
            error!("control block allocation of {} bytes failed", layout.size());
            Err(SmartPtrError::alloc_failed(layout))
        }
    }
}

/// Free a block's memory with the allocator stored inside it
unsafe fn deallocate_block<B, A>(block: *mut B, alloc: *mut A)
where A: Allocator
{
    let alloc = ptr::read(alloc);
    alloc.deallocate(NonNull::new_unchecked(block as *mut u8), Layout::new::<B>());
}

#[repr(C)]
struct RefCount<T, A = Global>
where T: ?Sized,
      A: Allocator + Clone
{
    base: ControlBlock,
    ptr: *mut T,
    _allocator: A
}

impl<T, A> RefCount<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    const VTABLE: BlockVtable = BlockVtable {
        destroy: Self::destroy,
        delete_this: Self::delete_this,
        kind: "default"
    };

    unsafe fn destroy(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        drop(ABox::from_raw_in((*this).ptr, (*this)._allocator.clone()));
    }

    unsafe fn delete_this(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        deallocate_block(this, ptr::addr_of_mut!((*this)._allocator));
    }
}

#[repr(C)]
struct RefCountResource<T, D, A = Global>
where T: ?Sized,
      D: FnOnce(*mut T),
      A: Allocator + Clone
{
    base: ControlBlock,
    ptr: *mut T,
    deleter: ManuallyDrop<D>,
    _allocator: A
}

impl<T, D, A> RefCountResource<T, D, A>
where T: ?Sized,
      D: FnOnce(*mut T),
      A: Allocator + Clone
{
    const VTABLE: BlockVtable = BlockVtable {
        destroy: Self::destroy,
        delete_this: Self::delete_this,
        kind: "custom"
    };

    unsafe fn destroy(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        let deleter = ManuallyDrop::take(&mut (*this).deleter);
        deleter((*this).ptr);
    }

    unsafe fn delete_this(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        deallocate_block(this, ptr::addr_of_mut!((*this)._allocator));
    }
}

// MSVC STL: std_ref_count_obj
#[repr(C)]
struct RefCountObject<T, A = Global>
where A: Allocator + Clone
{
    base: ControlBlock,
    value: ManuallyDrop<T>,
    _allocator: A
}

impl<T, A> RefCountObject<T, A>
where A: Allocator + Clone
{
    const VTABLE: BlockVtable = BlockVtable {
        destroy: Self::destroy,
        delete_this: Self::delete_this,
        kind: "inline"
    };

    unsafe fn get_data_ptr(this: *mut Self) -> *mut T {
        ptr::addr_of_mut!((*this).value) as *mut T
    }

    unsafe fn destroy(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        ptr::drop_in_place(Self::get_data_ptr(this));
    }

    unsafe fn delete_this(this: NonNull<ControlBlock>) {
        let this = this.cast::<Self>().as_ptr();
        deallocate_block(this, ptr::addr_of_mut!((*this)._allocator));
    }
}
