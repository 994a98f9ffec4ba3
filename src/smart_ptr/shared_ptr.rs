use allocator_api2::{
    alloc::{ Allocator, Global },
    boxed::Box as ABox
};
use crate::{
    error::Result,
    gc::header::Headered,
    smart_ptr::control_block::ControlBlock
};
use std::{
    alloc::handle_alloc_error,
    ffi::c_void,
    fmt::{ self, Debug, Display },
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::Deref,
    ptr::NonNull
};

/// Pointer conversion from `Self` to `U` that the compiler can check, the
/// stand-in for C++'s implicit `U*` to `T*` conversion. Every type converts
/// to itself; other conversions are declared with [`impl_upcast!`].
///
/// # Safety
/// `upcast` must return a pointer to the same object (or a sub-object of it),
/// non-null whenever the input is non-null. `U` may only be `Send`/`Sync`
/// when `Self` is, since the handle's thread-safety follows the element type.
pub unsafe trait Upcast<U: ?Sized> {
    fn upcast(ptr: *mut Self) -> *mut U;
}

unsafe impl<T: ?Sized> Upcast<T> for T {
    fn upcast(ptr: *mut Self) -> *mut T { ptr }
}

/// Declare that a concrete type may be viewed through one or more unsized
/// types, usually trait objects. The targets must not be `Send`/`Sync` unless
/// the source type is.
///
/// ```ignore
/// impl_upcast!(Square => dyn Shape, dyn Any + Send + Sync);
/// ```
#[macro_export]
macro_rules! impl_upcast {
    ($from:ty => $($to:ty),+ $(,)?) => {
        $(
            unsafe impl $crate::Upcast<$to> for $from {
                fn upcast(ptr: *mut Self) -> *mut $to { ptr as *mut $to }
            }
        )+
    };
}

/// Reference-counted shared owning pointer, like C++'s std::shared_ptr.
///
/// A handle carries two independent references: `_rep` decides how long the
/// owned object lives, `_ptr` is what gets dereferenced. They differ for
/// handles made with [`SharedPtr::alias`]. Counting is atomic, so handles to
/// the same object can be cloned and dropped from any thread.
#[repr(C)]
pub struct SharedPtr<T, A = Global>
where T: ?Sized,
      A: Allocator + Clone
{
    _ptr: Option<NonNull<T>>,
    _rep: Option<NonNull<ControlBlock>>,
    _alloc: PhantomData<A>
}

unsafe impl<T, A> Send for SharedPtr<T, A>
where T: ?Sized + Send + Sync,
      A: Allocator + Clone + Send + Sync {}

unsafe impl<T, A> Sync for SharedPtr<T, A>
where T: ?Sized + Send + Sync,
      A: Allocator + Clone + Send + Sync {}

fn or_abort<T>(res: Result<T>) -> T {
    res.unwrap_or_else(|e| handle_alloc_error(e.layout()))
}

impl<T> SharedPtr<T, Global> {
    /// Construct an object of type T and wrap it in a SharedPtr to act as a reference counting
    /// smart pointer. Object and control block share one allocation.
    pub fn make_shared(data: T) -> Self { Self::make_shared_in(data, Global) }
    pub fn try_make_shared(data: T) -> Result<Self> { Self::try_make_shared_in(data, Global) }

    /// Allocate `data` behind an [`crate::ObjectHeader`]. The returned handle points at
    /// the payload, so `ObjectHeader::from_payload(ptr.as_ptr())` finds the header.
    pub fn new_headered(data: T) -> Self { or_abort(Self::try_new_headered_in(data, Global)) }
}

impl<T> SharedPtr<T, Global>
where T: ?Sized
{
    /// Take ownership of `ptr`, releasing it with `deleter(ptr)` once the last
    /// strong reference is gone. See [`SharedPtr::try_with_deleter_in`].
    ///
    /// # Safety
    /// Same as [`SharedPtr::try_with_deleter_in`].
    pub unsafe fn try_with_deleter<D>(ptr: *mut T, deleter: D) -> Result<Self>
    where D: FnOnce(*mut T) + Send + 'static
    {
        Self::try_with_deleter_in(ptr, deleter, Global)
    }

    /// # Safety
    /// Same as [`SharedPtr::try_with_deleter_in`].
    pub unsafe fn with_deleter<D>(ptr: *mut T, deleter: D) -> Self
    where D: FnOnce(*mut T) + Send + 'static
    {
        or_abort(Self::try_with_deleter(ptr, deleter))
    }
}

impl<T, A> SharedPtr<T, A>
where A: Allocator + Clone
{
    pub fn make_shared_in(data: T, alloc: A) -> Self { or_abort(Self::try_make_shared_in(data, alloc)) }

    pub fn try_make_shared_in(data: T, alloc: A) -> Result<Self> {
        let (rep, ptr) = ControlBlock::allocate_inline(data, alloc)?;
        Ok(Self::from_parts(Some(ptr), Some(rep)))
    }

    pub fn try_new_headered_in(data: T, alloc: A) -> Result<Self> {
        let owner = SharedPtr::<Headered<T>, A>::try_make_shared_in(Headered::new(data), alloc)?;
        // the payload is part of the owner's allocation
        Ok(unsafe { Self::alias(&owner, Headered::payload_ptr(owner.as_ptr())) })
    }

    /// Payload address, null for an empty pointer
    pub fn as_ptr(&self) -> *mut T {
        self._ptr.map_or(std::ptr::null_mut(), |p| p.as_ptr())
    }
}

impl<T, A> SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn from_parts(_ptr: Option<NonNull<T>>, _rep: Option<NonNull<ControlBlock>>) -> Self {
        Self { _ptr, _rep, _alloc: PhantomData }
    }

    /// Empty pointer, owns nothing and allocates nothing
    pub const fn null() -> Self {
        Self { _ptr: None, _rep: None, _alloc: PhantomData }
    }

    /// Take ownership of a boxed object. Dropping the last reference drops the
    /// box, freeing it with the allocator it was made with.
    pub fn try_from_box(data: ABox<T, A>) -> Result<Self> {
        let (ptr, alloc) = ABox::into_raw_with_allocator(data);
        unsafe { Self::try_adopt_raw_in(ptr, alloc) }
    }

    pub fn from_box(data: ABox<T, A>) -> Self { or_abort(Self::try_from_box(data)) }

    /// Take ownership of a raw pointer released from an [`ABox`]. If the
    /// control block can't be allocated the object is destroyed before the
    /// error is returned.
    ///
    /// # Safety
    /// `ptr` must come from [`ABox::into_raw_with_allocator`] with an allocator
    /// equal to `alloc`, and nothing else may own it.
    pub unsafe fn try_adopt_raw_in(ptr: *mut T, alloc: A) -> Result<Self> {
        let rep = ControlBlock::allocate_default(ptr, alloc)?;
        Ok(Self::from_parts(NonNull::new(ptr), Some(rep)))
    }

    /// Take ownership of `ptr`, releasing it with `deleter(ptr)` once the last
    /// strong reference is gone. `ptr` may be null, in which case the pointer
    /// still owns a control block and the deleter is called with null. If the
    /// control block can't be allocated, `deleter(ptr)` runs before the error
    /// is returned.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a valid `T` that is owned exclusively by
    /// the returned pointer until the deleter runs: no other pointer may read
    /// or write `*ptr` in the meantime, since [`SharedPtr::get_mut`] hands out
    /// `&mut T` once the count drops to one.
    pub unsafe fn try_with_deleter_in<D>(ptr: *mut T, deleter: D, alloc: A) -> Result<Self>
    where D: FnOnce(*mut T) + Send + 'static
    {
        let rep = ControlBlock::allocate_custom(ptr, deleter, alloc)?;
        Ok(Self::from_parts(NonNull::new(ptr), Some(rep)))
    }

    /// Share ownership with `owner` while pointing at `ptr`. The object owned
    /// by `owner` stays alive until this pointer is dropped as well. If
    /// `owner` is empty the result owns nothing but still points at `ptr`.
    ///
    /// # Safety
    /// - A non-null `ptr` must stay valid for as long as `owner`'s object is
    ///   alive, and must only be reached through handles sharing that object
    ///   (once the result is the last strong reference, [`SharedPtr::get_mut`]
    ///   hands out `&mut T`).
    /// - The result is `Send`/`Sync` according to `T`, not `U`. If `U` is not
    ///   `Send + Sync`, the result must not be sent to or shared with another
    ///   thread, since dropping it there may destroy `owner`'s object.
    pub unsafe fn alias<U>(owner: &SharedPtr<U, A>, ptr: *mut T) -> Self
    where U: ?Sized
    {
        if let Some(rep) = owner._rep {
            rep.as_ref().add_strong_ref();
        }
        Self::from_parts(NonNull::new(ptr), owner._rep)
    }

    /// Convert to a compatible element type. Counts are not touched.
    pub fn upcast<U>(this: Self) -> SharedPtr<U, A>
    where T: Upcast<U>,
          U: ?Sized
    {
        let this = ManuallyDrop::new(this);
        // Upcast keeps non-null pointers non-null
        let _ptr = this._ptr.map(|p| unsafe { NonNull::new_unchecked(<T as Upcast<U>>::upcast(p.as_ptr())) });
        SharedPtr::from_parts(_ptr, this._rep)
    }

    /// Share ownership through a compatible element type. Adds one strong reference.
    pub fn upcast_cloned<U>(this: &Self) -> SharedPtr<U, A>
    where T: Upcast<U>,
          U: ?Sized
    {
        Self::upcast(this.clone())
    }

    /// Drop the element type, keeping only ownership and address.
    ///
    /// The erased pointer is `Send + Sync`, so only thread-safe objects can be
    /// erased; otherwise the last erased handle could destroy the object on
    /// another thread.
    ///
    /// ```compile_fail
    /// use hawl_core::SharedPtr;
    /// use std::rc::Rc;
    ///
    /// let erased = SharedPtr::erase(SharedPtr::make_shared(Rc::new(0)));
    /// std::thread::spawn(move || drop(erased));
    /// ```
    pub fn erase(this: Self) -> SharedPtr<c_void, A>
    where T: Send + Sync
    {
        let this = ManuallyDrop::new(this);
        SharedPtr::from_parts(this._ptr.map(|p| p.cast::<c_void>()), this._rep)
    }

    pub fn get(&self) -> Option<&T> {
        self._ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Mutable access, only while this is the sole strong reference.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match (self._ptr, self.unique()) {
            (Some(p), true) => Some(unsafe { &mut *p.as_ptr() }),
            _ => None
        }
    }

    pub fn as_non_null(&self) -> Option<NonNull<T>> { self._ptr }

    pub fn strong_count(&self) -> usize {
        self._rep.map_or(0, |r| unsafe { r.as_ref() }.strong_count())
    }
    pub fn weak_count(&self) -> usize {
        self._rep.map_or(0, |r| unsafe { r.as_ref() }.weak_count())
    }
    pub fn unique(&self) -> bool { self.strong_count() == 1 }

    /// No payload to point at. A pointer made with a null deleter-managed
    /// pointer is null but still owns a control block.
    pub fn is_null(&self) -> bool { self._ptr.is_none() }
    /// Owns a control block
    pub fn has_owner(&self) -> bool { self._rep.is_some() }

    /// Same payload address
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self._ptr.map(|p| p.cast::<u8>()) == other._ptr.map(|p| p.cast::<u8>())
    }
    /// Same control block, whatever the payload addresses are
    pub fn owner_eq<U>(&self, other: &SharedPtr<U, A>) -> bool
    where U: ?Sized
    {
        self._rep == other._rep
    }

    /// Replace the held reference with a share of `other`. The new reference is
    /// taken before the old one is released, so assigning a pointer to the
    /// object it already owns never destroys it.
    pub fn assign<U>(&mut self, other: &SharedPtr<U, A>)
    where U: Upcast<T> + ?Sized
    {
        *self = SharedPtr::upcast_cloned(other);
    }

    /// Replace the held reference with `other`, moving it without touching counts.
    pub fn assign_move<U>(&mut self, other: SharedPtr<U, A>)
    where U: Upcast<T> + ?Sized
    {
        *self = SharedPtr::upcast(other);
    }

    /// Release the held reference, leaving the pointer empty
    pub fn reset(&mut self) { *self = Self::null(); }

    /// Move out, leaving this pointer empty
    pub fn take(&mut self) -> Self { std::mem::take(self) }

    pub fn swap(&mut self, other: &mut Self) { std::mem::swap(self, other) }
}

impl<T, A> SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    pub fn _debug_get_ptr(&self) -> *const u8 { self._ptr.map_or(std::ptr::null(), |p| p.as_ptr() as *const u8) }
    pub fn _debug_get_rep(&self) -> *const u8 { self._rep.map_or(std::ptr::null(), |r| r.as_ptr() as *const u8) }
}

impl<T, A> Clone for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn clone(&self) -> Self {
        if let Some(rep) = self._rep {
            unsafe { rep.as_ref() }.add_strong_ref();
        }
        Self::from_parts(self._ptr, self._rep)
    }
}

impl<T, A> Drop for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn drop(&mut self) {
        if let Some(rep) = self._rep.take() {
            unsafe { ControlBlock::release_strong_ref(rep) }
        }
    }
}

impl<T, A> Default for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn default() -> Self { Self::null() }
}

impl<T, A> Deref for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        match self.get() {
            Some(v) => v,
            None => panic!("Dereferenced a null SharedPtr")
        }
    }
}

impl<T, A> From<ABox<T, A>> for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn from(value: ABox<T, A>) -> Self { Self::from_box(value) }
}

impl<T, A> PartialEq for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn eq(&self, other: &Self) -> bool { self.ptr_eq(other) }
}

impl<T, A> Eq for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone {}

impl<T, A> Debug for SharedPtr<T, A>
where T: Debug + ?Sized,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedPtr {{ data: {:?}, strong: {}, weak: {} }}",
            self.get(), self.strong_count(), self.weak_count())
    }
}

impl<T, A> Display for SharedPtr<T, A>
where T: Display + ?Sized,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "null")
        }
    }
}

impl<T, A> fmt::Pointer for SharedPtr<T, A>
where T: ?Sized,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt::Pointer::fmt(&self._debug_get_ptr(), f)
    }
}
