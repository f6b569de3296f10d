//! Tagged atomic pointers.
//!
//! Every link in the queue is an [`Atomic`] whose least significant bit doubles as the Harris
//! deletion mark. Nodes are heap allocated through `Box`, so they are always aligned well beyond
//! the single bit we borrow.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::scope::Scope;

/// Given ordering for the success case in a compare-exchange operation, returns the strongest
/// appropriate ordering for the failure case.
#[inline]
fn strongest_failure_ordering(ord: Ordering) -> Ordering {
    use self::Ordering::*;
    match ord {
        Relaxed | Release => Relaxed,
        Acquire | AcqRel => Acquire,
        _ => SeqCst,
    }
}

/// Panics if the pointer is not properly aligned.
#[inline]
fn ensure_aligned<T>(raw: *const T) {
    assert!(raw as usize & low_bits::<T>() == 0, "unaligned pointer");
}

/// Returns a bitmask containing the unused least significant bits of an aligned pointer to `T`.
#[inline]
fn low_bits<T>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

/// Given a tagged pointer `data`, returns the same pointer, but tagged with `tag`.
#[inline]
fn data_with_tag<T>(data: usize, tag: usize) -> usize {
    let mask = low_bits::<T>();
    assert!(tag <= mask, "tag too large to fit into the unused bits: {} > {}", tag, mask);
    (data & !mask) | tag
}

/// An atomic, possibly tagged, pointer shared between threads.
///
/// Loading requires a [`Scope`], which bounds the lifetime of the returned [`Ptr`] to the queue
/// operation that produced it.
pub struct Atomic<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Returns a new null atomic pointer.
    pub fn null() -> Self {
        Atomic {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Returns a new atomic pointer pointing to `ptr`, tag included.
    pub fn from_ptr(ptr: Ptr<T>) -> Self {
        Atomic {
            data: AtomicUsize::new(ptr.data),
            _marker: PhantomData,
        }
    }

    /// Returns a new atomic pointer taking ownership of `owned`.
    pub fn from_owned(owned: Owned<T>) -> Self {
        let data = owned.data;
        mem::forget(owned);
        Atomic {
            data: AtomicUsize::new(data),
            _marker: PhantomData,
        }
    }

    /// Loads a `Ptr` from the atomic pointer.
    pub fn load<'scope>(&self, ord: Ordering, _: &'scope Scope) -> Ptr<'scope, T> {
        Ptr::from_data(self.data.load(ord))
    }

    /// Stores a `Ptr` into the atomic pointer.
    pub fn store(&self, new: Ptr<T>, ord: Ordering) {
        self.data.store(new.data, ord);
    }

    /// Stores a `Ptr` into the atomic pointer, returning the previous `Ptr`.
    pub fn swap<'scope>(&self, new: Ptr<T>, ord: Ordering, _: &'scope Scope) -> Ptr<'scope, T> {
        Ptr::from_data(self.data.swap(new.data, ord))
    }

    /// Stores `new` if the current value is the same as `current`, tags included.
    ///
    /// On failure the actual current value is returned.
    pub fn compare_and_set<'scope>(
        &self,
        current: Ptr<T>,
        new: Ptr<T>,
        ord: Ordering,
        _: &'scope Scope,
    ) -> Result<(), Ptr<'scope, T>> {
        let fail_ord = strongest_failure_ordering(ord);
        self.data
            .compare_exchange(current.data, new.data, ord, fail_ord)
            .map(|_| ())
            .map_err(Ptr::from_data)
    }

    /// Stores `new` if the current value is the same as `current`.
    ///
    /// On success the published pointer is returned. On failure ownership of `new` is handed
    /// back together with the actual current value.
    pub fn compare_and_set_owned<'scope>(
        &self,
        current: Ptr<T>,
        new: Owned<T>,
        ord: Ordering,
        _: &'scope Scope,
    ) -> Result<Ptr<'scope, T>, (Ptr<'scope, T>, Owned<T>)> {
        let fail_ord = strongest_failure_ordering(ord);
        match self.data.compare_exchange(current.data, new.data, ord, fail_ord) {
            Ok(_) => {
                let data = new.data;
                mem::forget(new);
                Ok(Ptr::from_data(data))
            }
            Err(previous) => Err((Ptr::from_data(previous), new)),
        }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Atomic::null()
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let data = self.data.load(Ordering::Relaxed);
        f.debug_struct("Atomic")
            .field("raw", &((data & !low_bits::<T>()) as *const T))
            .field("tag", &(data & low_bits::<T>()))
            .finish()
    }
}

/// An owned heap-allocated object, similar to `Box<T>`.
///
/// Dropping an `Owned` frees the object. Ownership is given up by publishing it into an
/// [`Atomic`] or by converting it into a [`Ptr`].
pub struct Owned<T> {
    data: usize,
    _marker: PhantomData<Box<T>>,
}

unsafe impl<T: Send> Send for Owned<T> {}

impl<T> Owned<T> {
    /// Allocates `value` on the heap and returns a new owned pointer pointing to it.
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Returns a new owned pointer initialized with `b`.
    pub fn from_box(b: Box<T>) -> Self {
        let raw = Box::into_raw(b);
        ensure_aligned(raw);
        Owned {
            data: raw as usize,
            _marker: PhantomData,
        }
    }

    /// Converts the owned pointer to a [`Ptr`], leaking the allocation into the structure.
    pub fn into_ptr<'scope>(self, _: &'scope Scope) -> Ptr<'scope, T> {
        let data = self.data;
        mem::forget(self);
        Ptr::from_data(data)
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        let raw = (self.data & !low_bits::<T>()) as *mut T;
        unsafe {
            drop(Box::from_raw(raw));
        }
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*((self.data & !low_bits::<T>()) as *const T) }
    }
}

impl<T> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *((self.data & !low_bits::<T>()) as *mut T) }
    }
}

/// A pointer loaded from an [`Atomic`], valid for use only within `'scope`.
pub struct Ptr<'scope, T: 'scope> {
    data: usize,
    _marker: PhantomData<&'scope T>,
}

impl<'scope, T> Clone for Ptr<'scope, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'scope, T> Copy for Ptr<'scope, T> {}

impl<'scope, T> PartialEq for Ptr<'scope, T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<'scope, T> Eq for Ptr<'scope, T> {}

impl<'scope, T> fmt::Debug for Ptr<'scope, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ptr")
            .field("raw", &self.as_raw())
            .field("tag", &self.tag())
            .finish()
    }
}

impl<'scope, T> Ptr<'scope, T> {
    fn from_data(data: usize) -> Self {
        Ptr {
            data,
            _marker: PhantomData,
        }
    }

    /// Returns a new null pointer.
    pub fn null() -> Self {
        Self::from_data(0)
    }

    /// Returns a new pointer initialized with `raw`.
    ///
    /// # Panics
    ///
    /// Panics if `raw` is not properly aligned.
    pub fn from_raw(raw: *const T) -> Self {
        ensure_aligned(raw);
        Self::from_data(raw as usize)
    }

    /// Returns `true` if the pointer is null, ignoring the tag.
    pub fn is_null(&self) -> bool {
        self.as_raw().is_null()
    }

    /// Converts the pointer to a raw pointer (without the tag).
    pub fn as_raw(&self) -> *const T {
        (self.data & !low_bits::<T>()) as *const T
    }

    /// Dereferences the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and the pointee must not have been reclaimed.
    pub unsafe fn deref(&self) -> &'scope T {
        &*self.as_raw()
    }

    /// Converts the pointer to a reference, or `None` if it is null.
    ///
    /// # Safety
    ///
    /// A non-null pointee must not have been reclaimed.
    pub unsafe fn as_ref(&self) -> Option<&'scope T> {
        self.as_raw().as_ref()
    }

    /// Takes back ownership of the pointee.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, unreachable by every other thread, and not owned elsewhere.
    pub unsafe fn into_owned(self) -> Owned<T> {
        Owned {
            data: self.as_raw() as usize,
            _marker: PhantomData,
        }
    }

    /// Returns the tag stored within the pointer.
    pub fn tag(&self) -> usize {
        self.data & low_bits::<T>()
    }

    /// Returns the same pointer, but tagged with `tag`.
    pub fn with_tag(&self, tag: usize) -> Self {
        Self::from_data(data_with_tag::<T>(self.data, tag))
    }

    /// Returns `true` if the deletion mark is set.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.data & 1 == 1
    }

    /// Returns the same pointer with the deletion mark set.
    #[inline]
    pub fn marked(&self) -> Self {
        self.with_tag(1)
    }

    /// Returns the same pointer with the deletion mark cleared.
    #[inline]
    pub fn unmarked(&self) -> Self {
        self.with_tag(0)
    }
}

impl<'scope, T> Default for Ptr<'scope, T> {
    fn default() -> Self {
        Ptr::null()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use super::*;
    use crate::scope::unprotected;

    #[test]
    fn mark_round_trip() {
        unsafe {
            unprotected(|scope| {
                let p = Owned::new(7u64).into_ptr(scope);
                assert!(!p.is_marked());
                let m = p.marked();
                assert!(m.is_marked());
                assert_eq!(m.as_raw(), p.as_raw());
                assert_ne!(m, p);
                assert_eq!(m.unmarked(), p);
                drop(p.into_owned());
            })
        }
    }

    #[test]
    fn compare_and_set_respects_mark() {
        unsafe {
            unprotected(|scope| {
                let p = Owned::new(1u64).into_ptr(scope);
                let a = Atomic::from_ptr(p.marked());

                // An unmarked expectation must not match a marked link.
                assert!(a.compare_and_set(p, Ptr::null(), SeqCst, scope).is_err());
                assert!(a.compare_and_set(p.marked(), Ptr::null(), SeqCst, scope).is_ok());
                assert!(a.load(SeqCst, scope).is_null());
                drop(p.into_owned());
            })
        }
    }

    #[test]
    fn owned_returned_on_failure() {
        unsafe {
            unprotected(|scope| {
                let a = Atomic::from_owned(Owned::new(1u64));
                let cur = a.load(SeqCst, scope);
                let (actual, back) = a
                    .compare_and_set_owned(Ptr::null(), Owned::new(2u64), SeqCst, scope)
                    .unwrap_err();
                assert_eq!(actual, cur);
                assert_eq!(*back, 2);
                drop(cur.into_owned());
            })
        }
    }

    #[test]
    #[should_panic(expected = "tag too large")]
    fn tag_overflow() {
        let p = Ptr::<u8>::null();
        p.with_tag(1);
    }
}
