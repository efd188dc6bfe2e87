//! The four malloc-shaped entry points, wrapped around a locked [`Ledger`].
//!
//! Every entry point takes the ledger lock for the whole operation, so the
//! ownership check and the counter updates of a resize happen as one step.
//! Misuse (foreign pointers, double frees, zero sizes) never panics, it turns
//! into a null pointer and, where it's the caller's fault, a bump of
//! [`LedgerStats::invalid_operations`].

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    alloc::{
        ledger::{Ledger, LedgerStats},
        record::Origin,
        storage::{RawStorage, MIN_ALIGN},
    },
    util::hint::cold,
};

/// An allocation auditor backed by `S`. `const`-constructible, so it can be a
/// `static`, and it implements [`GlobalAlloc`] so it can be the
/// `#[global_allocator]`.
pub struct Auditor<S>
where
    S: RawStorage,
{
    ledger: Mutex<Ledger<S>>,
}

impl<S> Auditor<S>
where
    S: RawStorage,
{
    pub const fn new(storage: S) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(storage)),
        }
    }

    /// Take the ledger lock. A panic while holding it can't leave the chain
    /// half-edited (nothing between a link and an unlink can panic), so a
    /// poisoned lock is just taken anyway.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Ledger<S>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `malloc()`. Null for `size == 0` and when out of memory.
    pub fn allocate(&self, size: usize, origin: Origin) -> *mut u8 {
        self.allocate_aligned(size, MIN_ALIGN, origin)
    }

    /// `aligned_alloc()`. As [`Auditor::allocate()`], with the payload
    /// aligned to `align`. Null if `align` isn't a power of two. Later resizes
    /// keep the alignment.
    pub fn allocate_aligned(&self, size: usize, align: usize, origin: Origin) -> *mut u8 {
        match self.lock().insert_aligned(size, align, origin) {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// `calloc()`. Null if `count * element_size` is zero, overflows, or
    /// doesn't fit. Only the payload is zeroed.
    pub fn zero_allocate(&self, count: usize, element_size: usize, origin: Origin) -> *mut u8 {
        let Some(size) = count.checked_mul(element_size) else {
            return cold(ptr::null_mut);
        };
        let payload = self.allocate(size, origin);
        if !payload.is_null() {
            // SAFETY: `allocate()` succeeded, so `payload` is valid for writes
            //         of `size` bytes
            unsafe { payload.write_bytes(0, size) };
        }
        payload
    }

    /// `realloc()`. A null `payload` allocates, a zero `new_size` releases
    /// and gives back null. Null when `payload` isn't ours (counted) or the
    /// storage can't resize, in which case the old allocation is untouched.
    ///
    /// # Safety
    ///
    /// `payload` is null, an address this auditor does not currently own, or
    /// a live allocation from this auditor that no live value still uses. If
    /// the result is non-null, `payload` must not be used again.
    pub unsafe fn resize(&self, payload: *mut u8, new_size: usize, origin: Origin) -> *mut u8 {
        // SAFETY: same contract as ours
        match unsafe { self.lock().update(NonNull::new(payload), new_size, origin) } {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// `free()`. Null is a no-op, anything that isn't ours is counted and
    /// ignored.
    ///
    /// # Safety
    ///
    /// `payload` is null, an address this auditor does not currently own, or
    /// a live allocation from this auditor that no live value still uses.
    pub unsafe fn release(&self, payload: *mut u8) {
        // SAFETY: same contract as ours
        let _ = unsafe { self.lock().remove(payload) };
    }

    pub fn stats(&self) -> LedgerStats {
        self.lock().stats()
    }

    /// Is `payload` a live allocation from this auditor?
    pub fn owns(&self, payload: *const u8) -> bool {
        self.lock().owns(payload)
    }

    /// Run `f` with the ledger locked, e.g. to walk the live records.
    ///
    /// `f` must not allocate through this auditor: if this is the global
    /// allocator, that means no `Vec`, `String`, `format!()`...
    pub fn inspect<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Ledger<S>) -> R,
    {
        f(&self.lock())
    }
}

impl<S> Default for Auditor<S>
where
    S: RawStorage + Default,
{
    fn default() -> Self {
        Self::new(S::default())
    }
}

// SAFETY: payloads get the layout's alignment, and keep it across resizes.
// `dealloc()` and `realloc()` are only handed blocks we gave out.
unsafe impl<S> GlobalAlloc for Auditor<S>
where
    S: RawStorage,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align(), Origin::RUST)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let payload = self.allocate_aligned(layout.size(), layout.align(), Origin::RUST);
        if !payload.is_null() {
            // SAFETY: just allocated with `layout.size()` bytes
            unsafe { payload.write_bytes(0, layout.size()) };
        }
        payload
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        // SAFETY: `ptr` came from us and the caller is done with it
        unsafe { self.release(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, _: Layout, new_size: usize) -> *mut u8 {
        // `GlobalAlloc` never asks for a resize to zero, and `ptr` is never
        // null, so this is always a plain resize.
        // SAFETY: `ptr` came from us, the caller only uses the result
        unsafe { self.resize(ptr, new_size, Origin::RUST) }
    }
}
