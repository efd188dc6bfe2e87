//! Where the ledger's blocks actually come from.
//!
//! The ledger never hands out memory itself, it asks a [`RawStorage`] for a
//! block big enough for a record *and* the payload, and gives it back when the
//! allocation is released (or leaked and reclaimed at shutdown).

use std::ptr::{self, NonNull};

use dlmalloc::Dlmalloc;
use libc::c_void;

use crate::util::{assert::aligned_to, hint::cold};

/// Every block a [`RawStorage`] returns is aligned to at least this.
pub const MIN_ALIGN: usize = 16;

/// A malloc-shaped source of raw memory.
///
/// # Safety
///
/// - `allocate()` must return blocks aligned to the requested alignment (and
///   never less than [`MIN_ALIGN`]) that are valid for reads and writes of the
///   requested size, and that overlap no other live block.
/// - `resize()` is only ever handed [`MIN_ALIGN`] blocks and must keep that
///   alignment. A failed `resize()` must leave the original block untouched.
/// - Implementations must not allocate through the Rust global allocator, the
///   ledger may *be* the global allocator.
pub unsafe trait RawStorage {
    /// Allocate `size` bytes (`size > 0`) aligned to `align`, a power of two
    /// no smaller than [`MIN_ALIGN`]. `None` if there is no memory.
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Grow or shrink the block at `block` from `old_size` to `new_size`
    /// bytes, moving it if needed. The contents up to the smaller size are
    /// preserved.
    ///
    /// # Safety
    ///
    /// `block` must be a live block from this storage, of `old_size` bytes,
    /// allocated with [`MIN_ALIGN`].
    unsafe fn resize(
        &mut self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Give back the block at `block`, of `size` bytes.
    ///
    /// # Safety
    ///
    /// `block` must be a live block from this storage, of `size` bytes,
    /// allocated with `align`. It must not be used afterwards.
    unsafe fn release(&mut self, block: NonNull<u8>, size: usize, align: usize);
}

/// The platform's `malloc()`/`realloc()`/`free()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStorage;

// SAFETY: glibc and the BSD libcs guarantee `alignof(max_align_t)` (16 on
// every 64-bit target we care about) from `malloc()`, anything bigger goes
// through `posix_memalign()`. Checked in debug builds.
unsafe impl RawStorage for SystemStorage {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let block = if align <= MIN_ALIGN {
            // SAFETY: `malloc()` has no preconditions
            unsafe { libc::malloc(size) }
        } else {
            let mut block = ptr::null_mut();
            // SAFETY: `align` is a power of two and a multiple of
            //         `sizeof(void *)`
            if unsafe { libc::posix_memalign(&mut block, align, size) } != 0 {
                return cold(|| None);
            }
            block
        };
        let block = NonNull::new(block as *mut u8).or_else(|| cold(|| None))?;
        debug_assert!(aligned_to(block.as_ptr(), align));
        Some(block)
    }

    unsafe fn resize(
        &mut self,
        block: NonNull<u8>,
        _: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `block` came from `malloc()` and is live.
        //         `realloc()` leaves it alone when it fails.
        let block = unsafe { libc::realloc(block.as_ptr() as *mut c_void, new_size) } as *mut u8;
        let block = NonNull::new(block).or_else(|| cold(|| None))?;
        debug_assert!(aligned_to(block.as_ptr(), MIN_ALIGN));
        Some(block)
    }

    unsafe fn release(&mut self, block: NonNull<u8>, _: usize, _: usize) {
        // SAFETY: identical contract to the caller, and `posix_memalign()`
        //         blocks go back through `free()` too
        unsafe { libc::free(block.as_ptr() as *mut c_void) }
    }
}

/// A private heap run by `dlmalloc`, mapped straight from the OS. Nothing it
/// does goes through the platform `malloc()`, so an interposer that routes
/// `malloc()` into the ledger does not end up calling itself.
///
/// See https://gee.cs.oswego.edu/dl/html/malloc.html
pub struct DlMallocStorage(Dlmalloc);

impl DlMallocStorage {
    pub const fn new() -> Self {
        Self(Dlmalloc::new())
    }
}

impl Default for DlMallocStorage {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the dlmalloc state is only reachable through `&mut self`, which the
// ledger only hands out under its lock.
unsafe impl Send for DlMallocStorage {}

// SAFETY: dlmalloc hands back whatever alignment it is asked for, and leaves
// the old block alone when `realloc()` fails.
unsafe impl RawStorage for DlMallocStorage {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // SAFETY: `size` is non-zero and `align` is a power of two
        let block = unsafe { self.0.malloc(size, align) };
        NonNull::new(block).or_else(|| cold(|| None))
    }

    unsafe fn resize(
        &mut self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `block` is live, from us, `old_size`
        //         bytes and allocated with `MIN_ALIGN`.
        let block = unsafe { self.0.realloc(block.as_ptr(), old_size, MIN_ALIGN, new_size) };
        NonNull::new(block).or_else(|| cold(|| None))
    }

    unsafe fn release(&mut self, block: NonNull<u8>, size: usize, align: usize) {
        // SAFETY: identical contract to the caller
        unsafe { self.0.free(block.as_ptr(), size, align) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<S: RawStorage>(storage: &mut S) {
        let block = storage.allocate(24, MIN_ALIGN).expect("24 bytes should be available");
        assert!(aligned_to(block.as_ptr(), MIN_ALIGN));
        // SAFETY: the block is 24 bytes and ours
        unsafe {
            block.as_ptr().write_bytes(0xab, 24);
            let block = storage.resize(block, 24, 4096).expect("4 KiB should be available");
            assert!(aligned_to(block.as_ptr(), MIN_ALIGN));
            assert_eq!(std::slice::from_raw_parts(block.as_ptr(), 24), &[0xab; 24]);
            storage.release(block, 4096, MIN_ALIGN);
        }

        for align in [32, 128, 4096] {
            let block = storage.allocate(100, align).expect("100 bytes should be available");
            assert!(aligned_to(block.as_ptr(), align), "not aligned to {align}");
            // SAFETY: the block is 100 bytes and ours
            unsafe {
                block.as_ptr().write_bytes(0xcd, 100);
                storage.release(block, 100, align);
            }
        }
    }

    #[test]
    fn system_storage_round_trips_a_block() {
        exercise(&mut SystemStorage);
    }

    #[test]
    fn dlmalloc_storage_round_trips_a_block() {
        exercise(&mut DlMallocStorage::new());
    }
}
