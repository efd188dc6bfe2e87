//! The header that sits in front of every payload handed out by the ledger.
//!
//! ```plaintext
//! +--------------------+ <- what the storage backend returned
//! | padding...         | header_offset(align) - RECORD_SIZE bytes
//! +--------------------+
//! | AllocRecord        |
//! | padding...         | RECORD_SIZE bytes
//! +--------------------+ <- payload address, what the caller gets
//! | requested size     | record.size bytes
//! +--------------------+
//! ```
//!
//! The leading padding is only there for payloads aligned above
//! [`MIN_ALIGN`]. Either way the record is exactly `RECORD_SIZE` bytes in
//! front of the payload.
//!
//! Nothing outside of [`super::ledger`] gets to do the offset arithmetic.

use std::{fmt, mem, ptr::NonNull};

use serde::Serialize;

use crate::{alloc::storage::MIN_ALIGN, serialize::serde_addr, util::num::round_up};

/// Who asked for an allocation. Both halves are opaque to the ledger, they
/// only get carried around so the leak report can say where a leak came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Origin {
    /// The module (executable, shared object, crate...) that made the request.
    pub label: &'static str,
    /// Address of the instruction that made the request. 0 when unknown.
    #[serde(serialize_with = "serde_addr::serialize")]
    pub address: usize,
}

impl Origin {
    /// What we record when attribution failed.
    pub const UNKNOWN: Origin = Origin::new("<unknown>", 0);

    /// Attribution for allocations coming through `GlobalAlloc`.
    pub const RUST: Origin = Origin::new("<rust global allocator>", 0);

    pub const fn new(label: &'static str, address: usize) -> Self {
        Self { label, address }
    }

    /// No call site to resolve
    pub const fn is_unknown(&self) -> bool {
        self.address == 0
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "{} ??", self.label)
        } else {
            write!(f, "{} {:#x}", self.label, self.address)
        }
    }
}

/// Metadata for one live allocation. Always lives `RECORD_SIZE` bytes in
/// front of its payload.
#[repr(C)]
pub(crate) struct AllocRecord {
    /// The exact number of bytes the caller asked for (no header).
    pub(crate) size: usize,
    /// What the block was allocated with. A power of two, at least
    /// [`MIN_ALIGN`].
    pub(crate) align: usize,
    pub(crate) origin: Origin,
    /// The next record in the chain, `None` at the tail.
    pub(crate) next: Option<NonNull<AllocRecord>>,
}

/// Distance between a record and its payload. Rounded so that the payload
/// keeps the alignment the storage gave the record.
pub(crate) const RECORD_SIZE: usize = match round_up(mem::size_of::<AllocRecord>(), MIN_ALIGN) {
    Some(size) => size,
    None => panic!("record header does not fit in usize"),
};

const _: () = assert!(mem::align_of::<AllocRecord>() <= MIN_ALIGN);

impl AllocRecord {
    /// Distance from the start of a block to its payload. `align` must be a
    /// power of two no smaller than [`MIN_ALIGN`].
    pub(crate) const fn header_offset(align: usize) -> usize {
        if align >= RECORD_SIZE {
            align
        } else {
            // align < RECORD_SIZE, so this can't overflow
            (RECORD_SIZE + align - 1) & !(align - 1)
        }
    }

    /// The size of the whole block (padding, header and payload) for a
    /// `size`-byte request, or `None` if that would overflow.
    pub(crate) const fn block_size(size: usize, align: usize) -> Option<usize> {
        size.checked_add(Self::header_offset(align))
    }

    /// Where the record goes in a block allocated with `align`.
    ///
    /// # Safety
    ///
    /// `block` must be at least `header_offset(align)` bytes long.
    pub(crate) unsafe fn in_block(block: NonNull<u8>, align: usize) -> NonNull<AllocRecord> {
        let lead = Self::header_offset(align) - RECORD_SIZE;
        // SAFETY: in bounds per the caller
        unsafe { NonNull::new_unchecked(block.as_ptr().add(lead)).cast() }
    }

    /// Start of the block that `record`, allocated with `align`, lives in.
    ///
    /// # Safety
    ///
    /// `record` must have been placed with [`AllocRecord::in_block()`] using
    /// the same `align`.
    pub(crate) unsafe fn block_of(record: NonNull<AllocRecord>, align: usize) -> NonNull<u8> {
        let lead = Self::header_offset(align) - RECORD_SIZE;
        // SAFETY: undoes `in_block()`
        unsafe { NonNull::new_unchecked(record.as_ptr().cast::<u8>().sub(lead)) }
    }

    /// Address of the payload that belongs to the record at `record`
    pub(crate) fn payload_of(record: NonNull<AllocRecord>) -> NonNull<u8> {
        // SAFETY: every record is followed by at least `RECORD_SIZE` bytes of
        //         its block, so this is at most one past the end.
        unsafe { NonNull::new_unchecked(record.as_ptr().cast::<u8>().add(RECORD_SIZE)) }
    }

    /// Address where the record for `payload` would be, *if* `payload` was
    /// one of ours. Only ever compared against, never dereferenced before the
    /// chain says it's real.
    pub(crate) fn candidate_for(payload: NonNull<u8>) -> usize {
        (payload.as_ptr() as usize).wrapping_sub(RECORD_SIZE)
    }
}
