//! The allocation ledger: a chain of [`AllocRecord`]s, one per live
//! allocation, plus the running byte counters.
//!
//! Every block handed out looks like `[padding | AllocRecord | payload]`, and
//! callers only ever see the payload address. The question "is this address one of
//! ours?" is answered by walking the chain, never by reading the would-be
//! header in front of an address. Foreign pointers and double frees simply
//! fail to show up in the chain, so they get counted instead of crashing us.
//!
//! None of this is synchronised. Put it behind a lock (see
//! [`super::auditor::Auditor`]) if more than one thread can get at it.

use std::{marker::PhantomData, ptr::NonNull};

use serde::Serialize;

use crate::{
    alloc::{
        record::{AllocRecord, Origin, RECORD_SIZE},
        storage::{RawStorage, MIN_ALIGN},
    },
    error::LedgerError,
    serialize::serde_addr,
};

/// The running totals. Everything except `invalid_operations` is in bytes,
/// and none of them ever go down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[repr(C)]
pub struct LedgerStats {
    /// Sum of every size ever requested, including the growth part of resizes
    pub bytes_requested: usize,
    /// Sum of every size released by the program, including the shrink part
    /// of resizes
    pub bytes_freed: usize,
    /// Sum of the sizes reclaimed by [`Ledger::drain()`], i.e. leaks
    pub bytes_leaked: usize,
    /// Releases and resizes of addresses we never handed out
    pub invalid_operations: usize,
}

impl LedgerStats {
    /// What should still be reachable from `head`:
    /// `requested - freed - leaked`.
    pub const fn outstanding(&self) -> usize {
        self.bytes_requested - self.bytes_freed - self.bytes_leaked
    }
}

/// A read-only view of one record: where it came from, how big it is, and
/// the address the program got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Leak {
    pub origin: Origin,
    #[serde(serialize_with = "serde_addr::serialize")]
    pub address: *const u8,
    pub size: usize,
}

impl Leak {
    fn from_record(record: NonNull<AllocRecord>) -> Self {
        // SAFETY: only called on records that are reachable from `head`, which
        //         are live and initialized.
        let r = unsafe { record.as_ref() };
        Self {
            origin: r.origin,
            address: AllocRecord::payload_of(record).as_ptr(),
            size: r.size,
        }
    }
}

/// The chain of live allocations, backed by `S`.
pub struct Ledger<S>
where
    S: RawStorage,
{
    storage: S,
    head: Option<NonNull<AllocRecord>>,
    stats: LedgerStats,
}

// SAFETY: the ledger owns every record in its chain outright, nobody else has
// a pointer to them that they are allowed to read through.
unsafe impl<S> Send for Ledger<S> where S: RawStorage + Send {}

impl<S> Ledger<S>
where
    S: RawStorage,
{
    pub const fn new(storage: S) -> Self {
        Self {
            storage,
            head: None,
            stats: LedgerStats {
                bytes_requested: 0,
                bytes_freed: 0,
                bytes_leaked: 0,
                invalid_operations: 0,
            },
        }
    }

    pub const fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Walk the chain and add up every record's size.
    pub fn live_bytes(&self) -> usize {
        self.records().map(|leak| leak.size).sum()
    }

    /// Number of records in the chain. O(n).
    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Every live record, newest first.
    pub fn records(&self) -> Records<'_> {
        Records {
            cursor: self.head,
            _ledger: PhantomData,
        }
    }

    /// Record a new `size`-byte allocation made on behalf of `origin`, and
    /// return its payload address, aligned to [`MIN_ALIGN`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ZeroSize`] when `size == 0`, nothing is recorded
    /// - [`LedgerError::OutOfMemory`] when the storage can't fit the header
    ///   plus `size` bytes
    pub fn insert(&mut self, size: usize, origin: Origin) -> Result<NonNull<u8>, LedgerError> {
        self.insert_aligned(size, MIN_ALIGN, origin)
    }

    /// [`Ledger::insert()`] with the payload aligned to `align`. Alignments
    /// below [`MIN_ALIGN`] get [`MIN_ALIGN`]. Resizing the allocation later
    /// keeps its alignment.
    ///
    /// # Errors
    ///
    /// As [`Ledger::insert()`], plus [`LedgerError::InvalidAlignment`] when
    /// `align` is not a power of two.
    pub fn insert_aligned(
        &mut self,
        size: usize,
        align: usize,
        origin: Origin,
    ) -> Result<NonNull<u8>, LedgerError> {
        if size == 0 {
            return Err(LedgerError::ZeroSize);
        }
        if !align.is_power_of_two() {
            return Err(LedgerError::InvalidAlignment);
        }
        let align = align.max(MIN_ALIGN);
        let block_size = AllocRecord::block_size(size, align).ok_or(LedgerError::OutOfMemory)?;
        let block = self
            .storage
            .allocate(block_size, align)
            .ok_or(LedgerError::OutOfMemory)?;
        // SAFETY: the block is fresh and `block_size` bytes, which covers the
        //         header offset. The record lands on a `MIN_ALIGN` boundary,
        //         which is enough for `AllocRecord`.
        let record = unsafe {
            let record = AllocRecord::in_block(block, align);
            record.as_ptr().write(AllocRecord {
                size,
                align,
                origin,
                next: self.head,
            });
            record
        };
        self.head = Some(record);
        self.stats.bytes_requested += size;
        Ok(AllocRecord::payload_of(record))
    }

    /// Find the record whose `next` is the record belonging to `payload`.
    /// Gives back that predecessor together with the record itself. `None` if
    /// there is no such record, which includes the case where `payload`
    /// belongs to `head` (nothing points at `head`).
    fn lookup_predecessor(
        &self,
        payload: NonNull<u8>,
    ) -> Option<(NonNull<AllocRecord>, NonNull<AllocRecord>)> {
        let target = AllocRecord::candidate_for(payload);
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: `node` is reachable from `head`, so it is live
            let next = unsafe { node.as_ref() }.next;
            match next {
                Some(record) if record.as_ptr() as usize == target => return Some((node, record)),
                _ => cursor = next,
            }
        }
        None
    }

    /// Where the record for `payload` is linked from, if it is linked at all.
    fn find_link(&self, payload: NonNull<u8>) -> Option<Link> {
        let target = AllocRecord::candidate_for(payload);
        match self.head {
            Some(head) if head.as_ptr() as usize == target => Some(Link::Head(head)),
            _ => self
                .lookup_predecessor(payload)
                .map(|(pred, record)| Link::After { pred, record }),
        }
    }

    /// Was `payload` handed out by this ledger, and not released yet?
    pub fn owns(&self, payload: *const u8) -> bool {
        NonNull::new(payload as *mut u8).is_some_and(|payload| self.find_link(payload).is_some())
    }

    /// Point `link` at `record` instead of whatever it pointed at before.
    fn relink(&mut self, link: Link, record: Option<NonNull<AllocRecord>>) {
        match link {
            Link::Head(_) => self.head = record,
            // SAFETY: predecessors come from the chain, so they are live, and
            //         we have `&mut self` so nobody else is looking at them.
            Link::After { mut pred, .. } => unsafe { pred.as_mut() }.next = record,
        }
    }

    /// Resize the allocation at `payload` to `new_size` bytes, re-attributing
    /// it to `origin`. Follows `realloc()`:
    ///
    /// - `payload == None` is [`Ledger::insert()`]
    /// - `new_size == 0` is [`Ledger::remove()`], and gives
    ///   [`LedgerError::ZeroSize`] back
    ///
    /// The allocation keeps the alignment it was made with.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAddress`] when `payload` isn't ours; this is
    ///   counted and nothing else changes
    /// - [`LedgerError::OutOfMemory`] when the storage can't resize the block;
    ///   the old allocation stays exactly as it was
    ///
    /// # Safety
    ///
    /// `payload` is `None`, an address this ledger does not currently own, or
    /// a live allocation from this ledger that nothing will read or write
    /// through again. On success only the returned address may be used.
    pub unsafe fn update(
        &mut self,
        payload: Option<NonNull<u8>>,
        new_size: usize,
        origin: Origin,
    ) -> Result<NonNull<u8>, LedgerError> {
        let Some(payload) = payload else {
            return self.insert(new_size, origin);
        };
        if new_size == 0 {
            // SAFETY: same contract as ours
            unsafe { self.remove(payload.as_ptr()) }?;
            return Err(LedgerError::ZeroSize);
        }
        let Some(link) = self.find_link(payload) else {
            self.stats.invalid_operations += 1;
            return Err(LedgerError::InvalidAddress);
        };

        let record = link.record();
        // SAFETY: reachable, so live
        let AllocRecord {
            size: old_size,
            align,
            ..
        } = *unsafe { record.as_ref() };
        let new_block_size =
            AllocRecord::block_size(new_size, align).ok_or(LedgerError::OutOfMemory)?;
        let old_block_size = AllocRecord::header_offset(align) + old_size;
        // SAFETY: `record` sits in a live block of `old_block_size` bytes from
        //         our storage, placed with `align`
        let record = unsafe {
            if align <= MIN_ALIGN {
                self.storage
                    .resize(
                        AllocRecord::block_of(record, align),
                        old_block_size,
                        new_block_size,
                    )
                    .map(|block| AllocRecord::in_block(block, align))
            } else {
                self.relocate(record, old_block_size, new_block_size, align)
            }
        }
        .ok_or(LedgerError::OutOfMemory)?;

        // The block may have moved, in which case `link` still points at the
        // old address.
        self.relink(link, Some(record));
        // SAFETY: the header bytes came along with the block, so this is still
        //         an initialized record, and we own it.
        let r = unsafe { &mut *record.as_ptr() };
        r.size = new_size;
        r.origin = origin;

        if new_size > old_size {
            self.stats.bytes_requested += new_size - old_size;
        } else {
            self.stats.bytes_freed += old_size - new_size;
        }
        Ok(AllocRecord::payload_of(record))
    }

    /// Resize an over-aligned block by hand. `realloc()` only promises
    /// [`MIN_ALIGN`], so allocate a fresh block, copy the record and what
    /// survives of the payload, then let go of the old one.
    ///
    /// # Safety
    ///
    /// `record` sits in a live block of `old_block_size` bytes from our
    /// storage, placed with `align`.
    unsafe fn relocate(
        &mut self,
        record: NonNull<AllocRecord>,
        old_block_size: usize,
        new_block_size: usize,
        align: usize,
    ) -> Option<NonNull<AllocRecord>> {
        let block = self.storage.allocate(new_block_size, align)?;
        let lead = AllocRecord::header_offset(align) - RECORD_SIZE;
        let kept = old_block_size.min(new_block_size) - lead;
        // SAFETY: both blocks hold at least `lead + kept` bytes, and the new
        //         one is fresh, so they don't overlap
        unsafe {
            let moved = AllocRecord::in_block(block, align);
            record
                .as_ptr()
                .cast::<u8>()
                .copy_to_nonoverlapping(moved.as_ptr().cast(), kept);
            self.storage
                .release(AllocRecord::block_of(record, align), old_block_size, align);
            Some(moved)
        }
    }

    /// Release the allocation at `payload`. Null is a no-op.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAddress`] when `payload` isn't ours (never
    ///   handed out, or already released). This is counted, and nothing is
    ///   freed.
    ///
    /// # Safety
    ///
    /// `payload` is null, an address this ledger does not currently own, or a
    /// live allocation from this ledger that nothing will read or write
    /// through again.
    pub unsafe fn remove(&mut self, payload: *mut u8) -> Result<(), LedgerError> {
        let Some(payload) = NonNull::new(payload) else {
            return Ok(());
        };
        let Some(link) = self.find_link(payload) else {
            self.stats.invalid_operations += 1;
            return Err(LedgerError::InvalidAddress);
        };
        let record = link.record();
        // SAFETY: reachable, so live
        let AllocRecord {
            size, align, next, ..
        } = *unsafe { record.as_ref() };
        self.relink(link, next);
        self.stats.bytes_freed += size;
        // SAFETY: unlinked above, so nothing can reach it any more
        unsafe { self.release_record(record, size, align) };
        Ok(())
    }

    /// Hand the block `record` lives in back to the storage.
    ///
    /// # Safety
    ///
    /// `record` is unlinked, and `size` and `align` are what it says.
    unsafe fn release_record(&mut self, record: NonNull<AllocRecord>, size: usize, align: usize) {
        let block_size = AllocRecord::header_offset(align) + size;
        // SAFETY: forwarded from the caller
        unsafe {
            self.storage
                .release(AllocRecord::block_of(record, align), block_size, align)
        };
    }

    /// Unlink every remaining record, newest first, handing each one out as a
    /// [`Leak`] and giving its memory back. The sizes go into
    /// [`LedgerStats::bytes_leaked`]. Dropping the [`Drain`] early still
    /// reclaims everything.
    pub fn drain(&mut self) -> Drain<'_, S> {
        Drain { ledger: self }
    }

    /// Pop `head` and give it back to the storage.
    fn reclaim_head(&mut self) -> Option<Leak> {
        let record = self.head?;
        let leak = Leak::from_record(record);
        // SAFETY: head is live
        let AllocRecord { align, next, .. } = *unsafe { record.as_ref() };
        self.head = next;
        self.stats.bytes_leaked += leak.size;
        // SAFETY: unlinked above
        unsafe { self.release_record(record, leak.size, align) };
        Some(leak)
    }
}

impl<S> Drop for Ledger<S>
where
    S: RawStorage,
{
    fn drop(&mut self) {
        self.drain().for_each(drop);
    }
}

/// Which pointer in the chain refers to a record: `head` itself or the
/// `next` field of `pred`. Carries the record it refers to.
#[derive(Clone, Copy)]
enum Link {
    Head(NonNull<AllocRecord>),
    After {
        pred: NonNull<AllocRecord>,
        record: NonNull<AllocRecord>,
    },
}

impl Link {
    const fn record(self) -> NonNull<AllocRecord> {
        match self {
            Link::Head(record) | Link::After { record, .. } => record,
        }
    }
}

/// Iterator returned by [`Ledger::records()`]
pub struct Records<'a> {
    cursor: Option<NonNull<AllocRecord>>,
    _ledger: PhantomData<&'a ()>,
}

impl Iterator for Records<'_> {
    type Item = Leak;

    fn next(&mut self) -> Option<Leak> {
        let record = self.cursor?;
        // SAFETY: the borrow on the ledger keeps the chain alive and unchanged
        self.cursor = unsafe { record.as_ref() }.next;
        Some(Leak::from_record(record))
    }
}

/// Iterator returned by [`Ledger::drain()`]
pub struct Drain<'a, S>
where
    S: RawStorage,
{
    ledger: &'a mut Ledger<S>,
}

impl<S> Iterator for Drain<'_, S>
where
    S: RawStorage,
{
    type Item = Leak;

    fn next(&mut self) -> Option<Leak> {
        self.ledger.reclaim_head()
    }
}

impl<S> Drop for Drain<'_, S>
where
    S: RawStorage,
{
    fn drop(&mut self) {
        while self.ledger.reclaim_head().is_some() {}
    }
}
