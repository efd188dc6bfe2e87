use std::ptr;

use memledger::{Auditor, DlMallocStorage, Leak, Origin, RawStorage, SystemStorage};
use rand::{rngs::StdRng, Rng, SeedableRng};

const MAIN: Origin = Origin::new("./a.out", 0x401136);
const LIB: Origin = Origin::new("/usr/lib/libfoo.so", 0x7f00_0000_1234);

fn records<S: RawStorage>(auditor: &Auditor<S>) -> Vec<Leak> {
    auditor.inspect(|ledger| ledger.records().collect())
}

fn assert_balanced<S: RawStorage>(auditor: &Auditor<S>) {
    auditor.inspect(|ledger| {
        assert_eq!(ledger.stats().outstanding(), ledger.live_bytes());
    });
}

#[test]
fn allocate_allocate_release_first() {
    let auditor = Auditor::new(SystemStorage);
    let first = auditor.allocate(100, MAIN);
    let second = auditor.allocate(50, MAIN);
    assert!(!first.is_null() && !second.is_null());
    unsafe { auditor.release(first) };

    let stats = auditor.stats();
    assert_eq!(stats.bytes_requested, 150);
    assert_eq!(stats.bytes_freed, 100);
    assert_eq!(auditor.inspect(|l| l.live_bytes()), 50);
    assert_eq!(records(&auditor).len(), 1);
    assert_balanced(&auditor);
}

#[test]
fn allocate_then_grow() {
    let auditor = Auditor::new(SystemStorage);
    let p = auditor.allocate(64, MAIN);
    let p = unsafe { auditor.resize(p, 128, LIB) };
    assert!(!p.is_null());

    // 64 for the allocation, 64 for the growth
    let stats = auditor.stats();
    assert_eq!(stats.bytes_requested, 128);
    assert_eq!(stats.bytes_freed, 0);
    let records = records(&auditor);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].size, 128);
    assert_eq!(records[0].origin, LIB);
    assert_eq!(records[0].address, p as *const u8);
}

#[test]
fn double_free_counts_once() {
    let auditor = Auditor::new(SystemStorage);
    let p = auditor.allocate(10, MAIN);
    unsafe { auditor.release(p) };
    let after_first = auditor.stats();
    unsafe { auditor.release(p) };

    let stats = auditor.stats();
    assert_eq!(stats.invalid_operations, 1);
    assert_eq!(stats.bytes_freed, after_first.bytes_freed);
    assert_eq!(stats.bytes_requested, after_first.bytes_requested);
}

#[test]
fn foreign_release_changes_nothing_but_the_count() {
    let auditor = Auditor::new(SystemStorage);
    let keep = auditor.allocate(32, MAIN);
    let mut on_stack = [0u64; 8];
    // SAFETY: plain libc malloc, freed below
    let from_libc = unsafe { libc::malloc(32) } as *mut u8;

    let before = auditor.stats();
    let before_records = records(&auditor);
    unsafe {
        auditor.release(on_stack.as_mut_ptr().cast());
        auditor.release(from_libc);
    }
    let stats = auditor.stats();

    assert_eq!(stats.invalid_operations, before.invalid_operations + 2);
    assert_eq!(stats.bytes_freed, before.bytes_freed);
    assert_eq!(records(&auditor), before_records);
    assert!(auditor.owns(keep));
    unsafe { libc::free(from_libc.cast()) };
}

#[test]
fn release_null_is_not_invalid() {
    let auditor = Auditor::new(SystemStorage);
    unsafe { auditor.release(ptr::null_mut()) };
    assert_eq!(auditor.stats().invalid_operations, 0);
}

#[test]
fn resize_null_is_allocate() {
    let via_resize = Auditor::new(SystemStorage);
    let via_allocate = Auditor::new(SystemStorage);
    let a = unsafe { via_resize.resize(ptr::null_mut(), 48, MAIN) };
    let b = via_allocate.allocate(48, MAIN);
    assert!(!a.is_null() && !b.is_null());

    assert_eq!(via_resize.stats(), via_allocate.stats());
    let (ra, rb) = (records(&via_resize), records(&via_allocate));
    assert_eq!((ra[0].size, ra[0].origin), (rb[0].size, rb[0].origin));
}

#[test]
fn resize_to_zero_is_release() {
    let via_resize = Auditor::new(SystemStorage);
    let via_release = Auditor::new(SystemStorage);
    let a = via_resize.allocate(48, MAIN);
    let b = via_release.allocate(48, MAIN);

    unsafe {
        assert!(via_resize.resize(a, 0, MAIN).is_null());
        via_release.release(b);
    }
    assert_eq!(via_resize.stats(), via_release.stats());
    assert!(records(&via_resize).is_empty());
}

#[test]
fn resize_of_foreign_pointer_is_null_and_counted() {
    let auditor = Auditor::new(SystemStorage);
    let p = auditor.allocate(8, MAIN);
    let mut on_stack = [0u8; 32];
    let before = auditor.stats();

    assert!(unsafe { auditor.resize(on_stack.as_mut_ptr(), 64, LIB) }.is_null());
    assert_eq!(auditor.stats().invalid_operations, before.invalid_operations + 1);
    assert_eq!(auditor.stats().bytes_requested, before.bytes_requested);
    assert_eq!(records(&auditor)[0].origin, MAIN);
    assert!(auditor.owns(p));
}

#[test]
fn resize_that_does_not_fit_keeps_the_old_allocation() {
    let auditor = Auditor::new(SystemStorage);
    let p = auditor.allocate(40, MAIN);
    unsafe { p.write_bytes(0x2b, 40) };
    let before = auditor.stats();
    let before_records = records(&auditor);

    assert!(unsafe { auditor.resize(p, usize::MAX / 2, LIB) }.is_null());
    assert!(auditor.owns(p));
    assert_eq!(auditor.stats(), before);
    assert_eq!(records(&auditor), before_records);
    assert!(unsafe { std::slice::from_raw_parts(p, 40) }
        .iter()
        .all(|&b| b == 0x2b));
    unsafe { auditor.release(p) };
    assert_balanced(&auditor);
}

#[test]
fn aligned_allocations_stay_aligned_through_resizes() {
    let auditor = Auditor::new(DlMallocStorage::new());
    for align in [32, 64, 128, 1024] {
        let p = auditor.allocate_aligned(100, align, MAIN);
        assert_eq!(p as usize % align, 0);
        let p = unsafe { auditor.resize(p, 3000, LIB) };
        assert_eq!(p as usize % align, 0);
        let p = unsafe { auditor.resize(p, 10, LIB) };
        assert_eq!(p as usize % align, 0);
        assert!(auditor.owns(p));
        unsafe { auditor.release(p) };
    }
    assert!(records(&auditor).is_empty());
    assert_balanced(&auditor);
}

#[test]
fn zero_size_allocate_is_null_without_record() {
    let auditor = Auditor::new(SystemStorage);
    assert!(auditor.allocate(0, MAIN).is_null());
    assert!(records(&auditor).is_empty());
    assert_eq!(auditor.stats().bytes_requested, 0);
}

#[test]
fn zero_allocate_payload_is_zeroed() {
    let auditor = Auditor::new(DlMallocStorage::new());
    for (count, size) in [(1, 1), (3, 7), (100, 40), (4096, 1)] {
        let p = auditor.zero_allocate(count, size, MAIN);
        assert!(!p.is_null());
        // SAFETY: `count * size` bytes were just handed out
        let bytes = unsafe { std::slice::from_raw_parts(p, count * size) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe {
            p.write_bytes(0xee, count * size);
            auditor.release(p);
        }
    }
    assert_balanced(&auditor);
}

/// Random valid and invalid operations, checking the books after each one.
fn random_walk<S: RawStorage>(auditor: Auditor<S>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    let mut dead: Vec<*mut u8> = Vec::new();
    let mut expected_invalid = 0;

    for _ in 0..2_000 {
        match rng.gen_range(0..10) {
            0..=2 => {
                let size = rng.gen_range(0..512);
                let p = auditor.allocate(size, MAIN);
                if size == 0 {
                    assert!(p.is_null());
                } else {
                    live.push((p, size));
                }
            }
            3 => {
                let (count, size) = (rng.gen_range(0..16), rng.gen_range(0..64));
                let p = auditor.zero_allocate(count, size, LIB);
                if count * size > 0 {
                    live.push((p, count * size));
                }
            }
            4..=5 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (p, size) = live[i];
                // fill the part that survives so we can check it was copied
                unsafe { p.write_bytes(0x77, size) };
                let new_size = rng.gen_range(1..1024);
                let q = unsafe { auditor.resize(p, new_size, LIB) };
                assert!(!q.is_null());
                let kept = size.min(new_size);
                assert!(unsafe { std::slice::from_raw_parts(q, kept) }
                    .iter()
                    .all(|&b| b == 0x77));
                live[i] = (q, new_size);
            }
            6..=7 if !live.is_empty() => {
                let (p, _) = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe { auditor.release(p) };
                dead.push(p);
            }
            8 if !dead.is_empty() && !live.is_empty() => {
                // a dead address may have been recycled for a live record;
                // only free it again if it isn't live any more
                let p = dead[rng.gen_range(0..dead.len())];
                if !live.iter().any(|&(q, _)| q == p) {
                    unsafe { auditor.release(p) };
                    expected_invalid += 1;
                }
            }
            _ => {
                unsafe { auditor.release(ptr::null_mut()) };
            }
        }

        assert_balanced(&auditor);
        assert_eq!(auditor.stats().invalid_operations, expected_invalid);
        assert_eq!(
            auditor.inspect(|l| l.len()),
            live.len(),
            "chain length should match the live set"
        );
    }

    let summary = auditor.shutdown(&mut ());
    assert_eq!(summary.leak_count, live.len());
    assert_eq!(
        summary.total_leaked,
        live.iter().map(|&(_, size)| size).sum::<usize>()
    );
}

#[test]
fn random_walk_keeps_books_balanced_on_system_storage() {
    for seed in 0..4 {
        random_walk(Auditor::new(SystemStorage), seed);
    }
}

#[test]
fn random_walk_keeps_books_balanced_on_dlmalloc_storage() {
    for seed in 100..104 {
        random_walk(Auditor::new(DlMallocStorage::new()), seed);
    }
}
