//! The whole test binary runs on the auditor, harness included, so only
//! relative changes to the counters are checked here.

use memledger::{Auditor, DlMallocStorage, Origin};

#[global_allocator]
static GLOBAL: Auditor<DlMallocStorage> = Auditor::new(DlMallocStorage::new());

#[test]
fn rust_allocations_go_through_the_ledger() {
    let before = GLOBAL.stats();
    let v = vec![7u8; 4096];
    assert!(GLOBAL.owns(v.as_ptr()));
    let after = GLOBAL.stats();
    assert!(after.bytes_requested >= before.bytes_requested + 4096);

    drop(v);
    assert!(GLOBAL.stats().bytes_freed >= before.bytes_freed + 4096);
}

#[test]
fn growing_a_vec_resizes_its_record() {
    let mut v: Vec<u64> = Vec::with_capacity(4);
    v.extend(0..10_000);
    assert!(GLOBAL.owns(v.as_ptr() as *const u8));
    let found = GLOBAL.inspect(|ledger| {
        ledger
            .records()
            .find(|leak| leak.address == v.as_ptr() as *const u8)
            .map(|leak| (leak.size, leak.origin))
    });
    assert_eq!(
        found,
        Some((v.capacity() * std::mem::size_of::<u64>(), Origin::RUST))
    );
}

#[test]
fn books_balance_with_the_harness_running() {
    let boxes: Vec<Box<[u8; 100]>> = (0..100).map(|_| Box::new([1; 100])).collect();
    // no asserting under the lock, a failed assert allocates
    let (outstanding, live) =
        GLOBAL.inspect(|ledger| (ledger.stats().outstanding(), ledger.live_bytes()));
    assert_eq!(outstanding, live);
    drop(boxes);
}

#[repr(align(128))]
struct CacheLine([u8; 128]);

#[test]
fn over_aligned_values_get_their_alignment() {
    let lines: Vec<Box<CacheLine>> = (0..16).map(|i| Box::new(CacheLine([i; 128]))).collect();
    for (i, line) in lines.iter().enumerate() {
        let addr = &**line as *const CacheLine as *const u8;
        assert_eq!(addr as usize % 128, 0);
        assert!(GLOBAL.owns(addr));
        assert_eq!(line.0[127], i as u8);
    }

    // std's channels allocate 128-aligned blocks internally
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || tx.send(vec![3u8; 64]).unwrap());
    assert_eq!(rx.recv().unwrap(), vec![3u8; 64]);
}
