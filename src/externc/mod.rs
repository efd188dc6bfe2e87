//! C entry points over one process-wide [`Auditor`].
//!
//! These have exactly the shape of `malloc()`, `calloc()`, `realloc()` and
//! `free()` plus the call-site pair, so an interposition layer can forward to
//! them directly. They are backed by [`DlMallocStorage`], so forwarding the
//! real `malloc()` here does not loop back into the interposer.

use std::ffi::{c_char, CStr};

use libc::{c_void, size_t};

use crate::{
    alloc::{
        auditor::Auditor,
        ledger::LedgerStats,
        record::Origin,
        storage::DlMallocStorage,
    },
    config::ReportConfig,
    putln,
};

#[no_mangle]
pub static MEMCHECK: Auditor<DlMallocStorage> = Auditor::new(DlMallocStorage::new());

/// Turn the call-site pair we were handed into an [`Origin`]. Anything we
/// can't read is an unknown origin, never an error.
///
/// # Safety
///
/// `label` must be null or a NUL-terminated string that stays valid (and
/// unchanged) for the rest of the process, e.g. a `dli_fname`.
unsafe fn origin(label: *const c_char, instruction: *const c_void) -> Origin {
    if label.is_null() {
        return Origin {
            address: instruction as usize,
            ..Origin::UNKNOWN
        };
    }
    // SAFETY: requirement passed to caller
    match unsafe { CStr::from_ptr(label) }.to_str() {
        Ok(label) => Origin::new(label, instruction as usize),
        Err(_) => Origin {
            address: instruction as usize,
            ..Origin::UNKNOWN
        },
    }
}

/// # Safety
///
/// See [`origin()`] for `label`.
#[no_mangle]
pub unsafe extern "C" fn memcheck_malloc(
    size: size_t,
    label: *const c_char,
    instruction: *const c_void,
) -> *mut c_void {
    MEMCHECK.allocate(size, unsafe { origin(label, instruction) }) as _
}

/// # Safety
///
/// See [`origin()`] for `label`.
#[no_mangle]
pub unsafe extern "C" fn memcheck_calloc(
    count: size_t,
    element_size: size_t,
    label: *const c_char,
    instruction: *const c_void,
) -> *mut c_void {
    MEMCHECK.zero_allocate(count, element_size, unsafe { origin(label, instruction) }) as _
}

/// # Safety
///
/// See [`origin()`] for `label`. `ptr` is null, something `memcheck_*` never
/// handed out (counted and ignored), or a live block nobody uses any more.
#[no_mangle]
pub unsafe extern "C" fn memcheck_realloc(
    ptr: *mut c_void,
    size: size_t,
    label: *const c_char,
    instruction: *const c_void,
) -> *mut c_void {
    unsafe { MEMCHECK.resize(ptr as _, size, origin(label, instruction)) as _ }
}

/// Never crashes on a bad pointer, those are counted instead.
///
/// # Safety
///
/// `ptr` is null, something `memcheck_*` never handed out, or a live block
/// nobody uses any more.
#[no_mangle]
pub unsafe extern "C" fn memcheck_free(ptr: *mut c_void) {
    unsafe { MEMCHECK.release(ptr as _) }
}

/// Copy the current counters into `*out`. Does nothing if `out` is null.
///
/// # Safety
///
/// `out` must be null or valid for a write of one [`LedgerStats`].
#[no_mangle]
pub unsafe extern "C" fn memcheck_stats(out: *mut LedgerStats) {
    if let Some(out) = unsafe { out.as_mut() } {
        *out = MEMCHECK.stats();
    }
}

/// Greet, unless `MEMCHECK_QUIET` says not to. Meant for a load-time
/// constructor.
#[no_mangle]
pub extern "C" fn memcheck_init() {
    if !ReportConfig::from_env().quiet {
        putln!("Mini-Memcheck");
    }
}

/// Drain the ledger and print the report configured by `MEMCHECK_REPORT`.
/// Meant for an exit-time destructor. Returns the number of leaks.
#[no_mangle]
pub extern "C" fn memcheck_report() -> size_t {
    MEMCHECK.report(&ReportConfig::from_env()).leak_count
}
