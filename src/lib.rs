//! An allocation auditor: a malloc-style facade that records every live
//! allocation in a ledger, refuses to free or resize addresses it never
//! handed out, and reports what was leaked when the process is done.
//!
//! ```
//! use memledger::{Auditor, Origin, SystemStorage, TextReport};
//!
//! let auditor = Auditor::new(SystemStorage);
//! let origin = Origin::new("doc-test", 0);
//! let p = auditor.allocate(100, origin);
//! // SAFETY: nothing reads `p` after this
//! unsafe {
//!     auditor.release(p);
//!     auditor.release(p); // counted, not a crash
//! }
//!
//! let summary = auditor.shutdown(&mut TextReport::new(String::new()));
//! assert!(summary.is_clean());
//! assert_eq!(summary.stats.invalid_operations, 1);
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod report;
pub mod serialize;
pub mod util;

pub use crate::{
    alloc::{
        auditor::Auditor,
        ledger::{Leak, Ledger, LedgerStats},
        record::Origin,
        storage::{DlMallocStorage, RawStorage, SystemStorage, MIN_ALIGN},
    },
    config::{ReportConfig, ReportFormat},
    error::LedgerError,
    report::{JsonLinesReport, LeakSink, ShutdownSummary, TextReport},
};
