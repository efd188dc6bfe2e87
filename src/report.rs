//! The shutdown reporter: drain whatever is still live, report every record
//! as a leak, and check that the books balance.
//!
//! Sinks get called *with the ledger locked*. If the auditor is also the
//! allocator of the process, a sink that allocates will deadlock, which is
//! why [`TextReport`] and [`JsonLinesReport`] write straight to a file
//! descriptor by default.

use std::{fmt, io};

use serde::Serialize;

use crate::{
    alloc::{
        auditor::Auditor,
        ledger::{Leak, LedgerStats},
        storage::RawStorage,
    },
    config::{ReportConfig, ReportFormat},
    util::print::{write_line, Stderr},
};

/// Everything the reporter knows once the ledger is drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    /// The counters right before the drain
    pub stats: LedgerStats,
    pub leak_count: usize,
    /// Sum of the sizes of every drained record
    pub total_leaked: usize,
}

impl ShutdownSummary {
    pub const fn is_clean(&self) -> bool {
        self.leak_count == 0
    }
}

/// Somewhere to send leaks as they come out of the drain.
pub trait LeakSink {
    /// Called once per drained record, newest allocation first.
    fn leak(&mut self, leak: &Leak);

    /// Called once, after the drain, with the ledger unlocked.
    fn finish(&mut self, summary: &ShutdownSummary) {
        let _ = summary;
    }
}

/// Discards everything
impl LeakSink for () {
    fn leak(&mut self, _: &Leak) {}
}

impl LeakSink for Vec<Leak> {
    fn leak(&mut self, leak: &Leak) {
        self.push(*leak);
    }
}

/// The classic report:
///
/// ```plaintext
/// ==1234== LEAK REPORT:
/// ==1234==    Leak origin: ./a.out 0x401136
/// ==1234==    Leak size: 10 bytes
/// ==1234==    Leak memory address: 0x4052a0
/// ==1234==
/// ==1234== Program made 1 bad call(s) to free or realloc.
/// ==1234==
/// ==1234== HEAP SUMMARY:
/// ==1234==    Total memory requested: 10 bytes
/// ==1234==    Total memory freed: 0 bytes
/// ==1234==    Total leak: 10 bytes
/// ```
pub struct TextReport<W = Stderr>
where
    W: fmt::Write,
{
    out: W,
    header_written: bool,
}

impl TextReport<Stderr> {
    pub const fn stderr() -> Self {
        Self::new(Stderr)
    }
}

impl<W> TextReport<W>
where
    W: fmt::Write,
{
    pub const fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        let _ = write_line(&mut self.out, args);
    }
}

impl<W> LeakSink for TextReport<W>
where
    W: fmt::Write,
{
    fn leak(&mut self, leak: &Leak) {
        if !self.header_written {
            self.line(format_args!(""));
            self.line(format_args!("LEAK REPORT:"));
            self.header_written = true;
        }
        self.line(format_args!("   Leak origin: {}", leak.origin));
        self.line(format_args!("   Leak size: {} bytes", leak.size));
        self.line(format_args!("   Leak memory address: {:p}", leak.address));
        self.line(format_args!(""));
    }

    fn finish(&mut self, summary: &ShutdownSummary) {
        if !self.header_written {
            self.line(format_args!(""));
        }
        let stats = &summary.stats;
        self.line(format_args!(
            "Program made {} bad call(s) to free or realloc.",
            stats.invalid_operations
        ));
        self.line(format_args!(""));
        self.line(format_args!("HEAP SUMMARY:"));
        self.line(format_args!(
            "   Total memory requested: {} bytes",
            stats.bytes_requested
        ));
        self.line(format_args!("   Total memory freed: {} bytes", stats.bytes_freed));
        if summary.is_clean() {
            self.line(format_args!("   No leaks, all memory freed. Congratulations!"));
        } else {
            self.line(format_args!("   Total leak: {} bytes", summary.total_leaked));
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ReportLine<'a> {
    Leak(&'a Leak),
    Summary(&'a ShutdownSummary),
}

/// One JSON object per line: a `"kind": "leak"` object per leak, then a
/// `"kind": "summary"` object.
pub struct JsonLinesReport<W = Stderr>
where
    W: io::Write,
{
    out: W,
}

impl JsonLinesReport<Stderr> {
    pub const fn stderr() -> Self {
        Self::new(Stderr)
    }
}

impl<W> JsonLinesReport<W>
where
    W: io::Write,
{
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: &ReportLine<'_>) {
        // A broken stderr is not a reason to stop draining
        if serde_json::to_writer(&mut self.out, line).is_ok() {
            let _ = self.out.write_all(b"\n");
        }
    }
}

impl<W> LeakSink for JsonLinesReport<W>
where
    W: io::Write,
{
    fn leak(&mut self, leak: &Leak) {
        self.emit(&ReportLine::Leak(leak));
    }

    fn finish(&mut self, summary: &ShutdownSummary) {
        self.emit(&ReportLine::Summary(summary));
        let _ = self.out.flush();
    }
}

impl<S> Auditor<S>
where
    S: RawStorage,
{
    /// Drain the ledger into `sink` and check the accounting.
    ///
    /// # Panics
    ///
    /// If the total size of the drained records is not `bytes_requested -
    /// bytes_freed` as they were right before the drain. That is a bug in the
    /// ledger, not in the program being audited.
    pub fn shutdown<K>(&self, sink: &mut K) -> ShutdownSummary
    where
        K: LeakSink + ?Sized,
    {
        let summary = {
            let mut ledger = self.lock();
            let stats = ledger.stats();
            let mut leak_count = 0;
            let mut total_leaked = 0;
            for leak in ledger.drain() {
                leak_count += 1;
                total_leaked += leak.size;
                sink.leak(&leak);
            }
            ShutdownSummary {
                stats,
                leak_count,
                total_leaked,
            }
        };
        sink.finish(&summary);
        // Unlocked by now, the panic machinery is free to allocate
        assert_eq!(
            summary.total_leaked,
            summary.stats.outstanding(),
            "ledger out of balance: {summary:?}"
        );
        summary
    }

    /// [`Auditor::shutdown()`] into whichever sink `config` picks.
    pub fn report(&self, config: &ReportConfig) -> ShutdownSummary {
        let summary = match config.format {
            ReportFormat::Text => self.shutdown(&mut TextReport::stderr()),
            ReportFormat::JsonLines => self.shutdown(&mut JsonLinesReport::stderr()),
            ReportFormat::Off => self.shutdown(&mut ()),
        };
        if !summary.is_clean() {
            log::warn!(
                "{} leak(s), {} bytes total",
                summary.leak_count,
                summary.total_leaked
            );
        }
        summary
    }
}
