use std::{error::Error, fmt};

/// Why a ledger operation didn't hand back an address. The facade turns all
/// of these into a null pointer, none of them are fatal.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerError {
    /// The storage could not fit the record plus the payload
    OutOfMemory,
    /// Zero bytes were requested (or a resize to zero released the block)
    ZeroSize,
    /// The address was never handed out by this ledger, or was already
    /// released
    InvalidAddress,
    /// The requested alignment is not a power of two
    InvalidAlignment,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfMemory => "insufficient memory for record and payload",
            Self::ZeroSize => "zero-sized request",
            Self::InvalidAddress => "address is not a live allocation",
            Self::InvalidAlignment => "alignment is not a power of two",
        })
    }
}

impl Error for LedgerError {}

/// `MEMCHECK_REPORT` held something we don't understand
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseReportFormatError {
    pub value: String,
}

impl fmt::Display for ParseReportFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown report format {:?}, expected one of \"text\", \"json\", \"off\"",
            self.value
        )
    }
}

impl Error for ParseReportFormatError {}
