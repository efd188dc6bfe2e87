//! Serialize addresses as `0x`-prefixed hex strings, the way `%p` prints them.
//! Use with `#[serde(serialize_with = "serde_addr::serialize")]`.

use std::fmt;

use serde::Serializer;

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

impl AsUsize for usize {
    fn as_usize(self) -> usize {
        self
    }
}

impl<T> AsUsize for *const T {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl<T> AsUsize for *mut T {
    fn as_usize(self) -> usize {
        self as usize
    }
}

struct Hex(usize);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsUsize,
{
    // `collect_str` lets the serializer write straight through, no `String`
    serializer.collect_str(&Hex((*value).as_usize()))
}
