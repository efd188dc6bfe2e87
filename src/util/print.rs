use std::{fmt, io};

use libc::{c_void, STDERR_FILENO};

/// A handle to stderr that writes straight to the file descriptor. Nothing in
/// here touches the allocator, so it is fine to use while the ledger lock is
/// held or while we *are* the process allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stderr;

impl Stderr {
    fn write_bytes(&self, mut bytes: &[u8]) -> fmt::Result {
        while !bytes.is_empty() {
            // SAFETY: `bytes` is a live slice, and we only read `bytes.len()`
            //         bytes from it.
            let n = unsafe {
                libc::write(STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len())
            };
            if n < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(fmt::Error);
            }
            if n == 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[n as usize..];
        }
        Ok(())
    }
}

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes())
    }
}

impl io::Write for Stderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)
            .map(|()| buf.len())
            .map_err(|_| io::Error::last_os_error())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The `==<pid>== ` prefix that goes in front of every diagnostic line.
#[derive(Clone, Copy, Debug)]
pub struct PidPrefix;

impl fmt::Display for PidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: `getpid()` has no preconditions
        write!(f, "=={}== ", unsafe { libc::getpid() })
    }
}

/// Write one `==<pid>== `-prefixed line to `w`, formatting with `core::fmt`
/// only.
pub fn write_line<W>(w: &mut W, args: fmt::Arguments<'_>) -> fmt::Result
where
    W: fmt::Write,
{
    write!(w, "{}", PidPrefix)?;
    w.write_fmt(args)?;
    w.write_char('\n')
}

/// `eprintln!()` but it never allocates, and puts the pid in front.
#[macro_export]
macro_rules! putln {
    () => {
        let _ = $crate::util::print::write_line(
            &mut $crate::util::print::Stderr,
            format_args!(""),
        );
    };
    ($($arg:tt)*) => {
        let _ = $crate::util::print::write_line(
            &mut $crate::util::print::Stderr,
            format_args!($($arg)*),
        );
    };
}
