//! Child-process exit waiting.
//!
//! Implements the `waitpid` half of `spec.md` §4.12/§6, plus the decoded
//! `ExitStatus` type from the resolution of Open Question 1 in §9: rather
//! than handing callers the raw `c_int` status and a shift-by-8 footnote,
//! we decode it once, the way `std::process::ExitStatus` does.

use std::fmt;

use crate::fiber::Cancelled;
use crate::reactor;

/// The decoded result of `waitpid(2)` for one child. Unlike
/// `std::process::ExitStatus`, this crate's children are not necessarily
/// spawned via `std::process::Command`, so we decode the raw status
/// ourselves rather than relying on that type's private constructor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    raw: libc::c_int,
}

impl ExitStatus {
    pub(crate) fn from_raw(raw: libc::c_int) -> Self {
        Self { raw }
    }

    /// The process's exit code, if it exited normally.
    pub fn code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.raw) {
            Some(libc::WEXITSTATUS(self.raw))
        } else {
            None
        }
    }

    /// The signal that killed the process, if it was killed by one.
    pub fn signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.raw) {
            Some(libc::WTERMSIG(self.raw))
        } else {
            None
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// The raw status as returned by `waitpid(2)`, for callers that need
    /// bits this type doesn't decode (stopped/continued notifications).
    pub fn raw(&self) -> libc::c_int {
        self.raw
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code(), self.signal()) {
            (Some(code), _) => write!(f, "ExitStatus(exited: {code})"),
            (None, Some(sig)) => write!(f, "ExitStatus(signal: {sig})"),
            (None, None) => write!(f, "ExitStatus(raw: {:#x})", self.raw),
        }
    }
}

/// Suspends the calling fiber until `pid` exits, returning its decoded
/// status. Implements `spec.md` §4.12/§6's `waitpid`.
///
/// # Errors
/// Returns [`crate::Error::Cancelled`] if the fiber is cancelled while
/// waiting; the child-exit watcher is guaranteed stopped by the time this
/// returns either way, so the child (if it later exits) is simply reaped
/// silently and logged at `debug!`.
pub fn waitpid(pid: libc::pid_t) -> crate::Result<ExitStatus> {
    match reactor::wait_pid(pid) {
        Ok((_pid, status)) => Ok(status),
        Err(Cancelled) => Err(crate::Error::Cancelled),
    }
}
