//! Non-blocking descriptor bookkeeping.
//!
//! Implements `spec.md`'s `IoHandle` and the `set_nonblock` operation of
//! §4.13: a raw fd plus a memoised flag so repeated operations on the same
//! socket don't re-issue `fcntl` every time.

use std::os::unix::io::RawFd;

/// A file descriptor paired with a cached "is it already non-blocking"
/// flag. `net::TcpStream`/`net::TcpListener` hold one of these instead of
/// a bare `RawFd`.
pub struct IoHandle {
    fd: RawFd,
    nonblocking: std::cell::Cell<bool>,
}

impl IoHandle {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            nonblocking: std::cell::Cell::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Idempotent: asserts `O_NONBLOCK` on the underlying fd the first time
    /// it's called and is a no-op afterwards. Implements `spec.md` §4.13.
    pub fn set_nonblock(&self) -> std::io::Result<()> {
        if self.nonblocking.get() {
            return Ok(());
        }
        set_nonblock(self.fd)?;
        self.nonblocking.set(true);
        Ok(())
    }
}

/// Asserts `O_NONBLOCK` on `fd` unconditionally, bypassing any cached
/// state. Most callers want [`IoHandle::set_nonblock`] instead.
pub fn set_nonblock(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
