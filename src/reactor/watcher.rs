//! The watcher record: the short-lived structure tying one in-flight I/O
//! operation to the fiber waiting on it.
//!
//! `spec.md` §3 describes this as a value stamped once (on first use) with
//! the waiting fiber, so that a read/write loop which suspends repeatedly
//! on the same descriptor reuses the same stamped fiber instead of
//! re-deriving it on every retry. §9 anticipates implementations that
//! cannot pin the record to a stable stack address and says to "promote
//! watcher records to arena allocations keyed by fiber id and
//! stop-deregister before release" — that's what we do: the record here is
//! just a handle into the [`super::multiplexer::Multiplexer`]'s token
//! table, which *is* the arena.

use std::os::unix::io::RawFd;

use super::{with_current, Interest};
use crate::fiber::{self, Fiber, Resumed};

/// A reusable readiness watcher for one file descriptor.
///
/// Create one with [`Watcher::new`] before a retry loop and pass it by
/// `&mut` to [`wait_fd_with_watcher`] on every iteration; the fiber is
/// stamped on the first call and reused thereafter.
#[derive(Default)]
pub struct Watcher {
    fiber: Option<Fiber>,
}

impl Watcher {
    pub fn new() -> Self {
        Self { fiber: None }
    }
}

/// Arms a readiness watcher for `fd`/`interest`, suspends the calling
/// fiber, then disarms the watcher before returning. Implements `spec.md`
/// §4.2.
pub fn wait_fd_with_watcher(fd: RawFd, watcher: &mut Watcher, interest: Interest) -> Resumed {
    let fiber = match watcher.fiber.clone() {
        Some(fiber) => fiber,
        None => {
            let fiber = with_current(|r| r.current_fiber_handle());
            watcher.fiber = Some(fiber.clone());
            fiber
        }
    };
    let token = with_current(|r| r.multiplexer_mut(|m| m.start_io(fd, interest, fiber)));
    let result = fiber::suspend();
    with_current(|r| r.multiplexer_mut(|m| m.stop_io(token)));
    result
}

/// One-shot readiness wait: equivalent to calling
/// [`wait_fd_with_watcher`] with a freshly created [`Watcher`], propagating
/// cancellation as [`crate::Error::Cancelled`]. Implements the `wait_io`
/// operation of `spec.md` §6.
pub fn wait_fd(fd: RawFd, interest: Interest) -> crate::Result<()> {
    let mut watcher = Watcher::new();
    match wait_fd_with_watcher(fd, &mut watcher, interest) {
        Ok(_) => Ok(()),
        Err(fiber::Cancelled) => Err(crate::Error::Cancelled),
    }
}
