//! The driving loop: ties [`crate::fiber`] and [`crate::reactor`] together.
//!
//! `spec.md` leaves the exact shape of "the scheduler" to the host runtime
//! (a Ruby `Thread#switch_fiber` in the system this crate is distilled
//! from). [`run`] is this crate's rendering of that loop: one call to
//! [`crate::reactor::Reactor::poll`] per fiber turn, exactly mirroring the
//! original's `backend.poll(...); next_fiber, value = runqueue.shift;
//! next_fiber.transfer(value)` shape, so that the anti-starvation
//! threshold in `Reactor::poll` sees one call per turn rather than one per
//! full queue drain.

use crate::fiber::{self, Fiber, FiberId, Resume};
use crate::reactor;

/// Runs `root` to completion on a freshly bound reactor, along with every
/// fiber it (transitively) spawns. Returns once the run queue is empty and
/// no fiber remains suspended on a watcher — `spec.md` §3's third
/// invariant: "the loop terminates exactly when both are true".
pub fn run<F>(root: F)
where
    F: FnOnce() + Send + 'static,
{
    reactor::install();
    let root_fiber = Fiber::spawn("root", move |first| {
        debug_assert!(matches!(first, Ok(Resume::Unit)));
        root();
    });
    fiber::schedule(root_fiber, Ok(Resume::Unit));
    drive();
}

fn drive() {
    loop {
        let (runnable, ref_count) = reactor::with_current(|r| (!r.run_queue_is_empty(), r.ref_count()));
        if !runnable && ref_count == 0 {
            return;
        }
        reactor::with_current(|r| r.poll(runnable, FiberId::SCHEDULER));
        let next = reactor::with_current(|r| r.run_queue_pop());
        if let Some((fiber, value)) = next {
            reactor::with_current(|r| r.set_running_fiber(Some(fiber.clone())));
            fiber.resume(value);
            reactor::with_current(|r| r.set_running_fiber(None));
        }
    }
}
