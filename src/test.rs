//! Test harness: a thin wrapper around [`crate::scheduler::run`] for use
//! from `#[test]` functions.
//!
//! Grounded on `tarantool::fiber::r#async::block_on`, which plays the same
//! role for that crate's `Future`-based fiber layer: drive one reactor to
//! completion and hand back whatever the root closure produced, instead of
//! leaving every test to hand-roll its own `scheduler::run` call.

use std::sync::mpsc;

/// Runs `f` as the root fiber of a fresh reactor on the calling thread,
/// blocking until it (and everything it transitively spawned) finishes,
/// and returns its result.
pub fn run<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    crate::scheduler::run(move || {
        let _ = tx.send(f());
    });
    rx.recv()
        .expect("root fiber finished without producing a result")
}
