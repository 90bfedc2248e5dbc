//! Covers the concurrent-sleeps, `waitpid`, and cross-thread `wake`
//! scenarios of `spec.md` §8.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiber_reactor::prelude::*;

#[test]
fn concurrent_sleeps_resume_in_deadline_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_in = order.clone();

    fiber_reactor::test::run(move || {
        // Spawned out of deadline order on purpose: the run queue is FIFO,
        // so only the timer heap (not scheduling order) should determine
        // wake-up order.
        let durations = [(30, "c"), (10, "a"), (20, "b")];
        for (ms, label) in durations {
            let order = order_in.clone();
            let fiber = Fiber::spawn(label, move |_| {
                let _ = reactor::sleep(Duration::from_millis(ms));
                order.lock().unwrap().push(label);
            });
            fiber::schedule(fiber, Ok(fiber::Resume::Unit));
        }
    });

    assert_eq!(&*order.lock().unwrap(), &["a", "b", "c"]);
}

#[test]
fn waitpid_reports_the_exit_code_of_a_forked_child() {
    let code = fiber_reactor::test::run(|| {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            // Child: exit immediately with a recognizable code. This
            // never returns.
            unsafe { libc::_exit(42) };
        }
        process::waitpid(pid).unwrap().code()
    });
    assert_eq!(code, Some(42));
}

#[test]
fn wake_unblocks_a_reactor_genuinely_blocked_in_poll() {
    // Scenario 6: a `Reactor::poll` call with nothing runnable and nothing
    // armed blocks inside `Multiplexer::run(Mode::Once)` with no timeout;
    // a concurrent `wake()` from a different OS thread must make it return
    // within ~10ms of being called, not merely avoid panicking. This
    // exercises the real cross-thread path: `Reactor::wake` must stay
    // callable while the owning thread sits inside
    // `multiplexer.borrow_mut().run(mode)`, which is exactly why its
    // `Arc<mio::Waker>` lives outside the multiplexer's `RefCell`.
    let reactor = reactor::install();
    let reactor2 = reactor.clone();
    let wake_sent_at = Arc::new(Mutex::new(None));
    let wake_sent_at2 = wake_sent_at.clone();

    let waker = std::thread::spawn(move || {
        // Give the main thread every chance to actually be inside the
        // blocking multiplexer call before we try to interrupt it.
        std::thread::sleep(Duration::from_millis(20));
        *wake_sent_at2.lock().unwrap() = Some(std::time::Instant::now());
        reactor2.wake()
    });

    let before = std::time::Instant::now();
    reactor.poll(false, fiber::FiberId::SCHEDULER);
    let elapsed_total = before.elapsed();

    let was_running = waker.join().unwrap();
    let since_wake = wake_sent_at.lock().unwrap().unwrap().elapsed();

    assert!(was_running, "wake() should have caught the loop still blocked in poll");
    assert!(
        elapsed_total >= Duration::from_millis(15),
        "poll returned before the other thread could have called wake(): {elapsed_total:?}"
    );
    assert!(
        since_wake < Duration::from_millis(10),
        "poll did not return within 10ms of wake() being called: {since_wake:?}"
    );
}
