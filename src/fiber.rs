//! Cooperative multitasking primitives.
//!
//! This module plays the role `spec.md` assigns to an external "Fiber" and
//! "RunQueue" collaborator: a host runtime (in the system this crate grew
//! out of, a Ruby VM) would normally supply these. Standing alone, we need
//! *something* real to drive the reactor's suspension protocol, so this
//! module provides a minimal reference scheduler: one parked OS thread per
//! fiber, with control handed off through a rendezvous channel so that at
//! most one fiber's code (or the driving loop itself) ever runs at a time.
//! The threads are stack containers only; nothing here is preemptive or
//! runs concurrently with anything else that matters to the reactor.
//!
//! See also: [`crate::reactor`], which is where the interesting engineering
//! lives.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

/// Opaque identity of a fiber. Cheap to copy and compare; used as the arena
/// key for watcher records (see [`crate::reactor::watcher`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

impl FiberId {
    /// Sentinel identity passed to [`crate::reactor::Reactor::poll`] by
    /// [`crate::scheduler::run`]'s driving loop, which is not itself a
    /// fiber. `next_fiber_id` starts at 1, so 0 never collides with a real
    /// fiber.
    pub const SCHEDULER: FiberId = FiberId(0);
}

fn next_fiber_id() -> FiberId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    FiberId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// The value a suspended fiber is resumed with.
///
/// This is the Rust rendering of the design note in `spec.md` §9: "the idiom
/// 'schedule a fiber with an exception sentinel to cancel' maps cleanly to a
/// resume channel carrying a sum type `{Value(T), Error(E)}`". Operations
/// built on [`suspend`] match on the [`Resume`] payload they expect and
/// propagate [`Cancelled`] unconditionally; the specific payload variant
/// mismatching what a call site expects is a programming error, not
/// something a well-behaved reactor can produce.
pub enum Resume {
    /// The common case: "you can proceed now", no data attached.
    Unit,
    /// Produced by the child-exit watcher callback (see
    /// [`crate::process::waitpid`]).
    ChildExit {
        pid: libc::pid_t,
        status: crate::process::ExitStatus,
    },
    /// Produced by an explicit external [`schedule`] call targeting a
    /// fiber suspended in [`crate::reactor::Reactor::wait_event`].
    External(Box<dyn Any + Send>),
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Unit => f.write_str("Resume::Unit"),
            Resume::ChildExit { pid, status } => f
                .debug_struct("Resume::ChildExit")
                .field("pid", pid)
                .field("status", status)
                .finish(),
            Resume::External(_) => f.write_str("Resume::External(..)"),
        }
    }
}

/// The cancellation sentinel. Scheduling a fiber with `Err(Cancelled)`
/// instead of `Ok(Resume::Unit)` is how external code (or a watcher
/// callback standing in for one) asks a suspended fiber to unwind.
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

/// What a fiber was resumed with: either a normal value or cancellation.
pub type Resumed = Result<Resume, Cancelled>;

enum ControlEvent {
    Yielded,
    Finished,
}

struct FiberThreadState {
    to_fiber_rx: Receiver<Resumed>,
    yielded_tx: SyncSender<ControlEvent>,
}

thread_local! {
    static CURRENT_ID: RefCell<Option<FiberId>> = const { RefCell::new(None) };
    static THREAD_STATE: RefCell<Option<FiberThreadState>> = const { RefCell::new(None) };
}

/// Attributes used to configure a fiber at spawn time.
///
/// Grounded on `tarantool::fiber::FiberAttr`, which exposes the same
/// stack-size knob over the host VM's native fibers; here it configures
/// the backing OS thread instead.
#[derive(Debug, Clone, Default)]
pub struct FiberAttr {
    stack_size: Option<usize>,
}

impl FiberAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stack size hint, in bytes. `None` (the default) uses the
    /// platform's default thread stack size.
    pub fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = Some(stack_size);
        self
    }
}

/// A handle to a fiber, cheap to clone and store in a [`RunQueue`].
///
/// Never sent across threads: it is manipulated exclusively on the reactor's
/// owning thread, same as every other piece of reactor state (`spec.md` §5).
#[derive(Clone)]
pub struct Fiber {
    inner: Rc<FiberHandle>,
}

struct FiberHandle {
    id: FiberId,
    name: String,
    to_fiber_tx: SyncSender<Resumed>,
    yielded_rx: Receiver<ControlEvent>,
    finished: std::cell::Cell<bool>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Fiber {}

impl Fiber {
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    /// Spawns a new fiber with default attributes. The fiber does not run
    /// until it is scheduled (e.g. via [`schedule`]) and then resumed by
    /// the driving loop.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Fiber
    where
        F: FnOnce(Resumed) + Send + 'static,
    {
        Self::spawn_with_attr(name, &FiberAttr::default(), body)
    }

    /// Spawns a new fiber, applying `attr`'s stack size hint to the
    /// backing OS thread. Grounded on `tarantool::fiber::FiberAttr`/
    /// `Builder`, which expose the same knob over the host VM's own
    /// fibers.
    pub fn spawn_with_attr<F>(name: impl Into<String>, attr: &FiberAttr, body: F) -> Fiber
    where
        F: FnOnce(Resumed) + Send + 'static,
    {
        let id = next_fiber_id();
        let name = name.into();
        let (to_fiber_tx, to_fiber_rx) = sync_channel::<Resumed>(0);
        let (yielded_tx, yielded_rx) = sync_channel::<ControlEvent>(0);

        // Propagate the spawning thread's reactor into the new OS thread:
        // a fiber must call back into the *same* reactor instance as
        // whoever spawned it, never a fresh one (see `crate::reactor`'s
        // module docs for why this can't just be `thread_local!`-default).
        let reactor = crate::reactor::current_arc();

        let thread_name = name.clone();
        let mut builder = thread::Builder::new().name(thread_name);
        if let Some(stack_size) = attr.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || {
                crate::reactor::bind(reactor);
                CURRENT_ID.with(|c| *c.borrow_mut() = Some(id));
                THREAD_STATE.with(|s| {
                    *s.borrow_mut() = Some(FiberThreadState {
                        to_fiber_rx,
                        yielded_tx: yielded_tx.clone(),
                    })
                });
                // Block here until the driving loop hands us our first
                // resume value; this is what `schedule` + the run queue
                // eventually deliver.
                let first = THREAD_STATE.with(|s| {
                    s.borrow()
                        .as_ref()
                        .expect("thread state just installed above")
                        .to_fiber_rx
                        .recv()
                        .expect("reactor thread dropped the fiber before starting it")
                });
                body(first);
                // Ignore send errors: if the driving loop already dropped
                // its receiver (e.g. reactor shut down) there's nothing
                // left to report to.
                let _ = yielded_tx.send(ControlEvent::Finished);
            })
            .expect("failed to spawn fiber thread");

        Fiber {
            inner: Rc::new(FiberHandle {
                id,
                name,
                to_fiber_tx,
                yielded_rx,
                finished: std::cell::Cell::new(false),
            }),
        }
    }

    /// Hands the baton to this fiber and blocks the calling (driving-loop)
    /// thread until the fiber either suspends again or finishes.
    ///
    /// This is the only place in the crate that performs the thread
    /// handoff; every other piece of code only ever touches the run queue.
    pub(crate) fn resume(&self, value: Resumed) {
        debug_assert!(
            !self.inner.finished.get(),
            "attempted to resume a finished fiber"
        );
        if self.inner.to_fiber_tx.send(value).is_err() {
            // Fiber thread panicked and exited without consuming the
            // channel; treat it as finished rather than hanging forever.
            self.inner.finished.set(true);
            return;
        }
        match self.inner.yielded_rx.recv() {
            Ok(ControlEvent::Yielded) => {}
            Ok(ControlEvent::Finished) | Err(_) => self.inner.finished.set(true),
        }
    }
}

/// Returns the identity of the fiber executing on the current thread.
///
/// # Panics
/// Panics if called from a thread that is not running fiber code (i.e. the
/// reactor's own driving loop, before it has resumed anything).
pub fn current() -> FiberId {
    CURRENT_ID
        .with(|c| *c.borrow())
        .expect("fiber::current() called outside of a fiber")
}

/// Suspends the calling fiber, returning the value it is later resumed
/// with. This is `spec.md`'s `await` primitive, renamed because `await` is
/// a reserved word in Rust 2018+.
///
/// Per the suspend/resume contract (`spec.md` §4.1 and §5), any watcher the
/// caller armed before calling this must be stopped before the returned
/// value is consulted; callers built on [`crate::reactor::wait_fd_with_watcher`]
/// and friends already do this for you.
pub fn suspend() -> Resumed {
    crate::reactor::with_current(|r| r.ref_increment());
    let result = THREAD_STATE.with(|s| {
        let s = s.borrow();
        let s = s
            .as_ref()
            .expect("suspend() called outside of a fiber spawned by this crate");
        s.yielded_tx
            .send(ControlEvent::Yielded)
            .expect("driving loop is gone");
        s.to_fiber_rx
            .recv()
            .expect("driving loop dropped us while suspended")
    });
    crate::reactor::with_current(|r| r.ref_decrement());
    result
}

/// Voluntary cooperative yield: re-enqueues the calling fiber at the back of
/// the run queue and switches to the scheduler. Used after a *successful*
/// syscall to give peers a fair turn, and as a cancellation checkpoint.
pub fn snooze() -> Resumed {
    let me = crate::reactor::with_current(|r| r.current_fiber_handle());
    schedule(me, Ok(Resume::Unit));
    suspend()
}

/// Marks a fiber runnable by pushing it (with its resume value) onto the
/// back of the current thread's run queue. Never blocks.
pub fn schedule(fiber: Fiber, value: Resumed) {
    crate::reactor::with_current(|r| r.run_queue_push_back(fiber, value));
}

/// Requests cancellation of a suspended fiber: the next time it is
/// resumed, [`suspend`] (and everything built on it) returns
/// `Err(Cancelled)` instead of whatever it was waiting for. A no-op if the
/// fiber has already finished.
pub fn cancel(fiber: &Fiber) {
    if !fiber.is_finished() {
        schedule(fiber.clone(), Err(Cancelled));
    }
}

/// Like [`schedule`], but pushes to the front of the queue. Used internally
/// when a fiber must be the very next one to run (none of the public
/// operations in this crate need this, but the run queue contract from
/// `spec.md` §1 calls for it, so it is exposed for callers building their
/// own watchers on top of [`crate::reactor`]).
pub fn schedule_front(fiber: Fiber, value: Resumed) {
    crate::reactor::with_current(|r| r.run_queue_push_front(fiber, value));
}

/// FIFO queue of fibers ready to run, paired with the value each should be
/// resumed with. Owned by exactly one [`crate::reactor::Reactor`] and never
/// touched from another thread (`spec.md` §3 invariant 5, §5).
#[derive(Default)]
pub struct RunQueue {
    queue: VecDeque<(Fiber, Resumed)>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push_back(&mut self, fiber: Fiber, value: Resumed) {
        self.queue.push_back((fiber, value));
    }

    pub fn push_front(&mut self, fiber: Fiber, value: Resumed) {
        self.queue.push_front((fiber, value));
    }

    pub fn pop(&mut self) -> Option<(Fiber, Resumed)> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn run_queue_is_fifo() {
        let mut q = RunQueue::new();
        assert!(q.is_empty());
        let a = Fiber::spawn("a", |_| {});
        let b = Fiber::spawn("b", |_| {});
        q.push_back(a.clone(), Ok(Resume::Unit));
        q.push_back(b.clone(), Ok(Resume::Unit));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().0.id(), a.id());
        assert_eq!(q.pop().unwrap().0.id(), b.id());
        assert!(q.pop().is_none());
        // Finish the threads cleanly.
        a.resume(Ok(Resume::Unit));
        b.resume(Ok(Resume::Unit));
    }

    #[test]
    fn run_queue_push_front_jumps_the_line() {
        let mut q = RunQueue::new();
        let a = Fiber::spawn("a", |_| {});
        let b = Fiber::spawn("b", |_| {});
        q.push_back(a.clone(), Ok(Resume::Unit));
        q.push_front(b.clone(), Ok(Resume::Unit));
        assert_eq!(q.pop().unwrap().0.id(), b.id());
        assert_eq!(q.pop().unwrap().0.id(), a.id());
        a.resume(Ok(Resume::Unit));
        b.resume(Ok(Resume::Unit));
    }

    #[test]
    fn spawn_and_run_to_completion_via_scheduler() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        crate::test::run(move || {
            ran2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn snooze_yields_to_sibling_fiber_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        crate::test::run(move || {
            let child = Fiber::spawn("child", move |_| {
                o2.lock().unwrap().push("child-start");
                let _ = snooze();
                o2.lock().unwrap().push("child-end");
            });
            schedule(child, Ok(Resume::Unit));
            o1.lock().unwrap().push("root-start");
            let _ = snooze();
            o1.lock().unwrap().push("root-end");
        });
        let order = order.lock().unwrap().clone();
        assert_eq!(
            order,
            vec!["root-start", "child-start", "root-end", "child-end"]
        );
    }

    #[test]
    fn cancel_wakes_a_fiber_sleeping_in_the_reactor_with_cancelled() {
        let outcome = Arc::new(std::sync::Mutex::new(None));
        let outcome2 = outcome.clone();
        crate::test::run(move || {
            let victim = Fiber::spawn("victim", move |_| {
                let result = crate::reactor::sleep(std::time::Duration::from_secs(3600));
                *outcome2.lock().unwrap() = Some(result.is_err());
            });
            schedule(victim.clone(), Ok(Resume::Unit));
            // Give the victim a chance to actually reach `sleep` and
            // suspend before cancelling it.
            let _ = snooze();
            cancel(&victim);
        });
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }
}
