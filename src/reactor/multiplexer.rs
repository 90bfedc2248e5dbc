//! `mio`-backed readiness multiplexer.
//!
//! Plays the role `spec.md` assigns to libev: one call, [`Multiplexer::run`],
//! blocks (or peeks, in [`Mode::NoWait`]) until something is ready, then
//! schedules every fiber whose watcher fired. `mio`'s `Poll` only covers
//! socket/pipe readiness, so timers and child-process exits are layered on
//! top: a min-heap for the former, a SIGCHLD self-pipe (`signal-hook-mio`)
//! for the latter. Cross-thread wake reuses `mio::Waker`, which is exactly
//! libev's `ev_async` primitive in disguise.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token, Waker};

use super::Interest;
use crate::fiber::{self, Fiber, Resume};
use crate::process::ExitStatus;

const WAKE_TOKEN: Token = Token(0);
const SIGCHLD_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// How long [`Multiplexer::run`] is willing to block.
pub enum Mode {
    /// Block until at least one watcher fires (or forever, if none are
    /// armed and no timer is pending — the driving loop never calls this
    /// in that state, see [`super::Reactor::poll`]).
    Once,
    /// Never block; drain whatever is already ready and return.
    NoWait,
}

struct IoEntry {
    fd: RawFd,
    fiber: Fiber,
}

#[derive(PartialEq, Eq)]
struct TimerKey {
    deadline: Instant,
    id: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    signals: signal_hook_mio::v1_0::Signals,

    next_token: usize,
    io_watchers: HashMap<Token, IoEntry>,

    next_timer_id: u64,
    timer_heap: BinaryHeap<TimerKey>,
    timer_fibers: HashMap<u64, Fiber>,

    children: HashMap<libc::pid_t, Fiber>,

    /// Bookkeeping only, surfaced via `Reactor::pending_count`; always kept
    /// up to date since the cost of a handful of increments is negligible
    /// next to a syscall.
    pending: usize,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let mut signals = signal_hook_mio::v1_0::Signals::new([signal_hook::consts::SIGCHLD])?;
        poll.registry()
            .register(&mut signals, SIGCHLD_TOKEN, MioInterest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            waker,
            signals,
            next_token: FIRST_DYNAMIC_TOKEN,
            io_watchers: HashMap::new(),
            next_timer_id: 0,
            timer_heap: BinaryHeap::new(),
            timer_fibers: HashMap::new(),
            children: HashMap::new(),
            pending: 0,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Hands out a clone of the wake handle, so callers (namely
    /// [`super::Reactor`]) can wake the loop without going through this
    /// `Multiplexer`'s own, thread-confined, `&mut self` API.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Registers interest in `fd` becoming ready for `interest`, scheduling
    /// `fiber` when it does. Implements the arm half of `spec.md` §4.2.
    pub fn start_io(&mut self, fd: RawFd, interest: Interest, fiber: Fiber) -> Token {
        let token = self.alloc_token();
        let mut source = SourceFd(&fd);
        self.poll
            .registry()
            .register(&mut source, token, interest.to_mio())
            .expect("failed to register fd with the multiplexer");
        self.io_watchers.insert(token, IoEntry { fd, fiber });
        self.pending += 1;
        token
    }

    /// Disarms a watcher armed by [`Self::start_io`]. Idempotent: stopping
    /// an already-fired (and thus already-removed) watcher is a no-op,
    /// matching libev's `ev_io_stop` being safe to call on a stopped watcher.
    pub fn stop_io(&mut self, token: Token) {
        if let Some(entry) = self.io_watchers.remove(&token) {
            let mut source = SourceFd(&entry.fd);
            let _ = self.poll.registry().deregister(&mut source);
            self.pending -= 1;
        }
    }

    pub fn start_timer(&mut self, deadline: Instant, fiber: Fiber) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_heap.push(TimerKey { deadline, id });
        self.timer_fibers.insert(id, fiber);
        self.pending += 1;
        id
    }

    pub fn stop_timer(&mut self, id: u64) {
        if self.timer_fibers.remove(&id).is_some() {
            self.pending -= 1;
        }
        // The heap entry is left in place and skipped lazily; see
        // `next_timer_deadline` and `fire_expired_timers`.
    }

    pub fn start_child(&mut self, pid: libc::pid_t, fiber: Fiber) {
        self.children.insert(pid, fiber);
        self.pending += 1;
        // A child may have exited between the fork and this call; reap
        // eagerly so we don't wait for the next SIGCHLD that might never
        // come if the signal coalesced with an earlier one.
        self.reap_children();
    }

    pub fn stop_child(&mut self, pid: libc::pid_t) {
        if self.children.remove(&pid).is_some() {
            self.pending -= 1;
        }
    }

    fn next_timer_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.timer_heap.peek() {
            if self.timer_fibers.contains_key(&top.id) {
                return Some(top.deadline);
            }
            self.timer_heap.pop();
        }
        None
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        while let Some(top) = self.timer_heap.peek() {
            if top.deadline > now {
                break;
            }
            let id = self.timer_heap.pop().unwrap().id;
            if let Some(fiber) = self.timer_fibers.remove(&id) {
                self.pending -= 1;
                fiber::schedule(fiber, Ok(Resume::Unit));
            }
        }
    }

    fn reap_children(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            match self.children.remove(&pid) {
                Some(fiber) => {
                    self.pending -= 1;
                    fiber::schedule(
                        fiber,
                        Ok(Resume::ChildExit {
                            pid,
                            status: ExitStatus::from_raw(status),
                        }),
                    );
                }
                None => log::debug!("reaped untracked child pid={pid}"),
            }
        }
    }

    /// Runs one pass of the event loop. Implements `spec.md` §4.4's actual
    /// multiplexer call, beneath `Reactor::poll`'s anti-starvation gate.
    pub fn run(&mut self, mode: Mode) {
        let timeout = match mode {
            Mode::NoWait => Some(Duration::ZERO),
            Mode::Once => {
                let deadline = self.next_timer_deadline();
                deadline.map(|d| d.saturating_duration_since(Instant::now()))
            }
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::error!("multiplexer poll failed: {e}");
                return;
            }
        }

        let mut saw_sigchld = false;
        for event in self.events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                SIGCHLD_TOKEN => saw_sigchld = true,
                token => {
                    if let Some(entry) = self.io_watchers.get(&token) {
                        fiber::schedule(entry.fiber.clone(), Ok(Resume::Unit));
                    }
                }
            }
        }
        if saw_sigchld {
            for _ in self.signals.pending() {}
            self.reap_children();
        }
        self.fire_expired_timers();
    }
}
