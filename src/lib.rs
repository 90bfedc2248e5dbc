//! A single-threaded, fiber-oriented non-blocking I/O reactor.
//!
//! One [`reactor::Reactor`] per OS thread multiplexes socket readiness,
//! timers, child-process exits and cross-thread wake-ups on behalf of
//! cooperatively scheduled [`fiber::Fiber`]s. A fiber suspends itself with
//! [`fiber::suspend`] (and the higher-level operations built on it —
//! [`net::TcpStream::read`], [`fiber::snooze`], [`reactor::sleep`], ...)
//! and is resumed once whatever it was waiting for happens.
//!
//! ```no_run
//! use std::net::SocketAddrV4;
//! use fiber_reactor::prelude::*;
//!
//! scheduler::run(|| {
//!     let addr: SocketAddrV4 = "127.0.0.1:7000".parse().unwrap();
//!     let listener = net::TcpListener::bind(addr).unwrap();
//!     listener
//!         .accept_loop(|stream| {
//!             let conn = fiber::Fiber::spawn("conn", move |_| {
//!                 let mut buf = [0u8; 1024];
//!                 if let Ok(n) = stream.read(&mut buf) {
//!                     if n > 0 {
//!                         let _ = stream.write(&buf[..n]);
//!                     }
//!                 }
//!             });
//!             fiber::schedule(conn, Ok(fiber::Resume::Unit));
//!             Ok(())
//!         })
//!         .unwrap();
//! });
//! ```
//!
//! This crate grew out of the same lineage as `tarantool-module`'s
//! `fiber`/`coio` layer: a thin Rust surface over a non-blocking event
//! loop driving cooperatively scheduled units of execution. There, the
//! loop and the fibers are supplied by the embedding Tarantool process;
//! here they're supplied by this crate itself (see [`fiber`] and
//! [`scheduler`]).

pub mod error;
pub mod fiber;
pub mod io;
pub mod net;
pub mod process;
pub mod reactor;
pub mod scheduler;

pub mod test;

pub use error::{Error, Result};

/// Common imports for code built on this crate.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fiber::{self, Fiber};
    pub use crate::net;
    pub use crate::process;
    pub use crate::reactor::{self, Interest, Reactor};
    pub use crate::scheduler;
}
