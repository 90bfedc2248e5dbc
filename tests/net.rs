//! End-to-end exercises of the reactor driving real non-blocking sockets.
//! Covers the echo-server, partial-write and cancellation-during-accept
//! scenarios named in `spec.md` §8.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fiber_reactor::prelude::*;

fn any_loopback_addr() -> SocketAddrV4 {
    "127.0.0.1:0".parse().unwrap()
}

fn local_addr(listener: &net::TcpListener) -> SocketAddrV4 {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            listener.as_raw_fd(),
            &mut sa as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    assert_eq!(rc, 0);
    let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr).to_be_bytes());
    SocketAddrV4::new(ip, u16::from_be(sa.sin_port))
}

#[test]
fn echoes_a_single_message_between_two_fibers() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();

    fiber_reactor::test::run(move || {
        let listener = net::TcpListener::bind(any_loopback_addr()).unwrap();
        let addr = local_addr(&listener);

        let server = Fiber::spawn("server", move |_| {
            let conn = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write(&buf[..n]).unwrap();
        });
        fiber::schedule(server, Ok(fiber::Resume::Unit));

        let client = Fiber::spawn("client", move |_| {
            let conn = net::TcpStream::connect(addr).unwrap();
            conn.write(b"ping").unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            received2.lock().unwrap().extend_from_slice(&buf[..n]);
        });
        fiber::schedule(client, Ok(fiber::Resume::Unit));
    });

    assert_eq!(&*received.lock().unwrap(), b"ping");
}

#[test]
fn write_transfers_every_byte_of_a_large_buffer() {
    // Large enough to force multiple partial writes on most kernel send
    // buffer sizes.
    const SIZE: usize = 4 * 1024 * 1024;
    let total_read = Arc::new(AtomicUsize::new(0));
    let total_read2 = total_read.clone();

    fiber_reactor::test::run(move || {
        let listener = net::TcpListener::bind(any_loopback_addr()).unwrap();
        let addr = local_addr(&listener);

        let server = Fiber::spawn("server", move |_| {
            let conn = listener.accept().unwrap();
            conn.read_loop(|chunk| {
                total_read2.fetch_add(chunk.len(), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        });
        fiber::schedule(server, Ok(fiber::Resume::Unit));

        let client = Fiber::spawn("client", move |_| {
            let conn = net::TcpStream::connect(addr).unwrap();
            let payload = vec![0xABu8; SIZE];
            let written = conn.write(&payload).unwrap();
            assert_eq!(written, SIZE);
            // Drop closes the socket, which is the client's EOF signal to
            // the server's `read_loop`.
        });
        fiber::schedule(client, Ok(fiber::Resume::Unit));
    });

    assert_eq!(total_read.load(Ordering::SeqCst), SIZE);
}

#[test]
fn read_to_eof_fills_a_fixed_buffer_across_multiple_reads() {
    // Large enough that the client's two separate writes can't possibly
    // land in a single `read(2)` call on the server side.
    const SIZE: usize = 64 * 1024;
    let received_len = Arc::new(AtomicUsize::new(0));
    let received_len2 = received_len.clone();

    fiber_reactor::test::run(move || {
        let listener = net::TcpListener::bind(any_loopback_addr()).unwrap();
        let addr = local_addr(&listener);

        let server = Fiber::spawn("server", move |_| {
            let conn = listener.accept().unwrap();
            let mut buf = vec![0u8; SIZE];
            let n = conn.read_to_eof(&mut buf).unwrap();
            received_len2.store(n, Ordering::SeqCst);
            // Filled completely, not just with whatever the first read
            // happened to return.
            assert_eq!(n, SIZE);
            assert!(buf.iter().all(|&b| b == 0xCD));
        });
        fiber::schedule(server, Ok(fiber::Resume::Unit));

        let client = Fiber::spawn("client", move |_| {
            let conn = net::TcpStream::connect(addr).unwrap();
            let half = vec![0xCDu8; SIZE / 2];
            conn.write(&half).unwrap();
            conn.write(&half).unwrap();
            // Held open until the server has read everything it asked for;
            // dropping early would turn the second half into a premature
            // EOF.
            let _ = fiber::snooze();
        });
        fiber::schedule(client, Ok(fiber::Resume::Unit));
    });

    assert_eq!(received_len.load(Ordering::SeqCst), SIZE);
}

#[test]
fn cancelling_a_fiber_parked_in_accept_returns_cancelled() {
    // A fiber cancelled while parked in `accept()` (no connection pending,
    // so no fd has been accepted yet) must observe `Error::Cancelled`
    // rather than hang forever or panic. The "close the leaked fd if
    // cancellation lands after `accept(2)` already returned a socket" half
    // of `spec.md` §4.10's rule is exercised directly by
    // `TcpListener::accept_one`'s own close-on-cancel branch; reproducing
    // that exact race from a test without scheduler-internal hooks would
    // be flaky, so it isn't simulated here.
    let outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();

    fiber_reactor::test::run(move || {
        let listener = net::TcpListener::bind(any_loopback_addr()).unwrap();
        let server = Fiber::spawn("server", move |_| {
            *outcome2.lock().unwrap() = Some(listener.accept().is_err());
        });
        fiber::schedule(server.clone(), Ok(fiber::Resume::Unit));
        // Let the server fiber reach `accept()`'s readiness wait (there is
        // no pending connection, so it suspends) before cancelling it.
        let _ = fiber::snooze();
        fiber::cancel(&server);
    });

    assert_eq!(*outcome.lock().unwrap(), Some(true));
}
