//! End-to-end echo scenario through the public facade, against a real
//! `socket2::Socket` pair.

#![cfg(unix)]

use std::rc::Rc;

use ioctx::fd::AsyncFd;
use ioctx::Engine;
use socket2::{Domain, Socket, Type};

fn socket_pair() -> (Socket, Socket) {
    let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    (Socket::from(a), Socket::from(b))
}

#[test]
fn echo_round_trip_through_async_fd() {
    let engine = Rc::new(Engine::new_default().unwrap());
    let (a, b) = socket_pair();

    let a = AsyncFd::attach(a, engine.clone()).unwrap();
    let b = AsyncFd::attach(b, engine.clone()).unwrap();

    let written = b.write(b"hello\n\0\0".to_vec()).unwrap();
    assert_eq!(written, 8);

    let (read, buf) = a.read(8).unwrap();
    assert_eq!(read, 8);
    assert_eq!(&buf, b"hello\n\0\0");
}

#[test]
fn cancel_aborts_a_pending_read() {
    use std::os::fd::AsRawFd;

    let engine = Rc::new(Engine::new_default().unwrap());
    let (a, _b) = socket_pair();
    let raw_fd = a.as_raw_fd();
    let fd = AsyncFd::attach(a, engine.clone()).unwrap();

    // `Reactor` is `Send + Sync`; only it, not the `Rc`-based `Engine`,
    // needs to cross the thread boundary to cancel a pending operation
    // while the main thread blocks inside `read`.
    let reactor = engine.core();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            reactor.cancel(raw_fd);
        });
        let err = fd.read(4).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    });
}

#[test]
fn dropping_an_attached_fd_closes_it_in_the_handle_service() {
    let engine = Rc::new(Engine::new_default().unwrap());
    let (a, _b) = socket_pair();
    {
        let _fd = AsyncFd::attach(a, engine.clone()).unwrap();
        assert_eq!(engine.handle_count(), 1);
    }
    assert_eq!(engine.handle_count(), 0);
}
