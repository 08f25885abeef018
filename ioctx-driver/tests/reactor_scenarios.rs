//! End-to-end reactor scenarios against real, connected Unix domain
//! sockets, exercising the public `Reactor` API the way a facade crate
//! would.

#![cfg(unix)]

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use ioctx_driver::error::{Error, Result};
use ioctx_driver::handler::{Handler, ReactorOp};
use ioctx_driver::op_queue::Direction;
use ioctx_driver::reactor::{Reactor, ReactorBuilder};

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

struct ReadOp {
    fd: RawFd,
    buf: Vec<u8>,
    done: Box<dyn FnOnce(Result<usize>, Vec<u8>) + Send>,
}

impl Handler for ReadOp {
    fn complete(self: Box<Self>, result: Result<usize>) {
        (self.done)(result, self.buf)
    }
}

impl ReactorOp for ReadOp {
    fn perform(&mut self) -> Poll<Result<usize>> {
        let ret = unsafe {
            libc::read(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
            )
        };
        if ret >= 0 {
            Poll::Ready(Ok(ret as usize))
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                Poll::Pending
            } else {
                Poll::Ready(Err(Error::Os(err)))
            }
        }
    }
}

struct WriteOp {
    fd: RawFd,
    buf: Vec<u8>,
}

impl Handler for WriteOp {
    fn complete(self: Box<Self>, _result: Result<usize>) {}
}

impl ReactorOp for WriteOp {
    fn perform(&mut self) -> Poll<Result<usize>> {
        let ret = unsafe {
            libc::write(
                self.fd,
                self.buf.as_ptr() as *const libc::c_void,
                self.buf.len(),
            )
        };
        if ret >= 0 {
            Poll::Ready(Ok(ret as usize))
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                Poll::Pending
            } else {
                Poll::Ready(Err(Error::Os(err)))
            }
        }
    }
}

#[test]
fn echo_completes_with_bytes_written() {
    let (a, b) = UnixStream::pair().unwrap();
    set_nonblocking(a.as_raw_fd());
    set_nonblocking(b.as_raw_fd());

    let reactor = Reactor::new(&ReactorBuilder::default()).unwrap();
    reactor.register(a.as_raw_fd());
    reactor.register(b.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    let read_op = Box::new(ReadOp {
        fd: a.as_raw_fd(),
        buf: vec![0u8; 8],
        done: Box::new(move |res, buf| {
            tx.send((res, buf)).unwrap();
        }),
    });
    reactor.submit(a.as_raw_fd(), Direction::Read, read_op).unwrap();

    let write_op = Box::new(WriteOp {
        fd: b.as_raw_fd(),
        buf: b"hello\n\0\0".to_vec(),
    });
    reactor
        .submit(b.as_raw_fd(), Direction::Write, write_op)
        .unwrap();

    reactor.run().unwrap();

    let (res, buf) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(res.unwrap(), 8);
    assert_eq!(&buf, b"hello\n\0\0");
}

#[test]
fn cancel_during_wait_reports_operation_aborted() {
    let (a, _b) = UnixStream::pair().unwrap();
    set_nonblocking(a.as_raw_fd());

    let reactor = Arc::new(Reactor::new(&ReactorBuilder::default()).unwrap());
    reactor.register(a.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    let read_op = Box::new(ReadOp {
        fd: a.as_raw_fd(),
        buf: vec![0u8; 16],
        done: Box::new(move |res, _buf| {
            tx.send(res).unwrap();
        }),
    });
    reactor.submit(a.as_raw_fd(), Direction::Read, read_op).unwrap();

    let reactor2 = reactor.clone();
    let fd = a.as_raw_fd();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        reactor2.cancel(fd);
    });

    reactor.run().unwrap();
    canceller.join().unwrap();

    let res = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(res, Err(Error::OperationAborted)));
}

#[test]
fn timer_precedence_orders_by_deadline() {
    let reactor = Reactor::new(&ReactorBuilder::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    reactor.schedule_timer(
        Instant::now() + Duration::from_millis(40),
        2,
        Box::new(ioctx_driver::FnHandler(move |_: Result<usize>| {
            tx1.send("t2").unwrap();
        })),
    );
    let tx2 = tx.clone();
    reactor.schedule_timer(
        Instant::now() + Duration::from_millis(10),
        1,
        Box::new(ioctx_driver::FnHandler(move |_: Result<usize>| {
            tx2.send("t1").unwrap();
        })),
    );

    reactor.run().unwrap();

    assert_eq!(rx.recv().unwrap(), "t1");
    assert_eq!(rx.recv().unwrap(), "t2");
    assert_eq!(reactor.cancel_timer(1), 0);
}

#[test]
fn reactor_hup_removes_descriptor_from_interest_set() {
    let (a, b) = UnixStream::pair().unwrap();
    set_nonblocking(a.as_raw_fd());
    reactor_hup_impl(a, b);
}

fn reactor_hup_impl(a: UnixStream, b: UnixStream) {
    let reactor = Reactor::new(&ReactorBuilder::default()).unwrap();
    reactor.register(a.as_raw_fd());
    drop(b); // close the far end so `a` observes HUP

    // No ops are queued on `a`, so `run` with nothing else outstanding
    // returns immediately rather than looping on a dead descriptor.
    let completed = reactor.run_one(false).unwrap();
    assert_eq!(completed, 0);
}

#[test]
fn run_with_no_work_returns_immediately() {
    let reactor = Reactor::new(&ReactorBuilder::default()).unwrap();
    let completed = reactor.run().unwrap();
    assert_eq!(completed, 0);
}
