//! A minimal attached-handle wrapper demonstrating the driver's per-handle
//! service and op-queues against a real socket, the way the teacher's
//! `Attacher` demonstrates `compio-driver`'s descriptor attachment.
//!
//! This is not a socket library: it exposes exactly enough to drive and
//! test the engine end to end, per the non-goal that rules out a general
//! socket API.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::mpsc;
use std::task::Poll;

use ioctx_driver::error::{Error, Result};
use ioctx_driver::handler::{Handler, ReactorOp};
use ioctx_driver::op_queue::Direction;
use ioctx_driver::service::HandleKey;

use crate::Engine;

struct ChannelOp {
    fd: RawFd,
    buf: Vec<u8>,
    write: bool,
    tx: mpsc::SyncSender<(Result<usize>, Vec<u8>)>,
}

impl Handler for ChannelOp {
    fn complete(self: Box<Self>, result: Result<usize>) {
        let _ = self.tx.send((result, self.buf));
    }
}

impl ReactorOp for ChannelOp {
    fn perform(&mut self) -> Poll<Result<usize>> {
        let ret = if self.write {
            unsafe {
                libc::write(
                    self.fd,
                    self.buf.as_ptr() as *const libc::c_void,
                    self.buf.len(),
                )
            }
        } else {
            unsafe {
                libc::read(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                )
            }
        };
        if ret >= 0 {
            Poll::Ready(Ok(ret as usize))
        } else {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Poll::Pending
            } else {
                Poll::Ready(Err(Error::Os(err)))
            }
        }
    }
}

/// A socket (or other stream descriptor) attached to an [`Engine`]'s
/// reactor, with its lifetime tracked by the engine's handle service and a
/// bookkeeping node drawn from the engine's shared pool.
pub struct AsyncFd<S: AsRawFd> {
    source: S,
    engine: Rc<Engine>,
    key: HandleKey,
    node: NonNull<u8>,
}

impl<S: AsRawFd> AsyncFd<S> {
    /// Attach `source` to `engine`: registers it with the reactor, records
    /// it in the handle service, and draws one bookkeeping node from the
    /// shared pool.
    pub fn attach(source: S, engine: Rc<Engine>) -> io::Result<Self> {
        let fd = source.as_raw_fd();
        set_nonblocking(fd)?;
        engine.core.register(fd);
        let key = engine.handles.construct(());
        let node = engine
            .node_pool
            .allocate_node()
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            source,
            engine,
            key,
            node,
        })
    }

    /// Queue a read into `buf`'s first `len` bytes and block this thread,
    /// running the engine's loop, until it completes.
    pub fn read(&self, len: usize) -> io::Result<(usize, Vec<u8>)> {
        self.run_op(Direction::Read, vec![0u8; len], false)
    }

    /// Queue a write of `buf` and block this thread, running the engine's
    /// loop, until it completes.
    pub fn write(&self, buf: Vec<u8>) -> io::Result<usize> {
        let (n, _) = self.run_op(Direction::Write, buf, true)?;
        Ok(n)
    }

    fn run_op(
        &self,
        dir: Direction,
        buf: Vec<u8>,
        write: bool,
    ) -> io::Result<(usize, Vec<u8>)> {
        let (tx, rx) = mpsc::sync_channel(1);
        let fd = self.source.as_raw_fd();
        let op = Box::new(ChannelOp { fd, buf, write, tx });
        self.engine.core.submit(fd, dir, op)?;
        loop {
            match rx.try_recv() {
                Ok((res, buf)) => return res.map(|n| (n, buf)).map_err(Into::into),
                Err(mpsc::TryRecvError::Empty) => {
                    self.engine.core.run_one(true)?;
                }
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(io::Error::other("ioctx engine dropped the operation"));
                }
            }
        }
    }

    /// Cancel every operation currently queued on this descriptor.
    pub fn cancel(&self) {
        self.engine.core.cancel(self.source.as_raw_fd());
    }

    /// Borrow the underlying source.
    pub fn get_ref(&self) -> &S {
        &self.source
    }
}

impl<S: AsRawFd> Drop for AsyncFd<S> {
    fn drop(&mut self) {
        self.engine.core.close_descriptor(self.source.as_raw_fd());
        self.engine.handles.destroy(self.key);
        self.engine.node_pool.deallocate_node(self.node);
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
