//! `eventfd`-backed interrupter: one counter the kernel reports readable
//! whenever it is non-zero.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::syscall;

pub struct Interrupter {
    fd: OwnedFd,
}

impl Interrupter {
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: eventfd just returned a fresh, owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        Ok(Self { fd })
    }

    /// Transition from quiescent to signalled. Idempotent while signalled:
    /// writing again just adds to the kernel counter, which `reset` always
    /// drains back to zero in one read.
    pub fn interrupt(&self) {
        let one: u64 = 1;
        // SAFETY: fd is a valid eventfd; EAGAIN (counter would overflow) is
        // not a correctness issue here, it only means "already signalled".
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Return to quiescent.
    pub fn reset(&self) {
        let mut buf: u64 = 0;
        // SAFETY: fd is a valid eventfd; EAGAIN means it was already
        // quiescent, which is the postcondition we want anyway.
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// The descriptor the multiplexer should watch for readability.
    pub fn readable_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for Interrupter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_then_reset_round_trips() {
        let i = Interrupter::new().unwrap();
        i.interrupt();
        i.interrupt(); // idempotent while signalled
        i.reset();
        i.reset(); // idempotent while quiescent
    }
}
