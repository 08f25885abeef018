//! IOCP's completion port already doubles as a wakeable queue, so "kernel
//! observable event" here is a reserved completion key posted with no
//! overlapped pointer — `GetQueuedCompletionStatus` wakes for it exactly
//! like a real I/O completion, and the proactor loop recognises the key
//! and does nothing but loop back to re-check state.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

use crate::syscall;

/// Reserved completion key identifying a wake-up post rather than a real
/// I/O completion.
pub const WAKE_KEY: usize = 0;

pub struct Interrupter {
    iocp: isize,
    signalled: AtomicBool,
}

impl Interrupter {
    pub fn new(iocp: isize) -> io::Result<Self> {
        Ok(Self {
            iocp,
            signalled: AtomicBool::new(false),
        })
    }

    /// Post a wake completion, unless one is already outstanding.
    pub fn interrupt(&self) {
        if self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: `self.iocp` is a live completion port for the
            // lifetime of this interrupter.
            unsafe {
                syscall!(BOOL, PostQueuedCompletionStatus(
                    self.iocp,
                    0,
                    WAKE_KEY,
                    std::ptr::null_mut(),
                ))
                .ok();
            }
        }
    }

    /// Called once the wake completion has been observed.
    pub fn reset(&self) {
        self.signalled.store(false, Ordering::Release);
    }

    /// There is no separate descriptor to watch: the completion port
    /// itself is the readable handle.
    pub fn readable_handle(&self) -> isize {
        self.iocp
    }
}
