//! Completion-based engine built on Windows I/O completion ports.
//!
//! The original keeps a function-pointer pair embedded in every
//! operation's `OVERLAPPED` header so the engine can downcast a raw
//! completion pointer without a vtable. This rewrite takes the simpler
//! alternative the design notes license: every operation is boxed as the
//! same concrete [`OverlappedOp`], whose `OVERLAPPED` field sits at offset
//! zero, so a `*mut OVERLAPPED` handed back by the OS *is* a `*mut
//! OverlappedOp` — no tag, no vtable pointer, just one cast.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ioctx_log::{instrument, trace};
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::error::{Error, Result};
use crate::handler::{FnHandler, Handler};
use crate::interrupter::{Interrupter, WAKE_KEY};
use crate::timer::{TimerQueue, Token};

/// At most one thread elects to dispatch timers at a time; this caps how
/// long a non-electee waits before re-attempting election.
pub const TIMER_ELECTION_WAIT: Duration = Duration::from_millis(500);

/// Completion key posted to hand the timer-dispatching role to whoever
/// drains it next.
const TRANSFER_TIMER_DISPATCHING: usize = 1;
/// Completion key posted to forcibly reclaim the timer-dispatching role
/// from whichever thread currently holds it.
const STEAL_TIMER_DISPATCHING: usize = 2;

/// The `OVERLAPPED` header every submitted operation is boxed behind.
/// Its address is what `PostQueuedCompletionStatus`/the OS completion
/// carries, so it must never move after submission — enforced by always
/// handling it through `Box`.
#[repr(C)]
struct OverlappedOp {
    overlapped: OVERLAPPED,
    handler: Box<dyn Handler>,
}

impl OverlappedOp {
    fn into_raw(self: Box<Self>) -> *mut OVERLAPPED {
        Box::into_raw(self) as *mut OVERLAPPED
    }

    /// # Safety
    /// `ptr` must have come from `OverlappedOp::into_raw` and not been
    /// reconstructed already.
    unsafe fn from_raw(ptr: *mut OVERLAPPED) -> Box<Self> {
        Box::from_raw(ptr as *mut OverlappedOp)
    }
}

/// Construction knobs for [`Proactor`].
#[derive(Debug, Clone)]
pub struct ProactorBuilder {
    /// Timer wait cap per completion-port drain (§4.5 step 2's 500 ms).
    pub timer_wait_cap: Duration,
}

impl Default for ProactorBuilder {
    fn default() -> Self {
        Self {
            timer_wait_cap: TIMER_ELECTION_WAIT,
        }
    }
}

impl ProactorBuilder {
    /// Build the proactor with these settings.
    pub fn build(&self) -> io::Result<Proactor> {
        Proactor::new(self)
    }
}

/// The IOCP-backed proactor.
pub struct Proactor {
    iocp: HANDLE,
    interrupter: Interrupter,
    timers: Mutex<TimerQueue>,
    timer_thread: AtomicU64,
    outstanding_work: AtomicUsize,
    outstanding_operations: AtomicUsize,
    stopped: AtomicBool,
    shutdown: AtomicBool,
    timer_wait_cap: Duration,
}

// SAFETY: HANDLE is an opaque kernel object id; IOCP handles are explicitly
// documented by Windows as safe to share and call concurrently from
// multiple threads.
unsafe impl Send for Proactor {}
unsafe impl Sync for Proactor {}

impl Proactor {
    /// Build a proactor from `builder`'s settings.
    pub fn new(builder: &ProactorBuilder) -> io::Result<Self> {
        instrument!(ioctx_log::Level::TRACE, "Proactor::new");
        // SAFETY: passing INVALID_HANDLE_VALUE with no existing port
        // creates a fresh completion port not yet associated with any
        // file/socket.
        let iocp = unsafe { CreateIoCompletionPort(-1isize as HANDLE, 0, 0, 0) };
        if iocp == 0 {
            return Err(io::Error::last_os_error());
        }
        let interrupter = Interrupter::new(iocp as isize)?;
        Ok(Self {
            iocp,
            interrupter,
            timers: Mutex::new(TimerQueue::new()),
            timer_thread: AtomicU64::new(0),
            outstanding_work: AtomicUsize::new(0),
            outstanding_operations: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            timer_wait_cap: builder.timer_wait_cap,
        })
    }

    /// Associate a handle/socket with this completion port.
    pub fn attach(&self, handle: HANDLE) -> io::Result<()> {
        // SAFETY: handle is a valid, still-open kernel object owned by the
        // caller for at least the lifetime of this association.
        let res = unsafe { CreateIoCompletionPort(handle, self.iocp, 0, 0) };
        if res == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Bracket the start of user-visible outstanding work; pairs with
    /// [`Self::work_finished`]. While the count is above zero the engine
    /// will not report "no more work" from `run`.
    pub fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::AcqRel);
    }

    /// See [`Self::work_started`]. When the count reaches zero, a
    /// zero-completion is posted so every thread blocked in `run` observes
    /// "no more work" and returns.
    pub fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.interrupter.interrupt();
        }
    }

    /// Submit a boxed operation whose `OVERLAPPED` header the caller has
    /// already prepared and passed to the corresponding Win32 async call.
    /// Call this immediately before the OS call so the pointer returned is
    /// the one that call receives.
    pub fn prepare(&self, handler: Box<dyn Handler>) -> *mut OVERLAPPED {
        self.outstanding_operations.fetch_add(1, Ordering::AcqRel);
        Box::new(OverlappedOp {
            overlapped: unsafe { std::mem::zeroed() },
            handler,
        })
        .into_raw()
    }

    /// Schedule a timer; posts a wake if it becomes the new earliest
    /// deadline so the elected dispatcher thread re-checks the heap.
    pub fn schedule_timer(&self, deadline: Instant, token: Token, handler: Box<dyn Handler>) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        if timers.enqueue(deadline, token, handler) {
            drop(timers);
            self.post_key(STEAL_TIMER_DISPATCHING);
        }
    }

    /// Cancel all timers addressed by `token`; if anything was removed,
    /// wakes the current timer-dispatching thread to re-check the heap.
    pub fn cancel_timer(&self, token: Token) -> usize {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        let n = timers.cancel(token);
        drop(timers);
        if n > 0 {
            self.post_key(STEAL_TIMER_DISPATCHING);
        }
        n
    }

    /// Post a plain callback to run on whichever thread next drains the port.
    pub fn post(&self, f: impl FnOnce(Result<usize>) + Send + 'static) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.enqueue(Instant::now(), 0, Box::new(FnHandler(f)));
        drop(timers);
        self.post_key(STEAL_TIMER_DISPATCHING);
    }

    fn post_key(&self, key: usize) {
        // SAFETY: self.iocp is live for the lifetime of this proactor.
        unsafe {
            PostQueuedCompletionStatus(self.iocp, 0, key, std::ptr::null_mut());
        }
    }

    /// One-shot, idempotent stop.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.interrupter.interrupt();
        }
    }

    /// Clear the stopped flag so another `run` can proceed.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Drain the completion port once. Returns 1 if a completion was
    /// dispatched, 0 if the wait timed out with nothing ready.
    pub fn do_one(&self, block: bool) -> io::Result<usize> {
        instrument!(ioctx_log::Level::TRACE, "Proactor::do_one", block);
        if self.stopped.load(Ordering::Acquire) {
            return Ok(0);
        }

        let this_thread = current_thread_id();
        let elected = self
            .timer_thread
            .compare_exchange(0, this_thread, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let timeout = if elected {
            let timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers
                .wait_duration(Instant::now(), self.timer_wait_cap)
                .unwrap_or(self.timer_wait_cap)
        } else {
            self.timer_wait_cap
        };

        let mut bytes_transferred: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let timeout_ms = if block { timeout.as_millis() as u32 } else { 0 };

        // SAFETY: all three out-pointers are valid local stack slots.
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.iocp,
                &mut bytes_transferred,
                &mut key,
                &mut overlapped,
                timeout_ms,
            )
        };
        if elected {
            let now = Instant::now();
            let (fired, cancelled) = {
                let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
                timers.dispatch_timers(now);
                let cancelled = timers.dispatch_cancellations();
                (timers.take_ready(), cancelled)
            };
            for handler in fired {
                handler.complete(Ok(0));
            }
            TimerQueue::complete_cancellations(cancelled);
            self.timer_thread.store(0, Ordering::Release);
        }

        if overlapped.is_null() {
            if key == WAKE_KEY {
                self.interrupter.reset();
            }
            return Ok(0);
        }

        match key {
            TRANSFER_TIMER_DISPATCHING | STEAL_TIMER_DISPATCHING => {
                trace!("proactor timer-role completion, key={}", key);
                Ok(0)
            }
            _ => {
                // SAFETY: `overlapped` is a pointer this proactor itself
                // produced via `OverlappedOp::into_raw` in `prepare`.
                let op = unsafe { OverlappedOp::from_raw(overlapped) };
                self.outstanding_operations.fetch_sub(1, Ordering::AcqRel);
                // The engine's own posts carry the authoritative error in
                // the completion key; real I/O completions carry it in the
                // OS-reported last_error. Prefer the key only when the OS
                // itself reported success.
                let result = if ok == 0 {
                    Err(Error::Os(io::Error::last_os_error()))
                } else if key != 0 {
                    Err(Error::Os(io::Error::from_raw_os_error(key as i32)))
                } else {
                    Ok(bytes_transferred as usize)
                };
                op.handler.complete(result);
                Ok(1)
            }
        }
    }

    /// Drive the loop until stopped or no more outstanding work. Returns
    /// the number of completions dispatched.
    pub fn run(&self) -> io::Result<usize> {
        let mut n = 0;
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if self.outstanding_work.load(Ordering::Acquire) == 0 {
                break;
            }
            n += self.do_one(true)?;
        }
        Ok(n)
    }

    /// Sets `shutdown`, then drains the completion port until every
    /// outstanding operation has been destroyed without its completion
    /// body running (scenario 5: `outstanding_operations` reaches 0 before
    /// this returns).
    pub fn shutdown_service(&self) {
        self.shutdown.store(true, Ordering::Release);
        while self.outstanding_operations.load(Ordering::Acquire) > 0 {
            let mut bytes_transferred: u32 = 0;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            // SAFETY: out-pointers are valid local stack slots.
            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.iocp,
                    &mut bytes_transferred,
                    &mut key,
                    &mut overlapped,
                    0,
                )
            };
            if ok == 0 && overlapped.is_null() {
                break;
            }
            if !overlapped.is_null() && key != TRANSFER_TIMER_DISPATCHING && key != STEAL_TIMER_DISPATCHING {
                // SAFETY: see `do_one`.
                let op = unsafe { OverlappedOp::from_raw(overlapped) };
                self.outstanding_operations.fetch_sub(1, Ordering::AcqRel);
                drop(op); // destructor runs; completion body never invoked
            }
        }
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        self.shutdown_service();
        // SAFETY: iocp was created by this proactor and is closed exactly
        // once, here, after every outstanding operation has been drained.
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.iocp);
        }
    }
}

#[cfg(windows)]
fn current_thread_id() -> u64 {
    // SAFETY: GetCurrentThreadId takes no arguments and cannot fail.
    unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as u64 }
}
