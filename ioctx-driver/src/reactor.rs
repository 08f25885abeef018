//! Readiness-based engine built on Linux/BSD `epoll`/`kqueue` via the
//! `polling` crate, the same abstraction layer the teacher's `poll` driver
//! uses. One mutex covers the op-queues, the timer queue, and the
//! descriptor registry; it is released before the blocking wait.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ioctx_log::{instrument, trace};
use polling::{Event, Events, Poller};

use crate::error::Result;
use crate::handler::{BoxHandler, BoxReactorOp, FnHandler, Handler};
use crate::interrupter::Interrupter;
use crate::op_queue::{Direction, DescriptorQueues};
use crate::timer::{TimerQueue, Token};

/// Upper bound on how long `run(true)` ever blocks in one wait, regardless
/// of timer deadlines.
pub const MAX_WAIT: Duration = Duration::from_secs(5 * 60);

/// Construction knobs for [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    /// Event batch capacity per wait (§4.4 step 5's "≤ 128 events").
    pub event_capacity: usize,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self { event_capacity: 128 }
    }
}

impl ReactorBuilder {
    /// Build the reactor with these settings.
    pub fn build(&self) -> io::Result<Reactor> {
        Reactor::new(self)
    }
}

#[derive(Default)]
struct PerDescriptor {
    queues: DescriptorQueues,
    allow_speculative_read: bool,
    allow_speculative_write: bool,
}

impl PerDescriptor {
    fn fresh() -> Self {
        Self {
            queues: DescriptorQueues::new(),
            allow_speculative_read: true,
            allow_speculative_write: true,
        }
    }
}

struct Shared {
    poller: Arc<Poller>,
    registry: HashMap<RawFd, PerDescriptor>,
    timers: TimerQueue,
    pending_cancel: Vec<RawFd>,
}

/// The epoll/kqueue-backed reactor.
pub struct Reactor {
    inner: Mutex<Shared>,
    interrupter: Interrupter,
    event_capacity: usize,
    stopped: AtomicBool,
}

impl Reactor {
    /// Build a reactor from `builder`'s settings.
    pub fn new(builder: &ReactorBuilder) -> io::Result<Self> {
        instrument!(ioctx_log::Level::TRACE, "Reactor::new");
        let poller = Arc::new(Poller::new()?);
        let interrupter = Interrupter::new()?;
        // SAFETY: the interrupter's fd outlives the poller registration,
        // since both are owned by this Reactor and dropped together.
        unsafe {
            poller.add(interrupter.readable_handle(), Event::readable(usize::MAX))?;
        }
        Ok(Self {
            inner: Mutex::new(Shared {
                poller,
                registry: HashMap::new(),
                timers: TimerQueue::new(),
                pending_cancel: Vec::new(),
            }),
            interrupter,
            event_capacity: builder.event_capacity,
            stopped: AtomicBool::new(false),
        })
    }

    /// Register a descriptor with the reactor ahead of its first operation.
    /// Interest starts empty — level-triggered, added lazily by the first
    /// queued op, matching the original's `register_descriptor`.
    pub fn register(&self, fd: RawFd) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        shared.registry.entry(fd).or_insert_with(PerDescriptor::fresh);
    }

    /// Drop a descriptor from the reactor entirely. A later `register` with
    /// the same integer starts from a fresh state: speculative flags true,
    /// no ops queued.
    pub fn close_descriptor(&self, fd: RawFd) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut per_fd) = shared.registry.remove(&fd) {
            per_fd.queues.cancel_operations();
            // SAFETY: fd was registered with this poller.
            unsafe {
                shared
                    .poller
                    .delete(BorrowedFd::borrow_raw(fd))
                    .ok();
            }
            per_fd.queues.complete_operations();
        }
    }

    /// Queue a reactor operation for `dir` on `fd`. Attempts the
    /// speculative fast path first when nothing else is queued and the
    /// per-descriptor flag for `dir` allows it.
    pub fn submit(&self, fd: RawFd, dir: Direction, mut op: BoxReactorOp) -> io::Result<()> {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let per_fd = shared.registry.entry(fd).or_insert_with(PerDescriptor::fresh);

        let speculative_allowed = match dir {
            Direction::Read => per_fd.allow_speculative_read,
            Direction::Write => per_fd.allow_speculative_write,
            Direction::Except => false,
        };

        if speculative_allowed && !per_fd.queues.has(dir) {
            if let std::task::Poll::Ready(res) = op.perform() {
                drop(shared);
                op.complete(res);
                return Ok(());
            }
        }

        match dir {
            Direction::Read => per_fd.allow_speculative_read = false,
            Direction::Write => per_fd.allow_speculative_write = false,
            Direction::Except => {}
        }

        per_fd.queues.enqueue(dir, op);
        let event = descriptor_event(fd, per_fd);
        self.renew_interest(&mut shared, fd, event)?;
        Ok(())
    }

    /// Apply `event`'s interest mask to `fd`. Always attempts `modify`
    /// first per §4.4's "MOD-first, fall back to ADD on ENOENT" — a
    /// descriptor can accumulate concurrent read and write ops, so by the
    /// time a second direction is submitted the fd is typically already
    /// registered with the poller, and naively adding again would fail
    /// with `AlreadyExists`.
    fn renew_interest(&self, shared: &mut Shared, fd: RawFd, event: Event) -> io::Result<()> {
        // SAFETY: fd belongs to a descriptor this reactor owns and stays
        // registered with this poller for as long as it's in `registry`.
        let result = unsafe {
            let borrowed = BorrowedFd::borrow_raw(fd);
            shared.poller.modify(borrowed, event)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => unsafe { shared.poller.add(fd, event) },
            Err(e) => Err(e),
        }
    }

    /// Cancel every queued operation on `fd`. Wakes a blocked `run` so the
    /// cancellation is observed promptly.
    pub fn cancel(&self, fd: RawFd) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        shared.pending_cancel.push(fd);
        drop(shared);
        self.interrupter.interrupt();
    }

    /// Schedule a timer; wakes the loop if it becomes the new earliest
    /// deadline so the wait is recomputed.
    pub fn schedule_timer(&self, deadline: Instant, token: Token, handler: BoxHandler) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if shared.timers.enqueue(deadline, token, handler) {
            drop(shared);
            self.interrupter.interrupt();
        }
    }

    /// Cancel all timers addressed by `token`.
    pub fn cancel_timer(&self, token: Token) -> usize {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let n = shared.timers.cancel(token);
        drop(shared);
        if n > 0 {
            self.interrupter.interrupt();
        }
        n
    }

    /// Post a plain callback to run on whichever thread next drains the loop.
    pub fn post(&self, f: impl FnOnce(Result<usize>) + Send + 'static) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        shared.timers.enqueue(Instant::now(), 0, Box::new(FnHandler(f)));
        drop(shared);
        self.interrupter.interrupt();
    }

    /// One-shot, idempotent stop; a blocked `run` returns soon after.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.interrupter.interrupt();
        }
    }

    /// Clear the stopped flag so another `run` can proceed.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Run the loop once. `block` selects whether to wait for work or
    /// return immediately if none is ready. Returns the number of
    /// completions dispatched.
    pub fn run_one(&self, block: bool) -> io::Result<usize> {
        instrument!(ioctx_log::Level::TRACE, "Reactor::run_one", block);
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let mut ready = Vec::new();
        let cancelled_fds = std::mem::take(&mut shared.pending_cancel);
        for fd in cancelled_fds {
            if let Some(per_fd) = shared.registry.get_mut(&fd) {
                if per_fd.queues.cancel_operations() {
                    let event = descriptor_event(fd, per_fd);
                    self.renew_interest(&mut shared, fd, event).ok();
                    if let Some(per_fd) = shared.registry.get_mut(&fd) {
                        ready.extend(per_fd.queues.take_ready());
                    }
                }
            }
        }
        let mut cancelled_timers = shared.timers.dispatch_cancellations();

        let should_wait = !self.stopped.load(Ordering::Acquire) && {
            let idle = shared.registry.values().all(|p| p.queues.is_idle())
                && shared.timers.is_empty();
            block || !idle
        };

        if should_wait {
            let now = Instant::now();
            let timeout = if block {
                Some(shared.timers.wait_duration(now, MAX_WAIT).unwrap_or(MAX_WAIT))
            } else {
                Some(Duration::ZERO)
            };

            let poller = shared.poller.clone();
            drop(shared);

            let mut events = Events::with_capacity(
                std::num::NonZeroUsize::new(self.event_capacity)
                    .unwrap_or(std::num::NonZeroUsize::MIN),
            );
            poller.wait(&mut events, timeout)?;

            shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            for event in events.iter() {
                if event.key == usize::MAX {
                    self.interrupter.reset();
                    continue;
                }
                let fd = event.key as RawFd;
                let Some(per_fd) = shared.registry.get_mut(&fd) else {
                    continue;
                };
                trace!(
                    "reactor event fd={} readable={} writable={}",
                    fd, event.readable, event.writable
                );

                if event.readable {
                    per_fd.queues.perform_operation(Direction::Except);
                    per_fd.queues.perform_operation(Direction::Read);
                }
                if event.writable {
                    per_fd.queues.perform_operation(Direction::Write);
                }
                ready.extend(per_fd.queues.take_ready());

                if per_fd.queues.is_idle() {
                    // Pure HUP/ERR with nothing queued: drop interest
                    // entirely so the loop does not spin on a dead descriptor.
                    self.renew_interest(&mut shared, fd, Event::none(fd as usize))
                        .ok();
                    if let Some(p) = shared.registry.get_mut(&fd) {
                        p.allow_speculative_read = true;
                        p.allow_speculative_write = true;
                    }
                } else {
                    let p = shared.registry.get(&fd).expect("checked above");
                    let ev = descriptor_event(fd, p);
                    self.renew_interest(&mut shared, fd, ev).ok();
                }
            }

            let now = Instant::now();
            shared.timers.dispatch_timers(now);
            cancelled_timers.extend(shared.timers.dispatch_cancellations());
        }

        let fired_timers = shared.timers.take_ready();
        drop(shared);

        let completed = ready.len() + cancelled_timers.len() + fired_timers.len();
        for (op, res) in ready {
            op.complete(res);
        }
        TimerQueue::complete_cancellations(cancelled_timers);
        for handler in fired_timers {
            handler.complete(Ok(0));
        }

        Ok(completed)
    }

    /// Drive the loop until stopped or idle. Returns the number of
    /// completions dispatched.
    pub fn run(&self) -> io::Result<usize> {
        let mut n = 0;
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let idle = {
                let shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                shared.registry.values().all(|p| p.queues.is_idle()) && shared.timers.is_empty()
            };
            if idle {
                break;
            }
            n += self.run_one(true)?;
        }
        Ok(n)
    }
}

fn descriptor_event(fd: RawFd, per_fd: &PerDescriptor) -> Event {
    let mut event = Event::none(fd as usize);
    event.readable = per_fd.queues.has(Direction::Read) || per_fd.queues.has(Direction::Except);
    event.writable = per_fd.queues.has(Direction::Write);
    event
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .poller
            .as_raw_fd()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let mut shared = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let fds: Vec<RawFd> = shared.registry.keys().copied().collect();
        for fd in fds {
            // SAFETY: fd was registered with this poller and is being torn
            // down exactly once, here.
            unsafe {
                shared.poller.delete(BorrowedFd::borrow_raw(fd)).ok();
            }
        }
    }
}
