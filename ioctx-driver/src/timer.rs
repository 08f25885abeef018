//! Deadline-ordered timer queue, addressable by an opaque caller token.
//!
//! A plain `BinaryHeap` can't support token cancellation without scanning,
//! so entries live in a `BTreeMap` keyed by `(deadline, sequence)` — `Ord`
//! on `Instant` plus a monotonic sequence number gives FIFO among equal
//! deadlines for free, and removal by key is `O(log n)`. A second map from
//! token to the set of keys it owns makes `cancel` touch only its own
//! entries instead of scanning the whole queue.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::handler::Handler;

/// Opaque identity used to address a pending timer for cancellation. The
/// caller chooses this value; several entries may legitimately share one.
pub type Token = u64;

type Key = (Instant, u64);

struct Entry {
    token: Token,
    handler: Box<dyn Handler>,
}

/// A min-heap of timer entries keyed by deadline, cancellable by token.
#[derive(Default)]
pub struct TimerQueue {
    entries: BTreeMap<Key, Entry>,
    by_token: HashMap<Token, Vec<Key>>,
    cancelled: Vec<Box<dyn Handler>>,
    ready: Vec<Box<dyn Handler>>,
    next_seq: u64,
}

impl TimerQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `handler` to fire at `deadline`, addressable later by
    /// `token`. Returns `true` iff this entry is now the earliest pending
    /// deadline.
    pub fn enqueue(&mut self, deadline: Instant, token: Token, handler: Box<dyn Handler>) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = (deadline, seq);
        self.entries.insert(key, Entry { token, handler });
        self.by_token.entry(token).or_default().push(key);
        self.entries
            .keys()
            .next()
            .is_some_and(|earliest| *earliest == key)
    }

    /// Remove every entry addressed by `token`; each is queued for
    /// dispatch with [`Error::OperationAborted`]. Returns the count removed.
    pub fn cancel(&mut self, token: Token) -> usize {
        let Some(keys) = self.by_token.remove(&token) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.cancelled.push(entry.handler);
                removed += 1;
            }
        }
        removed
    }

    /// True if no timers are pending or cancelled awaiting dispatch.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.cancelled.is_empty() && self.ready.is_empty()
    }

    /// Time until the earliest deadline, clamped to `[0, cap]`. `None` if
    /// the queue is empty (caller should use the plain cap).
    pub fn wait_duration(&self, now: Instant, cap: Duration) -> Option<Duration> {
        let (deadline, _) = *self.entries.keys().next()?;
        Some(deadline.saturating_duration_since(now).min(cap))
    }

    /// Move every entry with `deadline <= now` into the ready queue.
    pub fn dispatch_timers(&mut self, now: Instant) {
        loop {
            let Some((&key, _)) = self.entries.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let entry = self.entries.remove(&key).expect("just peeked");
            if let Some(keys) = self.by_token.get_mut(&entry.token) {
                keys.retain(|k| k != &key);
                if keys.is_empty() {
                    self.by_token.remove(&entry.token);
                }
            }
            self.ready.push(entry.handler);
        }
    }

    /// Move cancelled entries onto the ready queue (kept separate from
    /// `dispatch_timers` so cancellation results carry `operation_aborted`
    /// while normal firing carries `Ok`).
    pub fn dispatch_cancellations(&mut self) -> Vec<Box<dyn Handler>> {
        std::mem::take(&mut self.cancelled)
    }

    /// Run every ready, normally-fired handler. Must be called without
    /// holding whatever lock guards the queue's mutable state. Returns how
    /// many ran.
    pub fn complete_timers(&mut self) -> usize {
        let ready = std::mem::take(&mut self.ready);
        let n = ready.len();
        for handler in ready {
            handler.complete(Ok(0));
        }
        n
    }

    /// Take the ready, normally-fired handlers without running them, so the
    /// caller can invoke them after releasing a lock.
    pub fn take_ready(&mut self) -> Vec<Box<dyn Handler>> {
        std::mem::take(&mut self.ready)
    }

    /// Run every cancelled handler collected by [`Self::dispatch_cancellations`].
    pub fn complete_cancellations(cancelled: Vec<Box<dyn Handler>>) {
        for handler in cancelled {
            handler.complete(Err(Error::OperationAborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use std::sync::mpsc;

    fn handler(tx: mpsc::Sender<&'static str>, label: &'static str) -> Box<dyn Handler> {
        Box::new(FnHandler(move |_: crate::error::Result<usize>| {
            tx.send(label).unwrap();
        }))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let (tx, rx) = mpsc::channel();
        q.enqueue(now + Duration::from_millis(20), 2, handler(tx.clone(), "t2"));
        q.enqueue(now + Duration::from_millis(10), 1, handler(tx.clone(), "t1"));

        q.dispatch_timers(now + Duration::from_millis(15));
        q.complete_timers();
        assert_eq!(rx.try_recv().unwrap(), "t1");
        assert!(rx.try_recv().is_err());

        q.dispatch_timers(now + Duration::from_millis(25));
        q.complete_timers();
        assert_eq!(rx.try_recv().unwrap(), "t2");
    }

    #[test]
    fn cancel_after_fire_returns_zero() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel();
        q.enqueue(now, 1, handler(tx, "t1"));
        q.dispatch_timers(now);
        q.complete_timers();
        assert_eq!(q.cancel(1), 0);
    }

    #[test]
    fn cancel_removes_only_its_token() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let (tx, rx) = mpsc::channel();
        q.enqueue(now + Duration::from_secs(1), 1, handler(tx.clone(), "a"));
        q.enqueue(now + Duration::from_secs(1), 2, handler(tx.clone(), "b"));

        assert_eq!(q.cancel(1), 1);
        let cancelled = q.dispatch_cancellations();
        assert_eq!(cancelled.len(), 1);
        TimerQueue::complete_cancellations(cancelled);
        assert_eq!(rx.try_recv().unwrap(), "a");

        q.dispatch_timers(now + Duration::from_secs(2));
        q.complete_timers();
        assert_eq!(rx.try_recv().unwrap(), "b");
    }
}
