//! Per-descriptor FIFO queues of pending reactor operations.
//!
//! One [`DescriptorQueues`] per registered descriptor, holding three
//! independent FIFOs (read / write / except). The reactor consults the
//! union of these to decide what interest mask a descriptor needs.

use std::collections::VecDeque;
use std::task::Poll;

use crate::error::{Error, Result};
use crate::handler::BoxReactorOp;

/// Which of a descriptor's three directions an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
    Except,
}

/// The three FIFOs belonging to one descriptor.
#[derive(Default)]
pub struct DescriptorQueues {
    read: VecDeque<BoxReactorOp>,
    write: VecDeque<BoxReactorOp>,
    except: VecDeque<BoxReactorOp>,
    ready: Vec<(BoxReactorOp, Result<usize>)>,
}

impl DescriptorQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, dir: Direction) -> &mut VecDeque<BoxReactorOp> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
            Direction::Except => &mut self.except,
        }
    }

    fn queue(&self, dir: Direction) -> &VecDeque<BoxReactorOp> {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
            Direction::Except => &self.except,
        }
    }

    /// Append `op` to `dir`'s queue. Returns `true` iff it is now the sole
    /// entry — the caller must then make sure the descriptor's OS interest
    /// mask covers `dir`.
    pub fn enqueue(&mut self, dir: Direction, op: BoxReactorOp) -> bool {
        let q = self.queue_mut(dir);
        q.push_back(op);
        q.len() == 1
    }

    /// Run `perform` on the head of `dir`'s queue. If it finishes, the head
    /// moves to the ready queue and the new head (if any) is left for next
    /// time. Returns whether any entries remain queued for `dir`.
    pub fn perform_operation(&mut self, dir: Direction) -> bool {
        let q = self.queue_mut(dir);
        let Some(mut op) = q.pop_front() else {
            return false;
        };
        match op.perform() {
            Poll::Ready(res) => {
                self.ready.push((op, res));
            }
            Poll::Pending => {
                q.push_front(op);
            }
        }
        !self.queue(dir).is_empty()
    }

    /// Move every queued op across all three directions to the ready queue
    /// with `operation_aborted`. Returns whether anything was cancelled.
    pub fn cancel_operations(&mut self) -> bool {
        let mut any = false;
        for dir in [Direction::Read, Direction::Write, Direction::Except] {
            let q = self.queue_mut(dir);
            while let Some(op) = q.pop_front() {
                self.ready.push((op, Err(Error::OperationAborted)));
                any = true;
            }
        }
        any
    }

    /// True if no direction has anything queued (the descriptor can be
    /// dropped from the OS interest set).
    pub fn is_idle(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    /// Whether `dir` currently has anything queued.
    pub fn has(&self, dir: Direction) -> bool {
        !self.queue(dir).is_empty()
    }

    /// Drain and run every ready completion. Must be called without the
    /// engine's lock held.
    pub fn complete_operations(&mut self) {
        for (op, res) in self.ready.drain(..) {
            op.complete(res);
        }
    }

    /// Drain the ready queue without running completions, so the caller can
    /// invoke them after releasing whatever lock guards this structure.
    pub fn take_ready(&mut self) -> Vec<(BoxReactorOp, Result<usize>)> {
        std::mem::take(&mut self.ready)
    }
}
