//! The handler/operation abstraction.
//!
//! The original keeps a function-pointer pair (invoke, destroy) embedded in
//! every operation's OS-visible header so the engine can downcast from a
//! raw pointer without a vtable. This rewrite takes the alternative the
//! design notes license explicitly: a plain trait object. Nothing here
//! needs pointer stability for a vtable lookup — only the proactor's
//! `Overlapped` header needs a stable address, and that's guaranteed by
//! boxing the operation once and never moving it out of the box.

use std::task::Poll;

use crate::error::Result;

/// A completion callback, invoked exactly once.
pub trait Handler: Send {
    /// Run the callback with the operation's outcome.
    fn complete(self: Box<Self>, result: Result<usize>);
}

/// A reactor operation: a handler that can attempt its own I/O.
///
/// `perform` must be idempotent on `Poll::Pending` — the op-queue may call
/// it again on the next readiness event without the caller having observed
/// any side effect beyond what the first, unsuccessful attempt already
/// committed (e.g. bytes already read are never re-read).
pub trait ReactorOp: Handler {
    /// Attempt the operation without blocking. `Poll::Ready` means the
    /// operation is finished and `complete` should run; `Poll::Pending`
    /// means it would block and should stay queued.
    fn perform(&mut self) -> Poll<Result<usize>>;
}

/// Boxed handler, downgraded to the base trait once queued.
pub type BoxHandler = Box<dyn Handler>;

/// Boxed reactor operation.
pub type BoxReactorOp = Box<dyn ReactorOp>;

/// A closure-backed [`Handler`], for posting plain callbacks via
/// `Engine::post`/`dispatch` rather than a full I/O operation.
pub struct FnHandler<F: FnOnce(Result<usize>) + Send>(pub F);

impl<F: FnOnce(Result<usize>) + Send> Handler for FnHandler<F> {
    fn complete(self: Box<Self>, result: Result<usize>) {
        (self.0)(result)
    }
}
