//! The top-level handle to one execution core: an owned reactor/proactor
//! plus the node pool its operations and handles draw from.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use ioctx_driver::service::HandleService;
use ioctx_pool::SharedNodePool;

#[cfg(unix)]
use ioctx_driver::reactor::{Reactor, ReactorBuilder};
#[cfg(windows)]
use ioctx_driver::proactor::{Proactor, ProactorBuilder};

/// Size in bytes of one node drawn from [`Engine`]'s shared pool. Sized for
/// a `HandleKey` plus a small amount of bookkeeping; callers needing larger
/// nodes should keep their own pool rather than grow this one.
const HANDLE_NODE_SIZE: usize = 32;

/// Construction knobs for [`Engine`], mirroring `ProactorBuilder` /
/// `ReactorBuilder` at the driver layer plus the node-pool tuning this crate
/// adds on top.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    /// Event batch capacity per wait (unix reactor only).
    pub event_capacity: usize,
    /// Upper bound a non-electing proactor thread waits before re-checking
    /// for the timer-dispatching role (windows proactor only).
    pub timer_wait_cap: Duration,
    /// Nodes per block in the handle-bookkeeping pool.
    pub nodes_per_block: usize,
    /// Blocks kept in reserve by [`NodePool::deallocate_free_blocks`] before
    /// trimming further.
    ///
    /// [`NodePool::deallocate_free_blocks`]: ioctx_pool::NodePool::deallocate_free_blocks
    pub max_free_blocks: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            event_capacity: 128,
            timer_wait_cap: Duration::from_millis(500),
            nodes_per_block: 64,
            max_free_blocks: 2,
        }
    }
}

impl EngineBuilder {
    /// Build the engine with these settings.
    pub fn build(&self) -> io::Result<Engine> {
        Engine::new(self)
    }
}

/// The platform driver backing this [`Engine`]: [`Reactor`] on Unix,
/// [`Proactor`] on Windows.
#[cfg(unix)]
pub type Core = Reactor;
/// The platform driver backing this [`Engine`]: [`Reactor`] on Unix,
/// [`Proactor`] on Windows.
#[cfg(windows)]
pub type Core = Proactor;

/// One execution core: the platform reactor/proactor, a shared pool for
/// handle bookkeeping nodes, and the table of currently-open handles.
pub struct Engine {
    pub(crate) core: Core,
    pub(crate) handles: HandleService<()>,
    pub(crate) node_pool: SharedNodePool,
}

impl Engine {
    /// Build an engine with default settings.
    pub fn new_default() -> io::Result<Self> {
        EngineBuilder::default().build()
    }

    /// Build an engine from `builder`'s settings.
    pub fn new(builder: &EngineBuilder) -> io::Result<Self> {
        #[cfg(unix)]
        let core = Reactor::new(&ReactorBuilder {
            event_capacity: builder.event_capacity,
        })?;
        #[cfg(windows)]
        let core = Proactor::new(&ProactorBuilder {
            timer_wait_cap: builder.timer_wait_cap,
        })?;

        Ok(Self {
            core,
            handles: HandleService::new(),
            node_pool: SharedNodePool::new(
                HANDLE_NODE_SIZE,
                builder.nodes_per_block,
                builder.max_free_blocks,
            ),
        })
    }

    /// Access the underlying reactor/proactor.
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Number of handles currently attached to this engine.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Run the loop until stopped or idle. Returns the number of
    /// completions dispatched.
    pub fn run(&self) -> io::Result<usize> {
        self.core.run()
    }

    /// Run the loop exactly once; `block` selects whether to wait for work.
    pub fn run_one(&self, block: bool) -> io::Result<usize> {
        #[cfg(unix)]
        {
            self.core.run_one(block)
        }
        #[cfg(windows)]
        {
            self.core.do_one(block)
        }
    }

    /// One-shot stop; a blocked `run` returns soon after.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Schedule `f` to run the next time this engine's loop drains,
    /// regardless of which thread called `post`.
    pub fn post(&self, f: impl FnOnce(ioctx_driver::error::Result<usize>) + Send + 'static) {
        #[cfg(unix)]
        {
            self.core.post(f);
        }
        #[cfg(windows)]
        {
            self.core.post(f);
        }
    }

    /// Wall-clock deadline `duration` from now, for scheduling timers
    /// against this engine's clock.
    pub fn deadline(&self, duration: Duration) -> Instant {
        Instant::now() + duration
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Engine>>> = const { RefCell::new(None) };
}

/// Restores the thread-local `CURRENT` engine on drop, including on
/// unwind, so a panicking `f` inside [`enter`] cannot leave the wrong
/// engine installed for whoever calls `current()` next.
struct RestoreGuard(Option<Rc<Engine>>);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| *cell.borrow_mut() = self.0.take());
    }
}

/// Make `engine` the thread's current engine for the duration of `f`,
/// restoring whatever was current before on return — or on unwind, via a
/// drop guard, mirroring the teacher's scoped-current pattern. Implemented
/// with a plain thread-local since this facade is synchronous rather than
/// task-based.
pub fn enter<R>(engine: Rc<Engine>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(engine));
    let _guard = RestoreGuard(previous);
    f()
}

/// The thread's current engine, set by the innermost [`enter`] call still on
/// the stack.
///
/// # Panics
///
/// Panics if called outside an [`enter`] scope, matching the teacher's
/// `Runtime::current`.
pub fn current() -> Rc<Engine> {
    CURRENT
        .with(|cell| cell.borrow().clone())
        .expect("no ioctx engine is current on this thread; call ioctx::enter first")
}

/// Whether a current engine is set on this thread.
pub fn is_set() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}
