//! `ioctx`: a portable asynchronous I/O execution core.
//!
//! This crate is the facade over [`ioctx_driver`]'s reactor (Unix,
//! `epoll`/`kqueue` via `polling`) and proactor (Windows, IOCP): an
//! [`Engine`] you build once per thread, attach descriptors to via
//! [`fd::AsyncFd`], and drive with [`Engine::run`].
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! let engine = Rc::new(ioctx::Engine::new_default().unwrap());
//! ioctx::enter(engine.clone(), || {
//!     // submit work against `ioctx::current()` here
//! });
//! ```

#![warn(missing_docs)]

mod engine;

#[cfg(unix)]
pub mod fd;

pub use engine::{current, enter, is_set, Core, Engine, EngineBuilder};
pub use ioctx_driver::error::{Error, Result};
