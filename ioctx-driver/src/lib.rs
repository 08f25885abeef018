//! Reactor/proactor execution core: the engine that multiplexes
//! descriptor readiness or completion, runs a shared timer queue, and
//! dispatches user handlers exactly once each.

#![warn(missing_docs)]

/// Helper macro to execute a raw syscall and turn `-1`/`FALSE`/`INVALID_HANDLE_VALUE`
/// into `io::Error::last_os_error()`.
#[cfg(unix)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    ($e:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(windows)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    (BOOL, $e:expr) => {
        $crate::syscall!($e, == 0)
    };
    ($e:expr, $op:tt $rhs:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res $op $rhs {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod error;
pub mod handler;
pub mod interrupter;
pub mod op_queue;
pub mod service;
pub mod timer;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod reactor;
        pub use reactor::{Reactor, ReactorBuilder};
    } else if #[cfg(windows)] {
        pub mod proactor;
        pub use proactor::{Proactor, ProactorBuilder};
    }
}

pub use error::{Error, Result};
pub use handler::{FnHandler, Handler};
pub use timer::Token;
