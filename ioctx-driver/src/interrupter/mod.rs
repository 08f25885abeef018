//! A process-private signalling object used to break a blocked multiplexer
//! wait. Construction failure is fatal — without an interrupter the engine
//! cannot safely accept new work while a thread is parked in the OS wait.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::Interrupter;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::{Interrupter, WAKE_KEY};
    }
}
