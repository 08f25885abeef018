//! Error taxonomy for the reactor/proactor core.
//!
//! Operation completions carry one of these; everything that is not one of
//! the named kinds collapses into `Error::Os`, carrying the platform code
//! verbatim, matching the "*system*" row of the taxonomy this enum covers.

use std::io;

/// An error surfaced through an operation's completion, or synchronously
/// from an engine call that cannot continue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cancelled by `cancel()` or by closing a descriptor with ops still queued.
    #[error("operation aborted")]
    OperationAborted,
    /// End of stream: a proactor read returned zero bytes with no OS error.
    #[error("end of file")]
    Eof,
    /// The handle or descriptor is not open.
    #[error("bad descriptor")]
    BadDescriptor,
    /// `assign` was invoked on an already-open handle.
    #[error("already open")]
    AlreadyOpen,
    /// Multi-threaded cancellation attempted on a platform without a
    /// cross-thread cancellation primitive, with prior ops started from
    /// more than one thread.
    #[error("operation not supported")]
    OperationNotSupported,
    /// The node pool or its segment manager could not satisfy an allocation.
    #[error("no memory available")]
    NoMemory,
    /// Any other OS-reported failure, carrying the platform code verbatim.
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl Error {
    /// True for the sentinel this crate uses to mark a cancelled operation.
    pub fn is_operation_aborted(&self) -> bool {
        matches!(self, Error::OperationAborted)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::OperationAborted => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
            Error::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
            Error::BadDescriptor => io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            Error::AlreadyOpen => io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()),
            Error::OperationNotSupported => {
                io::Error::new(io::ErrorKind::Unsupported, e.to_string())
            }
            Error::NoMemory => io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()),
            Error::Os(inner) => inner,
        }
    }
}

/// Result alias used throughout the driver.
pub type Result<T> = std::result::Result<T, Error>;
