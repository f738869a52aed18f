//! The error vocabulary of the daemon core.
//!
//! Every fallible operation of the [`Manager`](crate::Manager) reports one
//! of the kinds below; the bus frontend maps them to bus error names. The
//! core itself never panics on I/O problems.

use std::io;

/// Errors reported by the daemon core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An allocation or resource limit was hit
    #[error("out of resources")]
    OutOfResources,
    /// A caller-supplied argument was rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The referenced entity does not exist
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The caller is not allowed to perform the operation
    #[error("permission denied")]
    PermissionDenied,
    /// The operation conflicts with current state (VT in use, inhibitor active, …)
    #[error("busy: {0}")]
    Busy(&'static str),
    /// An operation on sysfs, evdev, udev or a state file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The host lacks support for the requested operation
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Error::Io(errno.into())
    }
}
