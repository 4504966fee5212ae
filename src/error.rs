//! Error handling utils.
//!
//! Recoverable operating-system failures are reported to the immediate
//! caller through this module's [`Error`]. Programming-invariant
//! violations (double event registration, resuming a fiber in the wrong
//! state) are asserted instead and abort the process. The hooked
//! syscalls in [`hook`](crate::hook) keep libc conventions: they report
//! failure through their return value and `errno`, never through
//! [`Result`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// `epoll_ctl` rejected an event (un)registration.
    #[error("epoll_ctl({op}) failed for fd {fd}: {source}")]
    EventRegistration {
        fd: libc::c_int,
        op: &'static str,
        source: io::Error,
    },
}

impl Error {
    /// Last OS error wrapped as an event-registration failure.
    pub(crate) fn epoll(fd: libc::c_int, op: &'static str) -> Self {
        Error::EventRegistration {
            fd,
            op,
            source: io::Error::last_os_error(),
        }
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
