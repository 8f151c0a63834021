//! Error handling utils.
//!
//! Every fallible routine in the crate returns the crate-wide [`Error`].
//! Syscall failures travel as [`std::io::Error`] so the original errno stays
//! observable; the remaining variants map one-to-one onto the failure kinds
//! the server distinguishes (startup config problems, reactor registration,
//! I/O timeouts, malformed frames, an unreachable KV store and faulted
//! fibers).

use std::io;
use std::os::unix::io::RawFd;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration document could not be loaded or parsed. Fatal at
    /// startup.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// A system call failed with the wrapped errno.
    #[error("system call failed: {0}")]
    Syscall(#[from] io::Error),

    /// Registering interest with the reactor failed; any partial
    /// registration has already been rolled back.
    #[error("reactor registration failed on fd {fd}: {source}")]
    ReactorRegistration { fd: RawFd, source: io::Error },

    /// An I/O operation ran past its configured deadline. The descriptor
    /// itself is still usable.
    #[error("operation timed out")]
    Timeout,

    /// A frame failed validation (bad magic, short header, truncated
    /// payload).
    #[error("malformed frame: {0}")]
    FrameMalformed(&'static str),

    /// The KV store could not be reached or answered with an error. Never
    /// fatal; directory operations degrade.
    #[error("kv store unavailable: {0}")]
    KvUnavailable(String),

    /// A fiber panicked. The fiber is parked in the `Except` state and its
    /// scheduler slot has been reclaimed.
    #[error("fiber fault: {0}")]
    FiberFault(String),
}

impl Error {
    /// Last errno as a crate error.
    #[inline]
    pub fn last_os() -> Self {
        Error::Syscall(io::Error::last_os_error())
    }

    /// Whether this error means "the operation timed out", regardless of
    /// which layer reported it.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Syscall(e) => e.raw_os_error() == Some(libc::ETIMEDOUT),
            _ => false,
        }
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::Syscall(_) => "Syscall",
            Self::ReactorRegistration { .. } => "ReactorRegistration",
            Self::Timeout => "Timeout",
            Self::FrameMalformed(_) => "FrameMalformed",
            Self::KvUnavailable(_) => "KvUnavailable",
            Self::FiberFault(_) => "FiberFault",
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_detection() {
        assert!(Error::Timeout.is_timeout());
        let e = Error::Syscall(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        assert!(e.is_timeout());
        let e = Error::Syscall(io::Error::from_raw_os_error(libc::EAGAIN));
        assert!(!e.is_timeout());
    }

    #[test]
    fn variant_names() {
        assert_eq!(Error::Timeout.variant_name(), "Timeout");
        assert_eq!(
            Error::FrameMalformed("short header").variant_name(),
            "FrameMalformed"
        );
    }
}
