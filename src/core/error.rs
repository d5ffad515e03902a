use std::io;

use thiserror::Error;

/// Errors produced by the container runtime core.
///
/// Locally recoverable kinds (`CgroupUnavailable`, `ChildGone`) are logged and
/// swallowed close to where they occur; everything else propagates to the
/// caller.
#[derive(Debug, Error)]
pub enum MiniconError {
    /// Bad container name, empty or dangerous command.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No container with the given id.
    #[error("container {0} not found")]
    NotFound(String),

    /// Operation forbidden in the container's current state.
    #[error("container {id} is not in the {expected} state")]
    WrongState { id: String, expected: &'static str },

    /// Path traversal attempt or invalid hostname.
    #[error("security violation: {0}")]
    Security(String),

    /// A kernel primitive (`unshare`, `mount`, `chroot`, ...) failed.
    #[error("{op} failed: {source}")]
    Kernel {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    /// Cgroup v2 is missing or a cgroup write failed. Never fatal for start.
    #[error("cgroup unavailable: {0}")]
    CgroupUnavailable(String),

    /// The container process is already gone (`ECHILD` / `ESRCH`).
    #[error("container process already gone")]
    ChildGone,

    /// Registry or filesystem IO failure.
    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),

    /// Registry (de)serialization failure.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A container could not be started.
    #[error("failed to start container {id}: {reason}")]
    StartFailed { id: String, reason: String },

    /// Unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MiniconError {
    /// Wrap a failed kernel call, keeping the numeric errno.
    pub fn kernel(op: &'static str, errno: nix::errno::Errno) -> Self {
        Self::Kernel { op, source: errno }
    }

    /// Wrap an IO error from a `/proc` or `/sys` write as a kernel failure,
    /// preserving the OS error code when one exists.
    pub fn kernel_io(op: &'static str, err: io::Error) -> Self {
        let errno = err
            .raw_os_error()
            .map(nix::errno::Errno::from_raw)
            .unwrap_or(nix::errno::Errno::EIO);
        Self::Kernel { op, source: errno }
    }
}

pub type Result<T> = std::result::Result<T, MiniconError>;
