//! Error types for muxline.

use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by the public construction and registration APIs.
///
/// Inside the event loop failures are turned into state transitions and
/// callbacks instead; this type only crosses API boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed.
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The fd does not fit the preallocated socket table.
    #[error("fd {fd} outside socket table (capacity {capacity})")]
    FdOutOfRange { fd: i32, capacity: usize },

    /// The buffer pool could not satisfy a request.
    #[error("buffer pool exhausted ({requested} bytes requested)")]
    PoolExhausted { requested: usize },

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The reactor is shutting down or already stopped.
    #[error("reactor stopped")]
    Stopped,

    #[error("shard {0} does not exist")]
    NoSuchShard(usize),

    /// A shard's command inbox is full.
    #[error("shard {0} inbox full")]
    InboxFull(usize),

    #[error("shard {shard} failed to start: {reason}")]
    ShardStart { shard: usize, reason: String },
}

impl Error {
    /// Wrap the current `errno` for `op`.
    #[inline]
    pub fn last_os(op: &'static str) -> Self {
        Error::Os { op, errno: Errno::last() }
    }

    #[inline]
    pub fn os(op: &'static str, errno: Errno) -> Self {
        Error::Os { op, errno }
    }

    /// The errno behind this error, if it came from a system call.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os { errno, .. } => Some(*errno),
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
