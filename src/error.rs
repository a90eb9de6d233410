//! Profiler status and error types

use std::io;
use thiserror::Error;

/// Errors returned by [`Memprof`](crate::session::Memprof) operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileError {
    /// The session is not in a state that allows the operation:
    /// starting while already profiling, or stopping when nothing runs.
    #[error("profiler is already running or not running at all")]
    Running,

    /// API misuse unrelated to the output stream, e.g. stopping a session
    /// with a different VM than the one it profiles.
    #[error("profiler used incorrectly")]
    Use,

    /// The output sink failed or asked to stop. `errno` is the OS error code
    /// that caused it, or 0 for a voluntary stop.
    #[error("profiler output stream failed: {}", describe_errno(.errno))]
    Io { errno: i32 },
}

pub type Result<T> = std::result::Result<T, ProfileError>;

fn describe_errno(errno: &i32) -> String {
    if *errno == 0 {
        "stopped by the consumer".to_string()
    } else {
        io::Error::from_raw_os_error(*errno).to_string()
    }
}

/// Numeric status codes for embedders that speak C
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    ErrUse = 1,
    ErrRunning = 2,
    ErrIo = 4,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl ProfileError {
    pub fn status(&self) -> Status {
        match self {
            ProfileError::Running => Status::ErrRunning,
            ProfileError::Use => Status::ErrUse,
            ProfileError::Io { .. } => Status::ErrIo,
        }
    }

    /// Preserved OS error code, if this is an I/O failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ProfileError::Io { errno } => Some(*errno),
            _ => None,
        }
    }
}

impl From<&Result<()>> for Status {
    fn from(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(err) => err.status(),
        }
    }
}

/// OS error code to preserve for a failed sink write.
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
