//! Error types shared by all backends.

use thiserror::Error;

/// Recoverable failures surfaced across the API boundary.
///
/// Programming errors (dangling handles, over-limit descriptor counts,
/// driver-level pipeline failures) are not represented here; those paths go
/// through [`fatal!`](crate::fatal) and abort the process.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU found")]
    NoSuitableGpu,
    #[error("failed to load the GPU runtime: {0}")]
    RuntimeUnavailable(String),
    #[error("device allocation failed: {0}")]
    AllocationFailed(String),
    #[error("resource creation failed: {0}")]
    CreationFailed(&'static str),
    #[error("shader reflection failed: {0}")]
    ReflectionFailed(&'static str),
    #[error("semaphore wait timed out")]
    Timeout,
}

pub type GpuResult<T> = Result<T, GpuError>;

/// Logs `file:line: message` and returns the given error. Mirror of the
/// recoverable-failure convention used by every fallible operation.
macro_rules! recoverable {
    ($err:expr, $($arg:tt)*) => {{
        log::error!("{}:{}: {}", file!(), line!(), format_args!($($arg)*));
        return Err($err);
    }};
}

/// Unrecoverable programming error: logs `file:line: message` and aborts.
/// These paths are unreachable in correct callers.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("{}:{}: {}", file!(), line!(), format_args!($($arg)*));
        panic!("{}", format_args!($($arg)*));
    }};
}

pub(crate) use fatal;
pub(crate) use recoverable;
