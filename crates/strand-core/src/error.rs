//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur in runtime operations
///
/// Timeouts and interruptions are ordinary, recoverable outcomes that
/// callers are expected to branch on; they are errors only in the Result
/// sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// Malformed attribute, an id that never existed, or self-join
    InvalidArgument,

    /// A non-blocking check failed (event value mismatch)
    WouldBlock,

    /// A deadline elapsed before the awaited condition occurred
    TimedOut,

    /// An explicit interruption preempted the wait
    Interrupted,

    /// The fiber was asked to stop while blocked
    Stopping,

    /// Stack, slot or queue capacity exhausted
    ResourceExhausted,

    /// Policy violation, e.g. shrinking worker concurrency
    PermissionDenied,

    /// The timer thread is stopping and rejected the task
    TimerStopped,

    /// The runtime or component was already started
    AlreadyStarted,

    /// The runtime has no running workers (not started or already stopped)
    NotRunning,
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::InvalidArgument => write!(f, "invalid argument"),
            FiberError::WouldBlock => write!(f, "operation would block"),
            FiberError::TimedOut => write!(f, "operation timed out"),
            FiberError::Interrupted => write!(f, "operation interrupted"),
            FiberError::Stopping => write!(f, "fiber is stopping"),
            FiberError::ResourceExhausted => write!(f, "resource exhausted"),
            FiberError::PermissionDenied => write!(f, "permission denied"),
            FiberError::TimerStopped => write!(f, "timer thread stopped"),
            FiberError::AlreadyStarted => write!(f, "already started"),
            FiberError::NotRunning => write!(f, "runtime not running"),
        }
    }
}

impl std::error::Error for FiberError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", FiberError::TimedOut), "operation timed out");
        assert_eq!(format!("{}", FiberError::WouldBlock), "operation would block");
    }

    #[test]
    fn test_error_is_std_error() {
        fn assert_error<E: std::error::Error>(_e: E) {}
        assert_error(FiberError::Interrupted);
    }
}
