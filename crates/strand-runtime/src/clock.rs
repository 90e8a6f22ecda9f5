//! Monotonic time against a process-wide anchor
//!
//! Deadlines inside the runtime are absolute microsecond counts on this
//! clock, which keeps timer arithmetic in plain integers.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

#[inline]
fn anchor() -> Instant {
    *ANCHOR.get_or_init(Instant::now)
}

/// Microseconds elapsed since the first call into the clock.
#[inline]
pub fn now_us() -> u64 {
    anchor().elapsed().as_micros() as u64
}

/// Nanoseconds elapsed since the first call into the clock.
#[inline]
pub fn now_ns() -> u64 {
    anchor().elapsed().as_nanos() as u64
}

/// Absolute deadline `timeout` from now, saturating.
#[inline]
pub fn deadline_us(timeout: Duration) -> u64 {
    now_us().saturating_add(timeout.as_micros().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_deadline_in_future() {
        let d = deadline_us(Duration::from_millis(5));
        assert!(d > now_us());
    }
}
