//! Linux futex-backed wait word
//!
//! Word semantics are the caller's business; this just exposes
//! compare-and-sleep / wake over `SYS_futex` with the private flag.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

pub struct FutexWord {
    val: AtomicU32,
}

impl FutexWord {
    pub const fn new(initial: u32) -> Self {
        FutexWord {
            val: AtomicU32::new(initial),
        }
    }

    /// The underlying atomic, for callers updating the word under their own
    /// synchronization before waking.
    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.val
    }

    /// Sleep while the word equals `expected`.
    ///
    /// Returns false only when `timeout` elapsed; spurious returns and
    /// value-changed returns report true, callers re-check their predicate.
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> bool {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.val.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return true;
        }
        let errno = unsafe { *libc::__errno_location() };
        errno != libc::ETIMEDOUT
    }

    /// Wake up to `n` sleepers, returning how many were woken.
    pub fn wake(&self, n: u32) -> usize {
        let n = n.min(i32::MAX as u32) as i32;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.val.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc > 0 {
            rc as usize
        } else {
            0
        }
    }
}
