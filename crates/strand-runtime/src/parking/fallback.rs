//! Portable wait word for platforms without a futex syscall
//!
//! Mutex + Condvar emulation. Wakers take the mutex before notifying so a
//! waiter that observed the expected value cannot miss a wake between its
//! check and its sleep.

use std::sync::atomic::AtomicU32;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct FutexWord {
    val: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl FutexWord {
    pub const fn new(initial: u32) -> Self {
        FutexWord {
            val: AtomicU32::new(initial),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.val
    }

    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> bool {
        use std::sync::atomic::Ordering;

        let mut guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.val.load(Ordering::Acquire) != expected {
            return true;
        }
        match timeout {
            Some(d) => {
                let (g, result) = match self.cond.wait_timeout(guard, d) {
                    Ok(r) => r,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard = g;
                drop(guard);
                !result.timed_out()
            }
            None => {
                let g = match self.cond.wait(guard) {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                drop(g);
                true
            }
        }
    }

    /// A Condvar cannot report how many threads it woke; report none so
    /// callers that distribute wakes keep signaling further targets.
    pub fn wake(&self, n: u32) -> usize {
        let guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        drop(guard);
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
        0
    }
}
