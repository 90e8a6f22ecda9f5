//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended lock suspends the calling fiber
//! instead of blocking its worker thread (non-fiber callers park the OS
//! thread through the same event). The lock word lives in the event cell:
//! 0 free, 1 held, 2 held with waiters; unlock only issues a wake after
//! observing contention.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use strand_core::error::FiberError;

use crate::event::WaitableEvent;
use crate::runtime::{Runtime, RuntimeInner};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct FiberMutex<T> {
    rt: Arc<RuntimeInner>,
    event: Arc<WaitableEvent>,
    data: UnsafeCell<T>,
}

// Safety: the event protocol grants exclusive access to the data.
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(rt: &Runtime, value: T) -> Self {
        FiberMutex {
            rt: Arc::clone(rt.inner()),
            event: WaitableEvent::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, suspending the caller while contended.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        self.raw_lock();
        FiberMutexGuard { mutex: self }
    }

    /// Try to acquire without waiting.
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        if self
            .event
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(FiberMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub(crate) fn raw_lock(&self) {
        if self
            .event
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.raw_lock_contended();
    }

    /// Acquire while always announcing contention. Condvar wakeups relock
    /// through this path: broadcast parks the remaining waiters on this
    /// event, and only a contended-marked word guarantees every unlock
    /// keeps waking the next one.
    pub(crate) fn raw_lock_contended(&self) {
        loop {
            // Announce contention and grab the lock in one swap; whoever
            // swapped 0 out owns it.
            if self.event.value().swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            match self.event.wait(&self.rt, CONTENDED, None) {
                // Interruption does not abort a lock acquisition; the flag
                // was consumed, the wait just retries.
                Ok(())
                | Err(FiberError::WouldBlock)
                | Err(FiberError::Interrupted)
                | Err(FiberError::Stopping) => continue,
                Err(_) => continue,
            }
        }
    }

    pub(crate) fn raw_unlock(&self) {
        if self.event.value().swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.event.wake(&self.rt);
        }
    }

    pub(crate) fn event(&self) -> &Arc<WaitableEvent> {
        &self.event
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeInner> {
        &self.rt
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("FiberMutex").field("data", &*guard).finish(),
            None => f
                .debug_struct("FiberMutex")
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

/// Releases the mutex on drop.
pub struct FiberMutexGuard<'a, T> {
    pub(crate) mutex: &'a FiberMutex<T>,
}

impl<'a, T> Deref for FiberMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for FiberMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lock_from_thread() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let mutex = FiberMutex::new(&rt, 0u32);
        {
            let mut g = mutex.lock();
            *g = 42;
        }
        assert_eq!(*mutex.lock(), 42);
        rt.stop();
    }

    #[test]
    fn test_try_lock() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let mutex = FiberMutex::new(&rt, ());
        let g = mutex.try_lock();
        assert!(g.is_some());
        assert!(mutex.try_lock().is_none());
        drop(g);
        assert!(mutex.try_lock().is_some());
        rt.stop();
    }

    #[test]
    fn test_contended_increments_across_fibers() {
        let rt = Runtime::with_concurrency(4).unwrap();
        let mutex = Arc::new(FiberMutex::new(&rt, 0u64));
        let done = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            let done = Arc::clone(&done);
            ids.push(
                rt.spawn(move || {
                    for _ in 0..500 {
                        *mutex.lock() += 1;
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for tid in ids {
            rt.join(tid).unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(*mutex.lock(), 4000);
        rt.stop();
    }

    #[test]
    fn test_into_inner() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let mutex = FiberMutex::new(&rt, 7u32);
        assert_eq!(mutex.into_inner(), 7);
        rt.stop();
    }
}
