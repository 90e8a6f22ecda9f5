//! Fiber-aware condition variable
//!
//! A sequence word on an event: `wait` samples the sequence, releases the
//! mutex and sleeps while the sequence is unchanged; `signal` bumps it and
//! wakes one waiter. `broadcast` wakes one waiter and requeues the rest
//! onto the mutex's own event, so N waiters do not stampede the lock;
//! they are handed over one unlock at a time.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use strand_core::error::{FiberError, FiberResult};
use strand_core::spinlock::SpinLock;

use crate::clock;
use crate::event::WaitableEvent;
use crate::runtime::{Runtime, RuntimeInner};

use super::mutex::FiberMutexGuard;

pub struct FiberCondvar {
    rt: Arc<RuntimeInner>,
    seq: Arc<WaitableEvent>,
    /// Event of the mutex used in `wait`, captured for broadcast requeue.
    mutex_event: SpinLock<Option<Arc<WaitableEvent>>>,
}

impl FiberCondvar {
    pub fn new(rt: &Runtime) -> Self {
        FiberCondvar {
            rt: Arc::clone(rt.inner()),
            seq: WaitableEvent::new(0),
            mutex_event: SpinLock::new(None),
        }
    }

    /// Release the guard's mutex, wait for a signal, reacquire.
    ///
    /// Spurious returns are allowed (as with every condition variable);
    /// callers loop on their predicate.
    pub fn wait<T>(&self, guard: &mut FiberMutexGuard<'_, T>) -> FiberResult<()> {
        self.wait_inner(guard, None)
    }

    /// Like [`FiberCondvar::wait`] with a timeout; `Err(TimedOut)` when it
    /// elapsed first. The mutex is reacquired either way.
    pub fn wait_for<T>(
        &self,
        guard: &mut FiberMutexGuard<'_, T>,
        timeout: Duration,
    ) -> FiberResult<()> {
        self.wait_inner(guard, Some(clock::deadline_us(timeout)))
    }

    fn wait_inner<T>(
        &self,
        guard: &mut FiberMutexGuard<'_, T>,
        deadline_us: Option<u64>,
    ) -> FiberResult<()> {
        let mutex = guard.mutex;
        {
            let mut ev = self.mutex_event.lock();
            if ev.is_none() {
                *ev = Some(Arc::clone(mutex.event()));
            }
        }
        let expected = self.seq.value().load(Ordering::Acquire);
        mutex.raw_unlock();
        let result = self.seq.wait(&self.rt, expected, deadline_us);
        // Relock announcing contention: after a broadcast the remaining
        // waiters sit on the mutex event and are only woken by unlocks
        // that observe the contended mark.
        mutex.raw_lock_contended();
        match result {
            Err(FiberError::TimedOut) => Err(FiberError::TimedOut),
            // Value moved, wake, or interruption: all surface as a
            // (possibly spurious) wakeup.
            _ => Ok(()),
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.seq.value().fetch_add(1, Ordering::Release);
        self.seq.wake(&self.rt);
    }

    /// Wake one waiter and requeue the rest onto the mutex.
    pub fn broadcast(&self) {
        self.seq.value().fetch_add(1, Ordering::Release);
        let mutex_event = self.mutex_event.lock().clone();
        match mutex_event {
            Some(ev) => {
                self.seq.requeue(&self.rt, &ev);
            }
            // Nobody ever waited; nothing can be requeued.
            None => {
                self.seq.wake_all(&self.rt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mutex::FiberMutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_wakes_fiber() {
        let rt = Runtime::with_concurrency(2).unwrap();
        let pair = Arc::new((FiberMutex::new(&rt, false), FiberCondvar::new(&rt)));
        let pair2 = Arc::clone(&pair);

        let tid = rt
            .spawn(move || {
                let (lock, cvar) = &*pair2;
                let mut ready = lock.lock();
                while !*ready {
                    cvar.wait(&mut ready).unwrap();
                }
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        {
            let (lock, cvar) = &*pair;
            *lock.lock() = true;
            cvar.signal();
        }
        rt.join(tid).unwrap();
        rt.stop();
    }

    #[test]
    fn test_wait_for_times_out() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let mutex = FiberMutex::new(&rt, ());
        let cvar = FiberCondvar::new(&rt);
        let mut guard = mutex.lock();
        let begin = std::time::Instant::now();
        let result = cvar.wait_for(&mut guard, Duration::from_millis(50));
        assert_eq!(result, Err(FiberError::TimedOut));
        assert!(begin.elapsed() >= Duration::from_millis(40));
        // The mutex is held again after the timeout.
        drop(guard);
        assert!(mutex.try_lock().is_some());
        rt.stop();
    }

    #[test]
    fn test_broadcast_releases_all() {
        let rt = Runtime::with_concurrency(4).unwrap();
        let state = Arc::new((FiberMutex::new(&rt, false), FiberCondvar::new(&rt)));
        let woken = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..6 {
            let state = Arc::clone(&state);
            let woken = Arc::clone(&woken);
            ids.push(
                rt.spawn(move || {
                    let (lock, cvar) = &*state;
                    let mut go = lock.lock();
                    while !*go {
                        cvar.wait(&mut go).unwrap();
                    }
                    drop(go);
                    woken.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        std::thread::sleep(Duration::from_millis(100));
        {
            let (lock, cvar) = &*state;
            *lock.lock() = true;
            cvar.broadcast();
        }
        for tid in ids {
            rt.join(tid).unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 6);
        rt.stop();
    }
}
