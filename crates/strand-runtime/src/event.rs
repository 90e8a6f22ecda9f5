//! The waitable event: the runtime's futex-like wait/wake primitive
//!
//! One event is a 32-bit value cell plus a FIFO list of waiter records
//! under a lock. `wait` fails fast when the value mismatches (the
//! optimistic check that lock-free fast paths rely on); otherwise the
//! caller suspends and is enqueued by its worker *after* the switch, with
//! the value re-checked under the list lock, so a concurrent wake cannot
//! slip between check and enqueue.
//!
//! Each waiter carries an outcome word that exactly one of {waker, timer
//! timeout, interrupt} claims; the list lock serializes the claim, and the
//! loser's side effects (an already-fired timer task) are absorbed through
//! the timer's unschedule protocol.
//!
//! Waiters of non-fiber threads (and of Inline-class fibers, which cannot
//! suspend) block on a private futex word instead of suspending.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_utils::Backoff;

use strand_core::error::{FiberError, FiberResult};
use strand_core::id::{FiberId, TimerId};
use strand_core::spinlock::SpinLock;

use crate::clock;
use crate::meta::FiberEntity;
use crate::parking::FutexWord;
use crate::runtime::RuntimeInner;
use crate::stack::{suspend, SwitchAction};
use crate::timer::UNSCHEDULE_RUNNING;
use crate::tls;

/// Waits shorter than this report TimedOut immediately.
const MIN_SLEEP_US: u64 = 2;

/// Waiter outcome states. Exactly one non-pending state wins per wait.
const OUTCOME_PENDING: u32 = 0;
const OUTCOME_WOKEN: u32 = 1;
const OUTCOME_TIMEDOUT: u32 = 2;
const OUTCOME_UNMATCHED: u32 = 3;
const OUTCOME_INTERRUPTED: u32 = 4;
const OUTCOME_STOPPED: u32 = 5;

const SIG_NONE: u32 = 0;
const SIG_SIGNALLED: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WaiterKind {
    /// A suspended coroutine fiber; woken by requeueing its id.
    Fiber,
    /// A parked OS thread (or Inline fiber); woken through `sig`.
    Thread,
}

/// One wait in progress.
pub struct Waiter {
    kind: WaiterKind,
    outcome: AtomicU32,
    /// Waiting fiber, INVALID for plain-thread waiters.
    fiber: FiberId,
    expected: u32,
    /// Absolute deadline; the timeout task is scheduled by `commit_wait`
    /// once the waiter is queued, never earlier.
    deadline_us: Option<u64>,
    /// Raw TimerId of the timeout task racing this wait.
    sleep_id: AtomicU64,
    /// The event whose list currently holds this waiter. Only mutated with
    /// that event's list lock held; `Weak` so a destroyed event reads as
    /// detached instead of dangling.
    container: SpinLock<Option<Weak<WaitableEvent>>>,
    /// Thread-waiter wake flag.
    sig: FutexWord,
}

impl Waiter {
    fn new(kind: WaiterKind, fiber: FiberId, expected: u32, deadline_us: Option<u64>) -> Arc<Self> {
        Arc::new(Waiter {
            kind,
            outcome: AtomicU32::new(OUTCOME_PENDING),
            fiber,
            expected,
            deadline_us,
            sleep_id: AtomicU64::new(0),
            container: SpinLock::new(None),
            sig: FutexWord::new(SIG_NONE),
        })
    }

    /// Claim an outcome; false if another path already won.
    fn claim(&self, outcome: u32) -> bool {
        self.outcome
            .compare_exchange(OUTCOME_PENDING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Futex-like event cell. Always handled through `Arc`.
pub struct WaitableEvent {
    value: AtomicU32,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl WaitableEvent {
    pub fn new(initial: u32) -> Arc<Self> {
        Arc::new(WaitableEvent {
            value: AtomicU32::new(initial),
            waiters: Mutex::new(VecDeque::new()),
        })
    }

    /// The value cell. Mutations are the caller's protocol; wakes publish
    /// them to late waiters through the fast-path fence.
    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.value
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Waiter>>> {
        self.waiters.lock().expect("event waiter list poisoned")
    }

    /// Block until woken, unless the value no longer equals `expected`.
    ///
    /// Fiber callers suspend cooperatively; non-fiber callers (and Inline
    /// fibers) park the OS thread. `deadline_us` is absolute on the
    /// runtime clock. Returns:
    /// - `Ok(())` woken by a matching wake (or requeue)
    /// - `Err(WouldBlock)` value mismatched before queueing
    /// - `Err(TimedOut)` the deadline won the race
    /// - `Err(Interrupted)` / `Err(Stopping)` interruption won
    pub fn wait(
        self: &Arc<Self>,
        rt: &RuntimeInner,
        expected: u32,
        deadline_us: Option<u64>,
    ) -> FiberResult<()> {
        if self.value.load(Ordering::Relaxed) != expected {
            // Callers often act on event-guarded state right after a failed
            // wait; make prior writes of the mutator visible.
            fence(Ordering::Acquire);
            return Err(FiberError::WouldBlock);
        }
        if !tls::in_coroutine_fiber() {
            return self.wait_from_thread(rt, expected, deadline_us);
        }

        if let Some(deadline) = deadline_us {
            if deadline < clock::now_us() + MIN_SLEEP_US {
                return Err(FiberError::TimedOut);
            }
        }
        let meta = unsafe { &*(tls::current_meta_addr() as *const FiberEntity) };
        let fiber = tls::current_fiber_id();
        let waiter = Waiter::new(WaiterKind::Fiber, fiber, expected, deadline_us);

        // Publish the waiter for interrupt() before suspending.
        *meta.current_waiter_slot().lock() = Some(Arc::clone(&waiter));

        suspend(SwitchAction::Wait {
            event: Arc::clone(self),
            waiter: Arc::clone(&waiter),
        });

        // Resumed. Absorb a timeout callback still in flight before the
        // waiter record can be dropped.
        let sleep_raw = waiter.sleep_id.swap(0, Ordering::Relaxed);
        if sleep_raw != 0 {
            let backoff = Backoff::new();
            while rt.timer.unschedule(TimerId::from_raw(sleep_raw)) == UNSCHEDULE_RUNNING {
                backoff.snooze();
            }
        }
        *meta.current_waiter_slot().lock() = None;

        let interrupted = meta.interrupted.swap(false, Ordering::AcqRel);
        match waiter.outcome.load(Ordering::Acquire) {
            OUTCOME_TIMEDOUT => Err(FiberError::TimedOut),
            OUTCOME_UNMATCHED => Err(FiberError::WouldBlock),
            OUTCOME_STOPPED => Err(FiberError::TimerStopped),
            _ if interrupted => {
                if meta.stop.load(Ordering::Relaxed) {
                    Err(FiberError::Stopping)
                } else {
                    Err(FiberError::Interrupted)
                }
            }
            _ => Ok(()),
        }
    }

    /// Worker-side half of a fiber wait, run after the caller suspended.
    ///
    /// Re-checks the value under the list lock and either queues the
    /// waiter or makes the fiber runnable again immediately. The timeout
    /// task is scheduled here, after the waiter is in the list, so a
    /// deadline firing can always find and erase its waiter.
    pub(crate) fn commit_wait(
        self: &Arc<Self>,
        rt: &RuntimeInner,
        waiter: &Arc<Waiter>,
        meta: &FiberEntity,
    ) {
        {
            let mut q = self.lock_waiters();
            if self.value.load(Ordering::Relaxed) != waiter.expected {
                let _ = waiter.claim(OUTCOME_UNMATCHED);
            } else if !meta.interrupted.load(Ordering::Relaxed) {
                q.push_back(Arc::clone(waiter));
                *waiter.container.lock() = Some(Arc::downgrade(self));
                let Some(deadline) = waiter.deadline_us else {
                    return;
                };
                let w = Arc::clone(waiter);
                let group = Arc::clone(&rt.group);
                let sleep_id = rt.timer.schedule(
                    deadline,
                    Box::new(move || {
                        if erase_from_event(&w, OUTCOME_TIMEDOUT) {
                            deliver_erased(&group, &w);
                        }
                    }),
                );
                if !sleep_id.is_invalid() {
                    waiter.sleep_id.store(sleep_id.as_raw(), Ordering::Relaxed);
                    return;
                }
                // Timer gone (shutdown): unqueue rather than park the
                // fiber with a deadline nobody will fire.
                if let Some(pos) = q.iter().position(|x| Arc::ptr_eq(x, waiter)) {
                    q.remove(pos);
                }
                *waiter.container.lock() = None;
                let _ = waiter.claim(OUTCOME_STOPPED);
            }
        }
        // Not queued: the wait is moot. Hand the fiber straight back to
        // the run queue.
        rt.group.ready_to_run_general(waiter.fiber, false);
    }

    fn wait_from_thread(
        self: &Arc<Self>,
        rt: &RuntimeInner,
        expected: u32,
        deadline_us: Option<u64>,
    ) -> FiberResult<()> {
        let meta_addr = tls::current_meta_addr();
        let meta = if meta_addr != 0 {
            Some(unsafe { &*(meta_addr as *const FiberEntity) })
        } else {
            None
        };
        if let Some(deadline) = deadline_us {
            if deadline < clock::now_us() + MIN_SLEEP_US {
                return Err(FiberError::TimedOut);
            }
        }
        let waiter = Waiter::new(WaiterKind::Thread, tls::current_fiber_id(), expected, None);
        if let Some(m) = meta {
            *m.current_waiter_slot().lock() = Some(Arc::clone(&waiter));
        }

        let queued = {
            let mut q = self.lock_waiters();
            if self.value.load(Ordering::Relaxed) != expected {
                false
            } else if meta.is_some_and(|m| m.interrupted.load(Ordering::Relaxed)) {
                false
            } else {
                q.push_back(Arc::clone(&waiter));
                *waiter.container.lock() = Some(Arc::downgrade(self));
                true
            }
        };

        let mut timed_out = false;
        if queued {
            let mut wait_deadline = deadline_us;
            loop {
                let timeout = match wait_deadline {
                    Some(d) => {
                        let now = clock::now_us();
                        if d <= now {
                            // Deadline passed while we were spuriously
                            // awake; treat as an elapsed futex wait.
                            Some(Duration::ZERO)
                        } else {
                            Some(Duration::from_micros(d - now))
                        }
                    }
                    None => None,
                };
                let woken = waiter.sig.wait(SIG_NONE, timeout);
                if waiter.sig.value().load(Ordering::Acquire) != SIG_NONE {
                    // Signalled; we are already off the list.
                    break;
                }
                if !woken {
                    if erase_from_event(&waiter, OUTCOME_TIMEDOUT) {
                        timed_out = true;
                        break;
                    }
                    // A waker is mid-removal; it will signal us. Wait for
                    // the signal without a deadline.
                    if waiter.sig.value().load(Ordering::Acquire) == SIG_NONE {
                        wait_deadline = None;
                        continue;
                    }
                    break;
                }
                // Spurious wake; loop.
            }
        }

        let mut interrupted = false;
        if let Some(m) = meta {
            *m.current_waiter_slot().lock() = None;
            interrupted = m.interrupted.swap(false, Ordering::AcqRel);
        }

        if !queued {
            if self.value.load(Ordering::Relaxed) != expected {
                fence(Ordering::Acquire);
                return Err(FiberError::WouldBlock);
            }
            return Err(if meta.is_some_and(|m| m.stop.load(Ordering::Relaxed)) {
                FiberError::Stopping
            } else {
                FiberError::Interrupted
            });
        }

        match waiter.outcome.load(Ordering::Acquire) {
            OUTCOME_TIMEDOUT => Err(FiberError::TimedOut),
            _ if timed_out => Err(FiberError::TimedOut),
            _ if interrupted => {
                if meta.is_some_and(|m| m.stop.load(Ordering::Relaxed)) {
                    Err(FiberError::Stopping)
                } else {
                    Err(FiberError::Interrupted)
                }
            }
            _ => Ok(()),
        }
    }

    /// Wake the longest-waiting waiter. Returns 0 or 1.
    pub fn wake(&self, rt: &RuntimeInner) -> usize {
        let waiter = {
            let mut q = self.lock_waiters();
            loop {
                let Some(w) = q.pop_front() else { return 0 };
                *w.container.lock() = None;
                if w.claim(OUTCOME_WOKEN) {
                    break w;
                }
                // Lost to a concurrent claimant; try the next waiter.
            }
        };
        deliver(rt, &waiter);
        1
    }

    /// Wake every waiter. Fiber wakeups are queued with deferred signals
    /// and flushed once, so N waiters cost one cross-worker signal burst.
    pub fn wake_all(&self, rt: &RuntimeInner) -> usize {
        self.wake_bulk(rt, FiberId::INVALID)
    }

    /// Like `wake_all` but leaves `excluded`'s waiter enqueued. Used for
    /// lock hand-off patterns where one designated fiber must keep
    /// waiting on this event.
    pub fn wake_except(&self, rt: &RuntimeInner, excluded: FiberId) -> usize {
        self.wake_bulk(rt, excluded)
    }

    fn wake_bulk(&self, rt: &RuntimeInner, excluded: FiberId) -> usize {
        let mut thread_waiters = Vec::new();
        let mut fiber_waiters = Vec::new();
        {
            let mut q = self.lock_waiters();
            let mut kept = None;
            while let Some(w) = q.pop_front() {
                if !excluded.is_invalid() && w.fiber == excluded && w.kind == WaiterKind::Fiber {
                    kept = Some(w);
                    continue;
                }
                *w.container.lock() = None;
                if !w.claim(OUTCOME_WOKEN) {
                    continue;
                }
                match w.kind {
                    WaiterKind::Thread => thread_waiters.push(w),
                    WaiterKind::Fiber => fiber_waiters.push(w),
                }
            }
            if let Some(w) = kept {
                q.push_back(w);
            }
        }

        let mut nwakeup = 0;
        for w in &thread_waiters {
            signal_thread_waiter(w);
            nwakeup += 1;
        }
        if fiber_waiters.is_empty() {
            return nwakeup;
        }
        let mut ids = Vec::with_capacity(fiber_waiters.len());
        for w in &fiber_waiters {
            unsleep_if_necessary(rt, w);
            ids.push(w.fiber);
        }
        nwakeup += ids.len();
        rt.group.ready_to_run_batch(&ids);
        nwakeup
    }

    /// Wake at most one waiter of `self` and move all remaining waiters
    /// onto `target`. Both list locks are taken in address order so two
    /// concurrent requeues cannot deadlock.
    pub fn requeue(self: &Arc<Self>, rt: &RuntimeInner, target: &Arc<WaitableEvent>) -> usize {
        if Arc::ptr_eq(self, target) {
            return self.wake(rt);
        }
        let front = {
            let (mut qa, mut qb) = if (Arc::as_ptr(self) as usize) < (Arc::as_ptr(target) as usize)
            {
                let a = self.lock_waiters();
                let b = target.lock_waiters();
                (a, b)
            } else {
                let b = target.lock_waiters();
                let a = self.lock_waiters();
                (a, b)
            };
            let front = loop {
                let Some(w) = qa.pop_front() else { break None };
                *w.container.lock() = None;
                if w.claim(OUTCOME_WOKEN) {
                    break Some(w);
                }
            };
            while let Some(w) = qa.pop_front() {
                *w.container.lock() = Some(Arc::downgrade(target));
                qb.push_back(w);
            }
            front
        };
        match front {
            Some(w) => {
                deliver(rt, &w);
                1
            }
            None => 0,
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock_waiters().len()
    }
}

impl Drop for WaitableEvent {
    fn drop(&mut self) {
        // Destroying an event that still has waiters strands them; that is
        // a caller bug on the order of destroying a locked mutex.
        debug_assert!(
            self.waiters.get_mut().map_or(true, |q| q.is_empty()),
            "waitable event destroyed with waiters enqueued"
        );
    }
}

/// Detach `waiter` from whichever event list holds it, claiming `outcome`.
///
/// Follows the container reference under the event's list lock, so it
/// cannot race the wake/requeue paths; a waiter that was already popped
/// (container cleared) reads as detached and the claim fails. No-op and
/// false when the waiter was never queued.
pub(crate) fn erase_from_event(waiter: &Arc<Waiter>, outcome: u32) -> bool {
    loop {
        let snapshot = waiter.container.lock().clone();
        let Some(weak) = snapshot else { return false };
        let Some(event) = weak.upgrade() else { return false };
        let mut q = event.lock_waiters();
        let still_here = {
            let c = waiter.container.lock();
            c.as_ref()
                .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(&event)))
        };
        if !still_here {
            // Moved (requeue) or popped while we chased it; retry.
            drop(q);
            continue;
        }
        if let Some(pos) = q.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            q.remove(pos);
        }
        *waiter.container.lock() = None;
        return waiter.claim(outcome);
    }
}

/// Interrupt-side removal: detach and make the waiter runnable. The
/// resumed waiter's own epilogue absorbs any timeout task still racing.
pub(crate) fn interrupt_waiter(rt: &RuntimeInner, waiter: &Arc<Waiter>) {
    if erase_from_event(waiter, OUTCOME_INTERRUPTED) {
        deliver_erased(&rt.group, waiter);
    }
}

fn signal_thread_waiter(waiter: &Waiter) {
    // Release publishes everything before the wake to the parked thread.
    waiter.sig.value().store(SIG_SIGNALLED, Ordering::Release);
    waiter.sig.wake(1);
}

fn unsleep_if_necessary(rt: &RuntimeInner, waiter: &Waiter) {
    let sleep_raw = waiter.sleep_id.load(Ordering::Relaxed);
    if sleep_raw != 0 {
        let _ = rt.timer.unschedule(TimerId::from_raw(sleep_raw));
    }
}

fn deliver(rt: &RuntimeInner, waiter: &Arc<Waiter>) {
    match waiter.kind {
        WaiterKind::Thread => signal_thread_waiter(waiter),
        WaiterKind::Fiber => {
            unsleep_if_necessary(rt, waiter);
            rt.group.ready_to_run_general(waiter.fiber, false);
        }
    }
}

/// Delivery for paths that only have the scheduler group (timer callbacks).
fn deliver_erased(group: &Arc<crate::sched::group::SchedulerGroup>, waiter: &Arc<Waiter>) {
    match waiter.kind {
        WaiterKind::Thread => signal_thread_waiter(waiter),
        WaiterKind::Fiber => group.ready_to_run_general(waiter.fiber, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_cell() {
        let ev = WaitableEvent::new(7);
        assert_eq!(ev.value().load(Ordering::Relaxed), 7);
        ev.value().store(9, Ordering::Relaxed);
        assert_eq!(ev.value().load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_waiter_claim_once() {
        let w = Waiter::new(WaiterKind::Fiber, FiberId::from_parts(1, 1), 0, None);
        assert!(w.claim(OUTCOME_WOKEN));
        assert!(!w.claim(OUTCOME_TIMEDOUT));
        assert_eq!(w.outcome.load(Ordering::Relaxed), OUTCOME_WOKEN);
    }

    #[test]
    fn test_erase_unqueued_is_noop() {
        let w = Waiter::new(WaiterKind::Fiber, FiberId::from_parts(1, 1), 0, None);
        assert!(!erase_from_event(&w, OUTCOME_TIMEDOUT));
        assert_eq!(w.outcome.load(Ordering::Relaxed), OUTCOME_PENDING);
    }

    #[test]
    fn test_erase_after_event_dropped() {
        let w = Waiter::new(WaiterKind::Thread, FiberId::INVALID, 0, None);
        {
            let ev = WaitableEvent::new(0);
            *w.container.lock() = Some(Arc::downgrade(&ev));
            // Detach before dropping so the drop assertion holds.
            *w.container.lock() = None;
            assert_eq!(ev.waiter_count(), 0);
        }
        assert!(!erase_from_event(&w, OUTCOME_TIMEDOUT));
    }

    mod with_runtime {
        use super::*;
        use crate::runtime::Runtime;
        use std::sync::atomic::AtomicUsize;
        use std::sync::Mutex as StdMutex;

        fn runtime(workers: usize) -> Runtime {
            Runtime::with_concurrency(workers).expect("runtime")
        }

        /// Park `n` fibers on `event` in a deterministic order; each
        /// records its tag into `order` when it wakes.
        fn park_fibers(
            rt: &Runtime,
            event: &Arc<WaitableEvent>,
            order: &Arc<StdMutex<Vec<usize>>>,
            n: usize,
        ) -> Vec<FiberId> {
            let mut ids = Vec::new();
            for tag in 0..n {
                let event_handle = Arc::clone(event);
                let order = Arc::clone(order);
                let inner = Arc::clone(rt.inner());
                ids.push(
                    rt.spawn(move || {
                        event_handle.wait(&inner, 0, None).unwrap();
                        order.lock().unwrap().push(tag);
                    })
                    .unwrap(),
                );
                // Let this fiber reach the waiter list before the next.
                while event.waiter_count() <= tag {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            ids
        }

        #[test]
        fn test_wake_is_fifo() {
            let rt = runtime(1);
            let event = WaitableEvent::new(0);
            let order = Arc::new(StdMutex::new(Vec::new()));
            let ids = park_fibers(&rt, &event, &order, 5);
            for _ in 0..5 {
                assert_eq!(event.wake(rt.inner()), 1);
                std::thread::sleep(Duration::from_millis(10));
            }
            for tid in ids {
                rt.join(tid).unwrap();
            }
            assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
            assert_eq!(event.wake(rt.inner()), 0);
            rt.stop();
        }

        #[test]
        fn test_wake_all_empties_list() {
            let rt = runtime(2);
            let event = WaitableEvent::new(0);
            let order = Arc::new(StdMutex::new(Vec::new()));
            let ids = park_fibers(&rt, &event, &order, 4);
            assert_eq!(event.wake_all(rt.inner()), 4);
            for tid in ids {
                rt.join(tid).unwrap();
            }
            assert_eq!(order.lock().unwrap().len(), 4);
            assert_eq!(event.waiter_count(), 0);
            rt.stop();
        }

        #[test]
        fn test_wake_except_leaves_one() {
            let rt = runtime(1);
            let event = WaitableEvent::new(0);
            let order = Arc::new(StdMutex::new(Vec::new()));
            let ids = park_fibers(&rt, &event, &order, 3);
            let excluded = ids[1];
            assert_eq!(event.wake_except(rt.inner(), excluded), 2);
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(event.waiter_count(), 1);
            // Release the excluded waiter too.
            assert_eq!(event.wake(rt.inner()), 1);
            for tid in ids {
                rt.join(tid).unwrap();
            }
            rt.stop();
        }

        #[test]
        fn test_requeue_moves_remaining() {
            let rt = runtime(1);
            let from = WaitableEvent::new(0);
            let to = WaitableEvent::new(0);
            let order = Arc::new(StdMutex::new(Vec::new()));
            let ids = park_fibers(&rt, &from, &order, 3);
            // One woken, two moved onto `to`.
            assert_eq!(from.requeue(rt.inner(), &to), 1);
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(from.waiter_count(), 0);
            assert_eq!(to.waiter_count(), 2);
            assert_eq!(to.wake_all(rt.inner()), 2);
            for tid in ids {
                rt.join(tid).unwrap();
            }
            rt.stop();
        }

        #[test]
        fn test_wait_wrong_value_would_block() {
            let rt = runtime(1);
            let event = WaitableEvent::new(3);
            let inner = Arc::clone(rt.inner());
            let result = Arc::new(StdMutex::new(None));
            let result2 = Arc::clone(&result);
            let event2 = Arc::clone(&event);
            let tid = rt
                .spawn(move || {
                    *result2.lock().unwrap() = Some(event2.wait(&inner, 0, None));
                })
                .unwrap();
            rt.join(tid).unwrap();
            assert_eq!(*result.lock().unwrap(), Some(Err(FiberError::WouldBlock)));
            rt.stop();
        }

        #[test]
        fn test_timed_wait_expires() {
            let rt = runtime(1);
            let event = WaitableEvent::new(0);
            let inner = Arc::clone(rt.inner());
            let event2 = Arc::clone(&event);
            let result = Arc::new(StdMutex::new(None));
            let result2 = Arc::clone(&result);
            let tid = rt
                .spawn(move || {
                    let deadline = clock::now_us() + 50_000;
                    *result2.lock().unwrap() = Some(event2.wait(&inner, 0, Some(deadline)));
                })
                .unwrap();
            rt.join(tid).unwrap();
            assert_eq!(*result.lock().unwrap(), Some(Err(FiberError::TimedOut)));
            assert_eq!(event.waiter_count(), 0);
            rt.stop();
        }

        /// A wake racing the deadline: exactly one of {woken, timed out}
        /// per round, and nothing hangs.
        #[test]
        fn test_timeout_wake_race_exactly_one_winner() {
            let rt = runtime(2);
            let woken_total = Arc::new(AtomicUsize::new(0));
            let timedout_total = Arc::new(AtomicUsize::new(0));
            for round in 0..20u64 {
                let event = WaitableEvent::new(0);
                let inner = Arc::clone(rt.inner());
                let event2 = Arc::clone(&event);
                let woken = Arc::clone(&woken_total);
                let timedout = Arc::clone(&timedout_total);
                let tid = rt
                    .spawn(move || {
                        let deadline = clock::now_us() + 5_000;
                        match event2.wait(&inner, 0, Some(deadline)) {
                            Ok(()) => {
                                woken.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(FiberError::TimedOut) => {
                                timedout.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => panic!("unexpected outcome {:?}", e),
                        }
                    })
                    .unwrap();
                // Aim the wake at the deadline, drifting across it.
                std::thread::sleep(Duration::from_micros(4_000 + round * 100));
                event.wake(rt.inner());
                rt.join(tid).unwrap();
            }
            assert_eq!(
                woken_total.load(Ordering::SeqCst) + timedout_total.load(Ordering::SeqCst),
                20
            );
            rt.stop();
        }
    }
}
