//! The scheduler group: the set of workers and their coordination
//!
//! The worker array is grow-only with a fixed ceiling: slots are published
//! with a release store of the count, so the steady-state steal path reads
//! it lock-free; a mutex serializes structural changes only. Wake signals
//! are distributed over a small fixed set of parking lots (workers hash
//! onto one), and `signal_task` caps the burst at 2, since waking more
//! workers than tasks just produces steal traffic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Steal, Stealer};
use crossbeam_queue::ArrayQueue;

use strand_core::error::{FiberError, FiberResult};
use strand_core::id::FiberId;
use strand_core::kwarn;
use strand_core::spinlock::SpinLock;

use crate::config::{MAX_CONCURRENCY, PARKING_LOT_COUNT};
use crate::fastrand::{mix64, thread_hash64};
use crate::parking::ParkingLot;
use crate::runtime::RuntimeInner;
use crate::tls;

/// Hook run once at the start of every worker thread.
pub type WorkerStartFn = Arc<dyn Fn() + Send + Sync>;

/// Bounded attempts before a cross-thread submission reports backpressure.
const SUBMIT_ATTEMPTS: usize = 8;

/// Cross-thread-visible half of one worker.
pub(crate) struct WorkerShared {
    pub index: usize,
    /// Steal end of the worker's local deque.
    pub stealer: Stealer<u64>,
    /// Bounded cross-thread submission queue.
    pub remote: ArrayQueue<u64>,
    /// Wake signals deferred by NO_SIGNAL remote submissions.
    pub remote_num_nosignal: AtomicU32,
    pub nsignaled: AtomicU64,
    pub nswitch: AtomicU64,
    pub cputime_ns: AtomicU64,
}

pub struct SchedulerGroup {
    workers: Box<[OnceLock<Arc<WorkerShared>>]>,
    nworkers: AtomicUsize,
    lots: [ParkingLot; PARKING_LOT_COUNT],
    /// Structural changes (worker add, stop) only.
    modify: Mutex<Vec<JoinHandle<()>>>,
    start_fn: SpinLock<Option<WorkerStartFn>>,
    stopped: AtomicBool,
    rng: AtomicU64,
    remote_queue_capacity: usize,
    pub(crate) nfibers: AtomicI64,
}

impl SchedulerGroup {
    pub(crate) fn new(remote_queue_capacity: usize) -> Arc<Self> {
        Arc::new(SchedulerGroup {
            workers: (0..MAX_CONCURRENCY).map(|_| OnceLock::new()).collect(),
            nworkers: AtomicUsize::new(0),
            lots: [const { ParkingLot::new() }; PARKING_LOT_COUNT],
            modify: Mutex::new(Vec::new()),
            start_fn: SpinLock::new(None),
            stopped: AtomicBool::new(false),
            rng: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
            remote_queue_capacity,
            nfibers: AtomicI64::new(0),
        })
    }

    pub(crate) fn set_start_fn(&self, f: Option<WorkerStartFn>) {
        *self.start_fn.lock() = f;
    }

    pub(crate) fn lot(&self, index: usize) -> &ParkingLot {
        &self.lots[index]
    }

    /// The lot a given OS thread parks on.
    pub(crate) fn lot_index_for_this_thread(&self) -> usize {
        (thread_hash64() % PARKING_LOT_COUNT as u64) as usize
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.nworkers.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn fast_rand(&self) -> u64 {
        let s = self
            .rng
            .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
        mix64(s)
    }

    /// Start one more worker thread.
    pub(crate) fn add_worker(self: &Arc<Self>, rt: &Arc<RuntimeInner>) -> FiberResult<usize> {
        let mut handles = self.modify.lock().expect("scheduler group poisoned");
        if self.stopped.load(Ordering::Acquire) {
            return Err(FiberError::NotRunning);
        }
        let index = self.nworkers.load(Ordering::Relaxed);
        if index >= MAX_CONCURRENCY {
            return Err(FiberError::ResourceExhausted);
        }
        let local = crossbeam_deque::Worker::new_lifo();
        let shared = Arc::new(WorkerShared {
            index,
            stealer: local.stealer(),
            remote: ArrayQueue::new(self.remote_queue_capacity),
            remote_num_nosignal: AtomicU32::new(0),
            nsignaled: AtomicU64::new(0),
            nswitch: AtomicU64::new(0),
            cputime_ns: AtomicU64::new(0),
        });
        self.workers[index]
            .set(Arc::clone(&shared))
            .map_err(|_| FiberError::InvalidArgument)?;
        let start_fn = self.start_fn.lock().clone();
        let handle = super::worker::spawn_worker_thread(
            Arc::clone(self),
            Arc::clone(rt),
            shared,
            local,
            start_fn,
        )
        .map_err(|_| FiberError::ResourceExhausted)?;
        handles.push(handle);
        // Publish only after the slot is initialized.
        self.nworkers.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// One randomized steal sweep over all workers' deques and remote
    /// queues. `seed`/`offset` walk a per-caller pseudo-random sequence.
    pub(crate) fn steal_task(&self, seed: &mut u64, offset: u64) -> Option<FiberId> {
        let n = self.nworkers.load(Ordering::Acquire);
        if n == 0 {
            return None;
        }
        let mut s = *seed;
        let mut found = None;
        for _ in 0..n {
            let index = (s % n as u64) as usize;
            s = s.wrapping_add(offset);
            let Some(w) = self.workers[index].get() else {
                continue;
            };
            let stolen = loop {
                match w.stealer.steal() {
                    Steal::Success(raw) => break Some(raw),
                    Steal::Retry => continue,
                    Steal::Empty => break None,
                }
            };
            if let Some(raw) = stolen.or_else(|| w.remote.pop()) {
                found = Some(FiberId::from_raw(raw));
                break;
            }
        }
        *seed = s;
        found
    }

    /// Announce up to `num` newly runnable tasks across the parking lots.
    pub(crate) fn signal_task(&self, num: usize) {
        if num == 0 {
            return;
        }
        // Waking more than 2 workers per submission just multiplies steal
        // misses; the capped burst matches observed scheduling latency.
        let mut left = num.min(2);
        let start = self.lot_index_for_this_thread();
        left = left.saturating_sub(self.lots[start].signal(1));
        if left > 0 {
            for i in 1..PARKING_LOT_COUNT {
                if left == 0 {
                    break;
                }
                let index = (start + i) % PARKING_LOT_COUNT;
                left = left.saturating_sub(self.lots[index].signal(1));
            }
        }
    }

    fn choose_one_worker(&self) -> Option<Arc<WorkerShared>> {
        let n = self.nworkers.load(Ordering::Acquire);
        if n == 0 {
            return None;
        }
        let index = (self.fast_rand() % n as u64) as usize;
        self.workers[index].get().cloned()
    }

    fn signal_after_remote_push(&self, w: &WorkerShared, nosignal: bool) {
        if nosignal {
            w.remote_num_nosignal.fetch_add(1, Ordering::Relaxed);
        } else {
            let extra = w.remote_num_nosignal.swap(0, Ordering::Relaxed);
            w.nsignaled.fetch_add(1 + extra as u64, Ordering::Relaxed);
            self.signal_task(1 + extra as usize);
        }
    }

    fn flush_remote_nosignal(&self, w: &WorkerShared) {
        let pending = w.remote_num_nosignal.swap(0, Ordering::Relaxed);
        if pending > 0 {
            w.nsignaled.fetch_add(pending as u64, Ordering::Relaxed);
            self.signal_task(pending as usize);
        }
    }

    /// Make `tid` runnable from any thread. Worker threads of this group
    /// push to their own deque; others push to a random worker's remote
    /// queue, retrying forever: wakeups must not be dropped.
    pub(crate) fn ready_to_run_general(self: &Arc<Self>, tid: FiberId, nosignal: bool) {
        let pushed_local = tls::with_worker(|w| match w {
            Some(w) if Arc::ptr_eq(&w.group, self) => {
                w.local.push(tid.as_raw());
                if nosignal {
                    w.num_nosignal.set(w.num_nosignal.get() + 1);
                } else {
                    let extra = w.num_nosignal.replace(0);
                    w.shared
                        .nsignaled
                        .fetch_add(1 + extra as u64, Ordering::Relaxed);
                    self.signal_task(1 + extra as usize);
                }
                true
            }
            _ => false,
        });
        if pushed_local {
            return;
        }
        loop {
            let Some(w) = self.choose_one_worker() else {
                if self.is_stopped() {
                    // Shutting down; the fiber will never run.
                    return;
                }
                std::thread::yield_now();
                continue;
            };
            if w.remote.push(tid.as_raw()).is_ok() {
                self.signal_after_remote_push(&w, nosignal);
                return;
            }
            // Queue full: deliver the signals we owe and back off before
            // retrying (possibly on another worker).
            self.flush_remote_nosignal(&w);
            kwarn!(
                "remote queue of worker {} full, capacity={}",
                w.index,
                self.remote_queue_capacity
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Bounded cross-thread submission for fiber creation: the caller sees
    /// backpressure as an error instead of an unbounded retry loop.
    pub(crate) fn try_submit_remote(&self, tid: FiberId, nosignal: bool) -> FiberResult<()> {
        for _ in 0..SUBMIT_ATTEMPTS {
            let Some(w) = self.choose_one_worker() else {
                return Err(FiberError::NotRunning);
            };
            if w.remote.push(tid.as_raw()).is_ok() {
                self.signal_after_remote_push(&w, nosignal);
                return Ok(());
            }
            self.flush_remote_nosignal(&w);
            std::thread::yield_now();
        }
        Err(FiberError::ResourceExhausted)
    }

    /// Make a batch runnable, deferring wake signals until the whole batch
    /// is queued (one signal burst for N wakeups).
    pub(crate) fn ready_to_run_batch(self: &Arc<Self>, ids: &[FiberId]) {
        if ids.is_empty() {
            return;
        }
        let pushed_local = tls::with_worker(|w| match w {
            Some(w) if Arc::ptr_eq(&w.group, self) => {
                for id in ids {
                    w.local.push(id.as_raw());
                }
                let extra = w.num_nosignal.replace(0);
                w.shared
                    .nsignaled
                    .fetch_add((ids.len() + extra as usize) as u64, Ordering::Relaxed);
                self.signal_task(ids.len() + extra as usize);
                true
            }
            _ => false,
        });
        if pushed_local {
            return;
        }
        for id in ids {
            self.ready_to_run_general(*id, true);
        }
        self.flush_all_remote_nosignal();
    }

    /// Deliver every deferred wake signal.
    pub(crate) fn flush_nosignal_general(self: &Arc<Self>) {
        tls::with_worker(|w| {
            if let Some(w) = w {
                if Arc::ptr_eq(&w.group, self) {
                    let pending = w.num_nosignal.replace(0);
                    if pending > 0 {
                        w.shared.nsignaled.fetch_add(pending as u64, Ordering::Relaxed);
                        self.signal_task(pending as usize);
                    }
                }
            }
        });
        self.flush_all_remote_nosignal();
    }

    fn flush_all_remote_nosignal(&self) {
        let n = self.nworkers.load(Ordering::Acquire);
        for index in 0..n {
            if let Some(w) = self.workers[index].get() {
                self.flush_remote_nosignal(w);
            }
        }
    }

    /// Stop every worker and wait for the threads to exit.
    pub(crate) fn stop_and_join(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for lot in &self.lots {
            lot.stop();
        }
        let handles = {
            let mut guard = self.modify.lock().expect("scheduler group poisoned");
            std::mem::take(&mut *guard)
        };
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn cumulated_switch_count(&self) -> u64 {
        self.sum_workers(|w| w.nswitch.load(Ordering::Relaxed))
    }

    pub(crate) fn cumulated_signal_count(&self) -> u64 {
        self.sum_workers(|w| w.nsignaled.load(Ordering::Relaxed))
    }

    pub(crate) fn cumulated_worker_time_ns(&self) -> u64 {
        self.sum_workers(|w| w.cputime_ns.load(Ordering::Relaxed))
    }

    fn sum_workers(&self, f: impl Fn(&WorkerShared) -> u64) -> u64 {
        let n = self.nworkers.load(Ordering::Acquire);
        (0..n)
            .filter_map(|i| self.workers[i].get())
            .map(|w| f(w))
            .sum()
    }
}
