//! Deadline timer thread
//!
//! One dedicated thread fires scheduled callbacks at absolute deadlines.
//! Submissions are sharded into buckets by submitting thread to keep the
//! common path off any single hot lock; the timer thread drains every
//! bucket into a local min-heap each cycle.
//!
//! Task ids are generational. A task's version moves
//! `v -> v+1 (running) -> v+2 (removed)` per cycle, skipping 0, and the
//! version word is the arbiter between `unschedule` and the run loop:
//! whoever wins the CAS owns the boxed callback.
//!
//! The run loop only sleeps after double-checking the shared nearest
//! deadline, and a submitter that schedules an earlier deadline bumps a
//! signal counter and wakes the sleep. An in-flight cycle therefore cannot
//! oversleep a newly scheduled earlier task.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use strand_core::id::TimerId;
use strand_core::kerror;

use crate::arena::SlotArena;
use crate::clock;
use crate::parking::FutexWord;

/// Boxed deadline callback.
pub type TimerFn = Box<dyn FnOnce() + Send + 'static>;

/// `unschedule` result: the task was removed before running.
pub const UNSCHEDULE_REMOVED: i32 = 0;
/// `unschedule` result: the callback is running; side effects are in flight.
pub const UNSCHEDULE_RUNNING: i32 = 1;
/// `unschedule` result: no such task (wrong id or already completed).
pub const UNSCHEDULE_NOT_FOUND: i32 = -1;

pub struct TaskSlot {
    /// initial version: not run yet; +1: running; +2: removed. Never 0.
    version: AtomicU32,
    body: Mutex<Option<TimerFn>>,
}

impl Default for TaskSlot {
    fn default() -> Self {
        TaskSlot {
            version: AtomicU32::new(2),
            body: Mutex::new(None),
        }
    }
}

struct BucketInner {
    /// (task id raw, run time) pairs not yet consumed by the timer thread.
    pending: Vec<(u64, u64)>,
    nearest_run_time_us: u64,
}

struct Bucket {
    inner: Mutex<BucketInner>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            inner: Mutex::new(BucketInner {
                pending: Vec::new(),
                nearest_run_time_us: u64::MAX,
            }),
        }
    }

    /// Queue a task; reports whether it became this bucket's nearest.
    fn push(&self, id_raw: u64, run_time_us: u64) -> bool {
        let mut inner = self.inner.lock().expect("timer bucket poisoned");
        inner.pending.push((id_raw, run_time_us));
        if run_time_us < inner.nearest_run_time_us {
            inner.nearest_run_time_us = run_time_us;
            true
        } else {
            false
        }
    }

    fn consume(&self) -> Vec<(u64, u64)> {
        let mut inner = self.inner.lock().expect("timer bucket poisoned");
        if inner.pending.is_empty() {
            return Vec::new();
        }
        inner.nearest_run_time_us = u64::MAX;
        std::mem::take(&mut inner.pending)
    }
}

struct TimerShared {
    tasks: SlotArena<TaskSlot>,
    buckets: Box<[Bucket]>,
    /// Globally nearest run time; u64::MAX when idle.
    global_nearest: Mutex<u64>,
    /// Bumped once per "earlier deadline arrived" event; the run loop
    /// sleeps on this word.
    nsignals: FutexWord,
    stop: AtomicBool,
}

/// Handle to the dedicated timer thread.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn the timer thread.
    pub fn start(num_buckets: usize, max_tasks: u32) -> std::io::Result<TimerThread> {
        let shared = Arc::new(TimerShared {
            tasks: SlotArena::with_capacity(max_tasks),
            buckets: (0..num_buckets).map(|_| Bucket::new()).collect(),
            global_nearest: Mutex::new(u64::MAX),
            nsignals: FutexWord::new(0),
            stop: AtomicBool::new(false),
        });
        let shared2 = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("strand-timer".into())
            .spawn(move || run_loop(&shared2))?;
        Ok(TimerThread {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Schedule `f` to run at absolute `run_time_us` on the runtime clock.
    ///
    /// Returns [`TimerId::INVALID`] when the thread is stopping or the task
    /// arena is exhausted.
    pub fn schedule(&self, run_time_us: u64, f: TimerFn) -> TimerId {
        let shared = &self.shared;
        if shared.stop.load(Ordering::Relaxed) {
            return TimerId::INVALID;
        }
        let Some((slot, task)) = shared.tasks.acquire() else {
            kerror!("timer task arena exhausted, capacity={}", shared.tasks.capacity());
            return TimerId::INVALID;
        };
        let mut version = task.version.load(Ordering::Relaxed);
        if version == 0 {
            // Wrapped around; skip 0 so ids stay nonzero.
            task.version.store(2, Ordering::Relaxed);
            version = 2;
        }
        let id = TimerId::from_parts(slot, version);
        *task.body.lock().expect("timer body poisoned") = Some(f);

        let bucket = &shared.buckets[thread_bucket(shared.buckets.len())];
        if bucket.push(id.as_raw(), run_time_us) {
            let mut wake = false;
            {
                let mut nearest = shared.global_nearest.lock().expect("timer nearest poisoned");
                if run_time_us < *nearest {
                    *nearest = run_time_us;
                    shared.nsignals.value().fetch_add(1, Ordering::Relaxed);
                    wake = true;
                }
            }
            if wake {
                shared.nsignals.wake(1);
            }
        }
        id
    }

    /// Try to cancel a not-yet-fired task.
    ///
    /// Returns [`UNSCHEDULE_REMOVED`], [`UNSCHEDULE_RUNNING`] (the callback
    /// is executing; treat its side effects as in flight) or
    /// [`UNSCHEDULE_NOT_FOUND`]. The acquire on failure pairs with the
    /// release in the run loop so a caller seeing `RUNNING`/`NOT_FOUND`
    /// also sees everything a completed callback wrote.
    pub fn unschedule(&self, id: TimerId) -> i32 {
        if id.is_invalid() {
            return UNSCHEDULE_NOT_FOUND;
        }
        let Some(task) = self.shared.tasks.get(id.slot()) else {
            return UNSCHEDULE_NOT_FOUND;
        };
        let expected = id.version();
        match task.version.compare_exchange(
            expected,
            expected.wrapping_add(2),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // We own the body now; the slot itself is reclaimed by the
                // run loop when it drains the bucket entry.
                drop(task.body.lock().expect("timer body poisoned").take());
                UNSCHEDULE_REMOVED
            }
            Err(actual) => {
                if actual == expected.wrapping_add(1) {
                    UNSCHEDULE_RUNNING
                } else {
                    UNSCHEDULE_NOT_FOUND
                }
            }
        }
    }

    /// True once `stop_and_join` has been requested.
    pub fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    /// Ask the thread to stop and wait for it, unless called from a timer
    /// callback itself.
    pub fn stop_and_join(&self) {
        if self.shared.stop.swap(true, Ordering::Relaxed) {
            return;
        }
        {
            let mut nearest = self
                .shared
                .global_nearest
                .lock()
                .expect("timer nearest poisoned");
            *nearest = 0;
            self.shared.nsignals.value().fetch_add(1, Ordering::Relaxed);
        }
        self.shared.nsignals.wake(1);
        let handle = self.thread.lock().expect("timer handle poisoned").take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Run one task if it is still scheduled, releasing its slot.
fn run_and_delete(shared: &TimerShared, id: TimerId, fired: &mut u64) {
    let Some(task) = shared.tasks.get(id.slot()) else {
        return;
    };
    let expected = id.version();
    match task.version.compare_exchange(
        expected,
        expected.wrapping_add(1),
        Ordering::Relaxed,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            let body = task.body.lock().expect("timer body poisoned").take();
            if let Some(f) = body {
                f();
                *fired += 1;
            }
            // Release pairs with the acquire in unschedule.
            task.version
                .store(expected.wrapping_add(2), Ordering::Release);
            shared.tasks.release(id.slot());
        }
        Err(actual) => {
            if actual == expected.wrapping_add(2) {
                // Unscheduled after it reached the heap.
                shared.tasks.release(id.slot());
            } else {
                kerror!("timer task {:?} has invalid version {}", id, actual);
            }
        }
    }
}

fn run_loop(shared: &TimerShared) {
    strand_core::kprint::init();
    let mut heap: BinaryHeap<Reverse<(u64, u64)>> = BinaryHeap::with_capacity(4096);
    let mut fired: u64 = 0;

    while !shared.stop.load(Ordering::Relaxed) {
        // Forget the nearest deadline before draining so submissions racing
        // with this cycle re-announce themselves.
        {
            let mut nearest = shared.global_nearest.lock().expect("timer nearest poisoned");
            *nearest = u64::MAX;
        }

        for bucket in shared.buckets.iter() {
            for (id_raw, run_time_us) in bucket.consume() {
                let id = TimerId::from_raw(id_raw);
                let still_scheduled = shared
                    .tasks
                    .get(id.slot())
                    .map(|t| t.version.load(Ordering::Relaxed) == id.version())
                    .unwrap_or(false);
                if still_scheduled {
                    heap.push(Reverse((run_time_us, id_raw)));
                } else {
                    // Unscheduled while still in the bucket.
                    shared.tasks.release(id.slot());
                }
            }
        }

        let mut pull_again = false;
        while let Some(&Reverse((run_time_us, id_raw))) = heap.peek() {
            if clock::now_us() < run_time_us {
                break;
            }
            {
                let nearest = shared.global_nearest.lock().expect("timer nearest poisoned");
                if run_time_us > *nearest {
                    // Something earlier landed in a bucket; drain again
                    // before running this one.
                    pull_again = true;
                    break;
                }
            }
            heap.pop();
            run_and_delete(shared, TimerId::from_raw(id_raw), &mut fired);
        }
        if pull_again {
            continue;
        }

        let next_run_time = heap.peek().map(|Reverse((t, _))| *t).unwrap_or(u64::MAX);
        let expected_signals;
        {
            let mut nearest = shared.global_nearest.lock().expect("timer nearest poisoned");
            if next_run_time > *nearest {
                continue;
            }
            *nearest = next_run_time;
            expected_signals = shared.nsignals.value().load(Ordering::Relaxed);
        }
        let timeout = if next_run_time == u64::MAX {
            None
        } else {
            let now = clock::now_us();
            if next_run_time <= now {
                continue;
            }
            Some(Duration::from_micros(next_run_time - now))
        };
        shared.nsignals.wait(expected_signals, timeout);
    }
}

/// Stable per-thread bucket choice; hashing the thread keeps one thread's
/// submissions on one lock.
fn thread_bucket(n: usize) -> usize {
    (crate::fastrand::thread_hash64() % n as u64) as usize
}
