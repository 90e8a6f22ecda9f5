//! The runtime handle
//!
//! A `Runtime` owns everything: the fiber arena, the stack pools, the
//! scheduler group with its workers, the timer thread and the storage key
//! registry. There is no process-wide instance; construct one (or several,
//! in tests) and pass it where it is needed. Handles are cheap clones of
//! one underlying runtime; the workers stop when the last handle drops or
//! on an explicit `stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_core::error::{FiberError, FiberResult};
use strand_core::id::{FiberId, TimerId};
use strand_core::kinfo;

use crate::arena::SlotArena;
use crate::attr::{flags, FiberAttr};
use crate::config::{RuntimeConfig, MAX_CONCURRENCY};
use crate::event;
use crate::fls::{KeyDestructor, KeyRegistry, KeyTable, LocalKey};
use crate::meta::{address_entity, FiberArena, FiberEntity, FiberStats};
use crate::sched::group::SchedulerGroup;
use crate::sched::WorkerStartFn;
use crate::stack::{suspend, StackPool, SwitchAction};
use crate::sync::token::TokenCell;
use crate::timer::{TimerThread, UNSCHEDULE_REMOVED};
use crate::tls;

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) fibers: FiberArena,
    pub(crate) stacks: StackPool,
    pub(crate) group: Arc<SchedulerGroup>,
    pub(crate) timer: TimerThread,
    pub(crate) keys: Arc<KeyRegistry>,
    pub(crate) tokens: SlotArena<TokenCell>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RuntimeInner {
    fn stop_internal(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.group.stop_and_join();
        self.timer.stop_and_join();
    }

    fn check_running(&self) -> FiberResult<()> {
        if self.started.load(Ordering::Acquire) && !self.group.is_stopped() {
            Ok(())
        } else {
            Err(FiberError::NotRunning)
        }
    }
}

struct RuntimeOwner {
    inner: Arc<RuntimeInner>,
}

impl Drop for RuntimeOwner {
    fn drop(&mut self) {
        self.inner.stop_internal();
    }
}

/// Handle to one fiber runtime.
#[derive(Clone)]
pub struct Runtime {
    owner: Arc<RuntimeOwner>,
}

impl Runtime {
    /// Build a runtime. The timer thread starts immediately; workers start
    /// on [`Runtime::start`].
    pub fn new(config: RuntimeConfig) -> FiberResult<Runtime> {
        config.validate()?;
        let timer = TimerThread::start(config.timer_buckets, config.max_fibers.saturating_mul(2))
            .map_err(|_| FiberError::ResourceExhausted)?;
        let group = SchedulerGroup::new(config.remote_queue_capacity);
        let inner = Arc::new(RuntimeInner {
            fibers: SlotArena::with_capacity(config.max_fibers),
            stacks: StackPool::new(&config),
            group,
            timer,
            keys: Arc::new(KeyRegistry::new()),
            tokens: SlotArena::with_capacity(config.max_fibers),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        });
        Ok(Runtime {
            owner: Arc::new(RuntimeOwner { inner }),
        })
    }

    /// Convenience: build and start with `concurrency` workers.
    pub fn with_concurrency(concurrency: usize) -> FiberResult<Runtime> {
        let rt = Runtime::new(RuntimeConfig::new().concurrency(concurrency))?;
        rt.start()?;
        Ok(rt)
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.owner.inner
    }

    /// Start the worker threads.
    pub fn start(&self) -> FiberResult<()> {
        let inner = self.inner();
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(FiberError::AlreadyStarted);
        }
        for _ in 0..inner.config.concurrency {
            inner.group.add_worker(inner)?;
        }
        Ok(())
    }

    /// Stop workers and the timer thread, waiting for them to exit.
    /// Fibers still queued at this point never run.
    pub fn stop(&self) {
        self.inner().stop_internal();
    }

    // ------------------------------------------------------------------
    // Fiber lifecycle
    // ------------------------------------------------------------------

    /// Create a fiber and schedule it without switching to it.
    ///
    /// From a worker thread the fiber lands on the local run queue; from
    /// anywhere else it is routed to a random worker's remote queue, where
    /// sustained overload surfaces as `ResourceExhausted`.
    pub fn spawn<F>(&self, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with_attr(FiberAttr::default(), f)
    }

    pub fn spawn_with_attr<F>(&self, attr: FiberAttr, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner();
        inner.check_running()?;
        let Some((slot, meta)) = inner.fibers.acquire() else {
            return Err(FiberError::ResourceExhausted);
        };
        let nosignal = attr.has_flag(flags::NO_SIGNAL);
        let log = attr.has_flag(flags::LOG_START_AND_FINISH);
        let tid = meta.init_for_spawn(slot, attr, Box::new(f));
        inner.group.nfibers.fetch_add(1, Ordering::Relaxed);
        if log {
            kinfo!("started fiber {}", tid);
        }
        if tls::is_worker_of(&inner.group) {
            inner.group.ready_to_run_general(tid, nosignal);
        } else if let Err(e) = inner.group.try_submit_remote(tid, nosignal) {
            // Roll the creation back; the body never ran.
            drop(meta.take_body());
            meta.advance_version();
            inner.group.nfibers.fetch_sub(1, Ordering::Relaxed);
            inner.fibers.release(slot);
            return Err(e);
        }
        Ok(tid)
    }

    /// Create a fiber and switch to it immediately, scheduling the caller
    /// to run next (no queue round-trip for the new fiber).
    ///
    /// Only meaningful from inside a fiber; from other threads this
    /// degrades to `spawn_with_attr`.
    pub fn spawn_urgent<F>(&self, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_urgent_with_attr(FiberAttr::default(), f)
    }

    pub fn spawn_urgent_with_attr<F>(&self, attr: FiberAttr, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner();
        if !(tls::in_coroutine_fiber() && tls::is_worker_of(&inner.group)) {
            return self.spawn_with_attr(attr, f);
        }
        inner.check_running()?;
        let Some((slot, meta)) = inner.fibers.acquire() else {
            return Err(FiberError::ResourceExhausted);
        };
        let nosignal = attr.has_flag(flags::NO_SIGNAL);
        let log = attr.has_flag(flags::LOG_START_AND_FINISH);
        let tid = meta.init_for_spawn(slot, attr, Box::new(f));
        inner.group.nfibers.fetch_add(1, Ordering::Relaxed);
        if log {
            kinfo!("started fiber {}", tid);
        }
        suspend(SwitchAction::HandOff {
            next: tid,
            nosignal,
        });
        Ok(tid)
    }

    /// Block until the fiber behind `tid` has finished.
    ///
    /// Fiber callers suspend cooperatively; non-fiber callers park the OS
    /// thread. Joining self or an id that never existed is an error;
    /// joining an already-finished fiber succeeds immediately.
    pub fn join(&self, tid: FiberId) -> FiberResult<()> {
        let inner = self.inner();
        if tid.is_invalid() || tls::current_fiber_id() == tid {
            return Err(FiberError::InvalidArgument);
        }
        let Some(meta) = address_entity(&inner.fibers, tid) else {
            return Err(FiberError::InvalidArgument);
        };
        let expected = tid.version();
        while meta.version() == expected {
            match meta.join_event().wait(inner, expected, None) {
                Ok(())
                | Err(FiberError::WouldBlock)
                | Err(FiberError::Interrupted)
                | Err(FiberError::Stopping) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Interrupt `tid`: a current blocking call returns `Interrupted`; if
    /// the fiber is not blocked, its *next* blocking call does. The flag
    /// persists until consumed, so interrupts cannot be lost to races.
    pub fn interrupt(&self, tid: FiberId) -> FiberResult<()> {
        let inner = self.inner();
        let Some(meta) = address_entity(&inner.fibers, tid) else {
            return Err(FiberError::InvalidArgument);
        };
        let (waiter, sleep_raw) = {
            let _guard = meta.lock_version();
            if !meta.matches(tid) {
                return Err(FiberError::InvalidArgument);
            }
            let waiter = meta.current_waiter_slot().lock().clone();
            // Only one interrupter gets the sleep id.
            let sleep_raw = meta.current_sleep.swap(0, Ordering::Relaxed);
            // Release pairs with the acquire of the consuming swap in the
            // wait/sleep epilogues.
            meta.interrupted.store(true, Ordering::Release);
            (waiter, sleep_raw)
        };
        if let Some(waiter) = waiter {
            event::interrupt_waiter(inner, &waiter);
        } else if sleep_raw != 0 {
            if inner.timer.unschedule(TimerId::from_raw(sleep_raw)) == UNSCHEDULE_REMOVED {
                inner.group.ready_to_run_general(tid, false);
            }
            // Already running: the timer callback requeues the fiber.
        }
        Ok(())
    }

    /// Mark `tid` stopped and interrupt it. A stopped-but-not-yet-run
    /// fiber still runs once, observing `is_stopped` as true.
    pub fn stop_fiber(&self, tid: FiberId) -> FiberResult<()> {
        let inner = self.inner();
        let Some(meta) = address_entity(&inner.fibers, tid) else {
            return Err(FiberError::InvalidArgument);
        };
        {
            let _guard = meta.lock_version();
            if !meta.matches(tid) {
                return Err(FiberError::InvalidArgument);
            }
            meta.stop.store(true, Ordering::Release);
        }
        self.interrupt(tid)
    }

    /// Whether the fiber behind `tid` still exists at this instant.
    pub fn exists(&self, tid: FiberId) -> bool {
        address_entity(&self.inner().fibers, tid).is_some_and(|m| m.matches(tid))
    }

    /// Stop flag of `tid`; a finished or unknown fiber reads as stopped.
    pub fn is_stopped(&self, tid: FiberId) -> bool {
        let Some(meta) = address_entity(&self.inner().fibers, tid) else {
            return true;
        };
        let _guard = meta.lock_version();
        if meta.matches(tid) {
            meta.stop.load(Ordering::Relaxed)
        } else {
            true
        }
    }

    /// Creation attributes of a live fiber.
    pub fn get_attr(&self, tid: FiberId) -> FiberResult<FiberAttr> {
        address_entity(&self.inner().fibers, tid)
            .and_then(|m| m.attr_checked(tid))
            .ok_or(FiberError::InvalidArgument)
    }

    /// Execution statistics of a live fiber.
    pub fn fiber_stats(&self, tid: FiberId) -> FiberResult<FiberStats> {
        let Some(meta) = address_entity(&self.inner().fibers, tid) else {
            return Err(FiberError::InvalidArgument);
        };
        let _guard = meta.lock_version();
        if meta.matches(tid) {
            Ok(meta.stats())
        } else {
            Err(FiberError::InvalidArgument)
        }
    }

    /// Ask the current fiber's eventual hand-offs to skip wake signals;
    /// a hint that the caller is about to finish.
    pub fn quit_current(&self) {
        let addr = tls::current_meta_addr();
        if addr != 0 {
            let meta = unsafe { &*(addr as *const FiberEntity) };
            meta.about_to_quit.store(true, Ordering::Relaxed);
        }
    }

    /// Deliver wake signals deferred by NO_SIGNAL creations.
    pub fn flush(&self) {
        self.inner().group.flush_nosignal_general();
    }

    // ------------------------------------------------------------------
    // Tuning and observability
    // ------------------------------------------------------------------

    /// Current number of worker threads.
    pub fn concurrency(&self) -> usize {
        self.inner().group.concurrency()
    }

    /// Grow the worker pool to `n` threads. Shrinking is rejected.
    pub fn set_concurrency(&self, n: usize) -> FiberResult<()> {
        let inner = self.inner();
        inner.check_running()?;
        if n > MAX_CONCURRENCY {
            return Err(FiberError::InvalidArgument);
        }
        let current = inner.group.concurrency();
        if n < current {
            return Err(FiberError::PermissionDenied);
        }
        for _ in current..n {
            inner.group.add_worker(inner)?;
        }
        Ok(())
    }

    /// Install a hook run once at the start of every worker thread created
    /// afterwards. Set it before [`Runtime::start`] to cover all workers.
    pub fn set_worker_start_fn(&self, f: WorkerStartFn) {
        self.inner().group.set_start_fn(Some(f));
    }

    /// Live fiber count.
    pub fn fiber_count(&self) -> i64 {
        self.inner().group.nfibers.load(Ordering::Relaxed)
    }

    /// Cumulative context switches across all workers.
    pub fn switch_count(&self) -> u64 {
        self.inner().group.cumulated_switch_count()
    }

    /// Cumulative worker wake signals sent.
    pub fn signal_count(&self) -> u64 {
        self.inner().group.cumulated_signal_count()
    }

    /// Cumulative fiber execution time across all workers.
    pub fn worker_time_ns(&self) -> u64 {
        self.inner().group.cumulated_worker_time_ns()
    }

    // ------------------------------------------------------------------
    // Keyed fiber-local storage
    // ------------------------------------------------------------------

    /// Allocate a storage key, optionally with a destructor for live
    /// values of finishing fibers.
    pub fn create_key(&self, dtor: Option<KeyDestructor>) -> FiberResult<LocalKey> {
        self.inner().keys.create_key(dtor)
    }

    /// Invalidate a key; stale values become invisible, destructors are
    /// not run.
    pub fn delete_key(&self, key: LocalKey) -> FiberResult<()> {
        self.inner().keys.delete_key(key)
    }

    /// Store `value` under `key` for the calling fiber. The table is
    /// created on first use, borrowed from the fiber attribute's
    /// [`crate::fls::KeyTablePool`] when one is set.
    pub fn set_local(&self, key: LocalKey, value: *mut ()) -> FiberResult<()> {
        if !tls::in_fiber() {
            return Err(FiberError::InvalidArgument);
        }
        let meta = unsafe { &*(tls::current_meta_addr() as *const FiberEntity) };
        let pool = meta.attr().keytable_pool;
        let keys = Arc::clone(&self.inner().keys);
        tls::with_keytable(
            move || {
                pool.as_ref()
                    .and_then(|p| p.acquire())
                    .unwrap_or_else(|| Box::new(KeyTable::new(&keys)))
            },
            |table| table.set(key, value),
        )
    }

    /// Value stored under `key` by the calling fiber, or null.
    pub fn get_local(&self, key: LocalKey) -> *mut () {
        if !tls::in_fiber() {
            return std::ptr::null_mut();
        }
        tls::with_keytable_opt(|table| {
            table.map_or(std::ptr::null_mut(), |table| table.get(key))
        })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("concurrency", &self.concurrency())
            .field("fibers", &self.fiber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Fiber-context free functions
// ----------------------------------------------------------------------

/// Yield the processor. In a fiber this suspends cooperatively; elsewhere
/// it yields the OS thread.
pub fn yield_now() {
    if tls::in_coroutine_fiber() {
        suspend(SwitchAction::Yielded);
    } else {
        std::thread::yield_now();
    }
}

/// Suspend the caller for at least `timeout`.
///
/// Returns `Interrupted` (or `Stopping` when the fiber was asked to stop)
/// if [`Runtime::interrupt`] cut the sleep short. Non-fiber callers just
/// block the thread and cannot be interrupted.
pub fn sleep_for(timeout: Duration) -> FiberResult<()> {
    sleep_us(timeout.as_micros().min(u64::MAX as u128) as u64)
}

/// [`sleep_for`] in microseconds.
pub fn sleep_us(timeout_us: u64) -> FiberResult<()> {
    if !tls::in_coroutine_fiber() {
        if timeout_us > 0 {
            std::thread::sleep(Duration::from_micros(timeout_us));
        }
        return Ok(());
    }
    if timeout_us == 0 {
        yield_now();
        return Ok(());
    }
    suspend(SwitchAction::Sleep { timeout_us });
    let meta = unsafe { &*(tls::current_meta_addr() as *const FiberEntity) };
    meta.current_sleep.store(0, Ordering::Relaxed);
    if meta.interrupted.swap(false, Ordering::AcqRel) {
        if meta.stop.load(Ordering::Relaxed) {
            Err(FiberError::Stopping)
        } else {
            Err(FiberError::Interrupted)
        }
    } else {
        Ok(())
    }
}

/// Id of the calling fiber, INVALID outside fibers.
pub fn current_fiber_id() -> FiberId {
    tls::current_fiber_id()
}

/// True when called from fiber context.
pub fn in_fiber() -> bool {
    tls::in_fiber()
}
