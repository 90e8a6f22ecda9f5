//! Worker threads: the scheduling loop
//!
//! Each worker pops from its own LIFO deque, then from its remote queue,
//! then steals from siblings along a per-worker pseudo-random sequence;
//! with nothing anywhere it parks on its lot. The lot state is sampled
//! *before* the final steal sweep, so a submission that lands between the
//! sweep and the park moves the generation and the park falls through.
//!
//! Fibers run inside their entity's execution context; when one suspends,
//! the action it yielded (requeue me / commit my waiter / schedule my
//! sleep / run this one next) executes here, strictly after the switch
//! has completed. That ordering is the at-most-one-runner invariant: a
//! fiber id only reappears in a queue once its coroutine is fully
//! suspended.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use strand_core::id::FiberId;
use strand_core::{kinfo, kwarn};

use crate::attr::{flags, StackClass};
use crate::clock;
use crate::meta::{address_entity, FiberEntity};
use crate::parking::LotState;
use crate::runtime::RuntimeInner;
use crate::stack::{ExecContext, ResumeArg, SwitchAction};
use crate::timer::UNSCHEDULE_REMOVED;
use crate::tls::{self, WorkerTls};

use super::group::{SchedulerGroup, WorkerShared, WorkerStartFn};

/// Coprime steal strides; each worker walks victims with one of these.
const OFFSET_TABLE: [u64; 14] = [37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97];

pub(crate) fn spawn_worker_thread(
    group: Arc<SchedulerGroup>,
    rt: Arc<RuntimeInner>,
    shared: Arc<WorkerShared>,
    local: crossbeam_deque::Worker<u64>,
    start_fn: Option<WorkerStartFn>,
) -> std::io::Result<JoinHandle<()>> {
    let index = shared.index;
    std::thread::Builder::new()
        .name(format!("strand-worker-{}", index))
        .spawn(move || worker_main(group, rt, shared, local, start_fn))
}

fn worker_main(
    group: Arc<SchedulerGroup>,
    rt: Arc<RuntimeInner>,
    shared: Arc<WorkerShared>,
    local: crossbeam_deque::Worker<u64>,
    start_fn: Option<WorkerStartFn>,
) {
    strand_core::kprint::set_worker_context(shared.index as u32);
    if let Some(f) = &start_fn {
        f();
    }

    let local = Rc::new(local);
    tls::set_worker(WorkerTls {
        group: Arc::clone(&group),
        shared: Arc::clone(&shared),
        index: shared.index,
        local: Rc::clone(&local),
        num_nosignal: Cell::new(0),
    });

    let seed = crate::fastrand::mix64(shared.index as u64 ^ crate::fastrand::thread_hash64());
    let mut core = WorkerCore {
        group: Arc::clone(&group),
        rt,
        shared,
        local,
        lot_index: group.lot_index_for_this_thread(),
        last_state: LotState::default(),
        seed,
        offset: OFFSET_TABLE[(seed % OFFSET_TABLE.len() as u64) as usize],
    };

    while let Some(tid) = core.wait_task() {
        core.run_chain(tid);
    }

    tls::clear_worker();
    strand_core::kprint::clear_worker_context();
}

struct WorkerCore {
    group: Arc<SchedulerGroup>,
    rt: Arc<RuntimeInner>,
    shared: Arc<WorkerShared>,
    local: Rc<crossbeam_deque::Worker<u64>>,
    lot_index: usize,
    last_state: LotState,
    seed: u64,
    offset: u64,
}

impl WorkerCore {
    /// Park until there is work; None when the group stopped.
    fn wait_task(&mut self) -> Option<FiberId> {
        loop {
            if self.last_state.stopped() {
                return None;
            }
            self.group.lot(self.lot_index).wait(self.last_state);
            if let Some(tid) = self.steal_task() {
                return Some(tid);
            }
        }
    }

    /// Remote queue first, then a randomized sweep over the siblings.
    fn steal_task(&mut self) -> Option<FiberId> {
        if let Some(raw) = self.shared.remote.pop() {
            return Some(FiberId::from_raw(raw));
        }
        // Sample the lot before the sweep: a submission after this point
        // changes the generation and the next park will not sleep.
        self.last_state = self.group.lot(self.lot_index).state();
        self.group.steal_task(&mut self.seed, self.offset)
    }

    fn next_task(&mut self) -> Option<FiberId> {
        if let Some(raw) = self.local.pop() {
            return Some(FiberId::from_raw(raw));
        }
        self.steal_task()
    }

    /// Run fibers back to back until the queues drain.
    fn run_chain(&mut self, mut tid: FiberId) {
        loop {
            let handoff = self.run_one(tid);
            match handoff.or_else(|| self.next_task()) {
                Some(next) => tid = next,
                None => break,
            }
        }
    }

    /// Run one fiber until it suspends or finishes; returns a fiber to run
    /// immediately when it performed a foreground hand-off.
    fn run_one(&self, tid: FiberId) -> Option<FiberId> {
        let Some(meta) = address_entity(&self.rt.fibers, tid) else {
            kwarn!("dropping unknown fiber id {:?}", tid);
            return None;
        };
        if !meta.matches(tid) {
            kwarn!("dropping stale fiber id {:?}", tid);
            return None;
        }
        let attr = meta.attr();
        if attr.stack_class == StackClass::Inline {
            self.run_inline(tid, meta);
            return None;
        }
        let ctx = match meta.take_exec() {
            Some(ctx) => ctx,
            None => match self.rt.stacks.acquire(attr.stack_class) {
                Some(ctx) => ctx,
                // Out of stack memory: run on the worker's own stack,
                // giving up suspension for liveness.
                None => {
                    self.run_inline(tid, meta);
                    return None;
                }
            },
        };
        self.resume_fiber(tid, meta, ctx, &attr)
    }

    fn resume_fiber(
        &self,
        tid: FiberId,
        meta: &FiberEntity,
        mut ctx: ExecContext,
        attr: &crate::attr::FiberAttr,
    ) -> Option<FiberId> {
        let start_ns = clock::now_ns();
        self.shared.nswitch.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        meta.stat_nswitch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if attr.has_flag(flags::LOG_CONTEXT_SWITCH) {
            kinfo!("switch into fiber {}", tid);
        }

        tls::put_keytable(meta.take_storage());
        tls::set_current_fiber(tid, meta as *const FiberEntity as usize, Some(ctx.yielder_slot().clone()));
        let outer_errno = swap_errno(meta.load_errno());

        let arg = if meta.mark_started() {
            ResumeArg::Run(meta as *const FiberEntity as usize)
        } else {
            ResumeArg::Resume
        };
        let action = ctx.resume(arg);

        meta.store_errno(swap_errno(outer_errno));
        tls::clear_current_fiber();
        meta.put_storage(tls::take_keytable());
        if attr.has_flag(flags::LOG_CONTEXT_SWITCH) {
            kinfo!("switch out of fiber {}", tid);
        }
        let elapsed = clock::now_ns().saturating_sub(start_ns);
        meta.stat_cputime_ns
            .fetch_add(elapsed, std::sync::atomic::Ordering::Relaxed);
        self.shared
            .cputime_ns
            .fetch_add(elapsed, std::sync::atomic::Ordering::Relaxed);

        match action {
            SwitchAction::Finished => {
                self.rt.stacks.release(ctx);
                self.finish_fiber(tid, meta, attr);
                None
            }
            SwitchAction::Yielded => {
                meta.put_exec(ctx);
                self.group.ready_to_run_general(tid, false);
                None
            }
            SwitchAction::Wait { event, waiter } => {
                meta.put_exec(ctx);
                event.commit_wait(&self.rt, &waiter, meta);
                None
            }
            SwitchAction::Sleep { timeout_us } => {
                meta.put_exec(ctx);
                self.add_sleep_task(tid, meta, timeout_us);
                None
            }
            SwitchAction::HandOff { next, nosignal } => {
                meta.put_exec(ctx);
                if meta.about_to_quit.load(std::sync::atomic::Ordering::Relaxed) {
                    // The caller is about to finish anyway; no point waking
                    // another worker for its remainder.
                    self.local.push(tid.as_raw());
                } else {
                    self.group.ready_to_run_general(tid, nosignal);
                }
                Some(next)
            }
        }
    }

    /// Inline execution on the worker's own stack (Inline class, or stack
    /// allocation failure). Cannot suspend; blocking parks the thread.
    fn run_inline(&self, tid: FiberId, meta: &FiberEntity) {
        let attr = meta.attr();
        meta.mark_started();
        self.shared.nswitch.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        meta.stat_nswitch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let start_ns = clock::now_ns();

        tls::put_keytable(meta.take_storage());
        tls::set_current_fiber(tid, meta as *const FiberEntity as usize, None);
        let outer_errno = swap_errno(meta.load_errno());

        if let Some(body) = meta.take_body() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
            if result.is_err() {
                strand_core::kerror!("fiber body panicked; fiber finished abnormally");
            }
        }

        meta.store_errno(swap_errno(outer_errno));
        tls::clear_current_fiber();
        meta.put_storage(tls::take_keytable());
        let elapsed = clock::now_ns().saturating_sub(start_ns);
        meta.stat_cputime_ns
            .fetch_add(elapsed, std::sync::atomic::Ordering::Relaxed);
        self.shared
            .cputime_ns
            .fetch_add(elapsed, std::sync::atomic::Ordering::Relaxed);

        self.finish_fiber(tid, meta, &attr);
    }

    fn finish_fiber(&self, tid: FiberId, meta: &FiberEntity, attr: &crate::attr::FiberAttr) {
        // Local storage first: joiners must observe destructor effects.
        if let Some(table) = meta.take_storage() {
            match attr.keytable_pool.as_ref() {
                Some(pool) => pool.release(table),
                None => drop(table),
            }
        }
        if attr.has_flag(flags::LOG_START_AND_FINISH) {
            kinfo!(
                "finished fiber {}, cputime={}ms",
                tid,
                meta.stats().cputime_ns / 1_000_000
            );
        }
        meta.advance_version();
        // Wake every joiner; the exclusion id never matches a real fiber.
        meta.join_event().wake_except(&self.rt, FiberId::INVALID);
        self.group.nfibers.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        self.rt.fibers.release(tid.slot());
    }

    /// Post-switch half of a sleep: schedule the wakeup only after the
    /// sleeper has fully left its stack, then expose the task id for
    /// interruption.
    fn add_sleep_task(&self, tid: FiberId, meta: &FiberEntity, timeout_us: u64) {
        let group = Arc::clone(&self.group);
        let sleep_id = self.rt.timer.schedule(
            clock::now_us().saturating_add(timeout_us),
            Box::new(move || {
                group.ready_to_run_general(tid, false);
            }),
        );
        if sleep_id.is_invalid() {
            // Timer gone (shutdown); do not leave the fiber parked forever.
            self.group.ready_to_run_general(tid, false);
            return;
        }
        {
            let _guard = meta.lock_version();
            if meta.matches(tid) && !meta.interrupted.load(std::sync::atomic::Ordering::Relaxed) {
                meta.current_sleep
                    .store(sleep_id.as_raw(), std::sync::atomic::Ordering::Relaxed);
                return;
            }
        }
        // Interrupted while falling asleep: the interrupter saw no sleep id,
        // so waking the fiber is on us (unless the timer beat us to it).
        if self.rt.timer.unschedule(sleep_id) == UNSCHEDULE_REMOVED {
            self.group.ready_to_run_general(tid, false);
        }
    }
}

#[cfg(unix)]
fn swap_errno(new: i32) -> i32 {
    unsafe {
        let loc = errno_location();
        let old = *loc;
        *loc = new;
        old
    }
}

#[cfg(not(unix))]
fn swap_errno(_new: i32) -> i32 {
    0
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut i32 {
    libc::__errno_location()
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn errno_location() -> *mut i32 {
    libc::__error()
}
