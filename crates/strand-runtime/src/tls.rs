//! Thread-local scheduling context
//!
//! Each worker OS thread registers itself here; fiber-side code (yield,
//! event wait, local storage) reads the current worker, the current fiber
//! and the trampoline yielder through these slots. The running fiber's
//! key table is swapped in and out on every context switch so storage
//! lookups never take a lock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use strand_core::id::FiberId;

use crate::fls::KeyTable;
use crate::sched::group::{SchedulerGroup, WorkerShared};

/// Per-thread worker registration.
pub(crate) struct WorkerTls {
    pub group: Arc<SchedulerGroup>,
    pub shared: Arc<WorkerShared>,
    pub index: usize,
    /// Owner end of this worker's work-stealing deque.
    pub local: Rc<crossbeam_deque::Worker<u64>>,
    /// Pending wake signals deferred by NO_SIGNAL submissions.
    pub num_nosignal: Cell<u32>,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerTls>> = const { RefCell::new(None) };
    static CURRENT_FIBER: Cell<u64> = const { Cell::new(0) };
    static CURRENT_META: Cell<usize> = const { Cell::new(0) };
    static YIELDER_SLOT: RefCell<Option<Arc<AtomicUsize>>> = const { RefCell::new(None) };
    static KEYTABLE: RefCell<Option<Box<KeyTable>>> = const { RefCell::new(None) };
}

pub(crate) fn set_worker(tls: WorkerTls) {
    WORKER.with(|w| *w.borrow_mut() = Some(tls));
}

pub(crate) fn clear_worker() {
    WORKER.with(|w| *w.borrow_mut() = None);
}

/// Run `f` with the current worker registration, if any.
pub(crate) fn with_worker<R>(f: impl FnOnce(Option<&WorkerTls>) -> R) -> R {
    WORKER.with(|w| f(w.borrow().as_ref()))
}

/// True when the calling thread is a worker of `group`.
pub(crate) fn is_worker_of(group: &Arc<SchedulerGroup>) -> bool {
    with_worker(|w| w.map_or(false, |w| Arc::ptr_eq(&w.group, group)))
}

pub(crate) fn set_current_fiber(id: FiberId, meta_addr: usize, yielder: Option<Arc<AtomicUsize>>) {
    CURRENT_FIBER.with(|c| c.set(id.as_raw()));
    CURRENT_META.with(|c| c.set(meta_addr));
    YIELDER_SLOT.with(|y| *y.borrow_mut() = yielder);
    strand_core::kprint::set_fiber_context(id.as_raw());
}

pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|c| c.set(0));
    CURRENT_META.with(|c| c.set(0));
    YIELDER_SLOT.with(|y| *y.borrow_mut() = None);
    strand_core::kprint::set_fiber_context(0);
}

/// Id of the fiber running on this thread, INVALID outside fibers.
#[inline]
pub fn current_fiber_id() -> FiberId {
    FiberId::from_raw(CURRENT_FIBER.with(|c| c.get()))
}

/// Address of the running fiber's entity, 0 outside fibers.
#[inline]
pub(crate) fn current_meta_addr() -> usize {
    CURRENT_META.with(|c| c.get())
}

/// True when called from any fiber (coroutine-backed or inline).
#[inline]
pub fn in_fiber() -> bool {
    CURRENT_META.with(|c| c.get()) != 0
}

/// True when the running fiber can suspend cooperatively.
#[inline]
pub(crate) fn in_coroutine_fiber() -> bool {
    YIELDER_SLOT.with(|y| y.borrow().is_some())
}

pub(crate) fn yielder_slot() -> Option<Arc<AtomicUsize>> {
    YIELDER_SLOT.with(|y| y.borrow().clone())
}

/// Install the suspended fiber's key table for the duration of its run.
pub(crate) fn put_keytable(table: Option<Box<KeyTable>>) {
    KEYTABLE.with(|k| *k.borrow_mut() = table);
}

/// Remove the running fiber's key table (on suspension or finish).
pub(crate) fn take_keytable() -> Option<Box<KeyTable>> {
    KEYTABLE.with(|k| k.borrow_mut().take())
}

/// Access the running fiber's key table, creating it on first use.
pub(crate) fn with_keytable<R>(
    create: impl FnOnce() -> Box<KeyTable>,
    f: impl FnOnce(&mut KeyTable) -> R,
) -> R {
    KEYTABLE.with(|k| {
        let mut slot = k.borrow_mut();
        let table = slot.get_or_insert_with(create);
        f(table)
    })
}

/// Read-only access without creating a table.
pub(crate) fn with_keytable_opt<R>(f: impl FnOnce(Option<&KeyTable>) -> R) -> R {
    KEYTABLE.with(|k| f(k.borrow().as_deref()))
}
