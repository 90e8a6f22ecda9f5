//! Per-fiber entity records
//!
//! One `FiberEntity` per arena slot, reused across fiber generations. The
//! entity's version doubles as the join event's value: joiners wait for the
//! version to move past the one encoded in their id, and `advance_version`
//! at finish is what releases them. The small version lock makes
//! `get_attr` / `interrupt` / `stop` race-free against recycling without
//! any global lock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::id::FiberId;
use strand_core::spinlock::{SpinLock, SpinLockGuard};

use crate::arena::SlotArena;
use crate::attr::FiberAttr;
use crate::clock;
use crate::event::{WaitableEvent, Waiter};
use crate::fls::KeyTable;
use crate::stack::ExecContext;

/// A fiber's body closure.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Point-in-time execution statistics of one fiber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiberStats {
    pub cputime_ns: u64,
    pub nswitch: u64,
}

pub struct FiberEntity {
    /// Join event; its value is the entity's current version.
    join_event: Arc<WaitableEvent>,
    /// Guards version transitions and the flags below against concurrent
    /// get_attr/interrupt/join during recycling.
    version_lock: SpinLock<()>,
    pub(crate) stop: AtomicBool,
    pub(crate) interrupted: AtomicBool,
    pub(crate) about_to_quit: AtomicBool,
    body: SpinLock<Option<FiberFn>>,
    attr: SpinLock<FiberAttr>,
    /// Waiter record of an in-progress event wait, for interruption.
    current_waiter: SpinLock<Option<Arc<Waiter>>>,
    /// Raw TimerId of an in-progress sleep, for interruption.
    pub(crate) current_sleep: AtomicU64,
    /// Execution context while suspended; taken by the running worker.
    exec: SpinLock<Option<ExecContext>>,
    /// Key table while suspended; swapped into worker TLS while running.
    local_storage: SpinLock<Option<Box<KeyTable>>>,
    started: AtomicBool,
    saved_errno: AtomicI32,
    pub(crate) stat_cputime_ns: AtomicU64,
    pub(crate) stat_nswitch: AtomicU64,
    cpuwide_start_ns: AtomicU64,
}

impl Default for FiberEntity {
    fn default() -> Self {
        FiberEntity {
            join_event: WaitableEvent::new(1),
            version_lock: SpinLock::new(()),
            stop: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            about_to_quit: AtomicBool::new(false),
            body: SpinLock::new(None),
            attr: SpinLock::new(FiberAttr::default()),
            current_waiter: SpinLock::new(None),
            current_sleep: AtomicU64::new(0),
            exec: SpinLock::new(None),
            local_storage: SpinLock::new(None),
            started: AtomicBool::new(false),
            saved_errno: AtomicI32::new(0),
            stat_cputime_ns: AtomicU64::new(0),
            stat_nswitch: AtomicU64::new(0),
            cpuwide_start_ns: AtomicU64::new(0),
        }
    }
}

impl FiberEntity {
    /// Current version; also the join event's value.
    #[inline]
    pub(crate) fn version(&self) -> u32 {
        self.join_event.value().load(Ordering::Acquire)
    }

    /// Does `id` still refer to this incarnation?
    #[inline]
    pub(crate) fn matches(&self, id: FiberId) -> bool {
        self.version() == id.version()
    }

    pub(crate) fn lock_version(&self) -> SpinLockGuard<'_, ()> {
        self.version_lock.lock()
    }

    pub(crate) fn join_event(&self) -> &Arc<WaitableEvent> {
        &self.join_event
    }

    /// Prepare a recycled (or fresh) entity for a new fiber.
    pub(crate) fn init_for_spawn(&self, slot: u32, attr: FiberAttr, body: FiberFn) -> FiberId {
        debug_assert!(self.current_waiter.lock().is_none());
        self.stop.store(false, Ordering::Relaxed);
        self.interrupted.store(false, Ordering::Relaxed);
        self.about_to_quit.store(false, Ordering::Relaxed);
        self.current_sleep.store(0, Ordering::Relaxed);
        self.started.store(false, Ordering::Relaxed);
        self.saved_errno.store(0, Ordering::Relaxed);
        self.stat_cputime_ns.store(0, Ordering::Relaxed);
        self.stat_nswitch.store(0, Ordering::Relaxed);
        self.cpuwide_start_ns.store(clock::now_ns(), Ordering::Relaxed);
        *self.attr.lock() = attr;
        *self.body.lock() = Some(body);
        FiberId::from_parts(slot, self.version())
    }

    pub(crate) fn take_body(&self) -> Option<FiberFn> {
        self.body.lock().take()
    }

    pub(crate) fn attr(&self) -> FiberAttr {
        self.attr.lock().clone()
    }

    /// Attribute snapshot guarded by the version check.
    pub(crate) fn attr_checked(&self, id: FiberId) -> Option<FiberAttr> {
        let _g = self.version_lock.lock();
        if self.matches(id) {
            Some(self.attr.lock().clone())
        } else {
            None
        }
    }

    pub(crate) fn current_waiter_slot(&self) -> &SpinLock<Option<Arc<Waiter>>> {
        &self.current_waiter
    }

    pub(crate) fn take_exec(&self) -> Option<ExecContext> {
        self.exec.lock().take()
    }

    pub(crate) fn put_exec(&self, ctx: ExecContext) {
        *self.exec.lock() = Some(ctx);
    }

    pub(crate) fn take_storage(&self) -> Option<Box<KeyTable>> {
        self.local_storage.lock().take()
    }

    pub(crate) fn put_storage(&self, table: Option<Box<KeyTable>>) {
        *self.local_storage.lock() = table;
    }

    /// First resume runs the body; later resumes continue it.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load_errno(&self) -> i32 {
        self.saved_errno.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store_errno(&self, e: i32) {
        self.saved_errno.store(e, Ordering::Relaxed);
    }

    /// Finish this incarnation: bump the version (skipping 0) so joins and
    /// stale-id operations fail fast. Callers wake the join event after.
    pub(crate) fn advance_version(&self) -> u32 {
        let _g = self.version_lock.lock();
        let mut v = self.version().wrapping_add(1);
        if v == 0 {
            v = 1;
        }
        self.join_event.value().store(v, Ordering::Release);
        v
    }

    pub(crate) fn stats(&self) -> FiberStats {
        FiberStats {
            cputime_ns: self.stat_cputime_ns.load(Ordering::Relaxed),
            nswitch: self.stat_nswitch.load(Ordering::Relaxed),
        }
    }
}

/// Arena of fiber entities, slot-addressed by `FiberId::slot`.
pub(crate) type FiberArena = SlotArena<FiberEntity>;

/// Entity behind `id`, regardless of version match.
pub(crate) fn address_entity(arena: &FiberArena, id: FiberId) -> Option<&FiberEntity> {
    if id.is_invalid() {
        return None;
    }
    arena.get(id.slot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_init_id() {
        let e = FiberEntity::default();
        let id = e.init_for_spawn(5, FiberAttr::default(), Box::new(|| {}));
        assert_eq!(id.slot(), 5);
        assert_eq!(id.version(), 1);
        assert!(e.matches(id));
    }

    #[test]
    fn test_body_taken_once() {
        let e = FiberEntity::default();
        e.init_for_spawn(0, FiberAttr::default(), Box::new(|| {}));
        assert!(e.take_body().is_some());
        assert!(e.take_body().is_none());
    }

    #[test]
    fn test_advance_version_invalidates() {
        let e = FiberEntity::default();
        let id = e.init_for_spawn(0, FiberAttr::default(), Box::new(|| {}));
        let v = e.advance_version();
        assert_ne!(v, id.version());
        assert!(!e.matches(id));
        assert!(e.attr_checked(id).is_none());
    }

    #[test]
    fn test_mark_started_once() {
        let e = FiberEntity::default();
        assert!(e.mark_started());
        assert!(!e.mark_started());
    }
}
