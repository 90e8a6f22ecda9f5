//! Execution stacks and the coroutine trampoline
//!
//! A fiber's stack is owned by an [`ExecContext`]: a corosensei coroutine
//! running a trampoline loop that executes one fiber body per lap and then
//! yields [`SwitchAction::Finished`] back to the worker. Because the
//! coroutine never returns, the context (and its mmapped stack) is reusable
//! for the next fiber without another allocation; idle contexts sit in a
//! per-class pool.
//!
//! Suspension is worker-mediated: fiber code yields a [`SwitchAction`]
//! describing what the worker must do after the switch completes (requeue
//! me, enqueue my waiter record, schedule my sleep). Running that action
//! only after `resume` has returned is what makes it safe for another
//! worker to pick the fiber up again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use strand_core::id::FiberId;
use strand_core::kerror;

use crate::attr::StackClass;
use crate::config::RuntimeConfig;
use crate::event::{WaitableEvent, Waiter};
use crate::meta::FiberEntity;
use crate::tls;

/// Input to a context resume.
pub(crate) enum ResumeArg {
    /// First entry for a fiber: run the entity at this address.
    Run(usize),
    /// Re-entry after a suspension.
    Resume,
}

/// What the suspending fiber asks its worker to do after the switch.
pub(crate) enum SwitchAction {
    /// Requeue me; I am runnable (cooperative yield).
    Yielded,
    /// Enqueue my waiter on the event, re-checking the value under the
    /// event lock; requeue me immediately if the wait is already moot.
    Wait {
        event: Arc<WaitableEvent>,
        waiter: Arc<Waiter>,
    },
    /// Schedule a timer task that requeues me after `timeout_us`.
    Sleep { timeout_us: u64 },
    /// Run `next` on this worker right now and requeue me behind it.
    HandOff { next: FiberId, nosignal: bool },
    /// My body returned; finish me.
    Finished,
}

type FiberCoroutine = Coroutine<ResumeArg, SwitchAction, (), &'static mut DefaultStack>;

/// A pooled stack plus the trampoline coroutine that runs on it.
pub(crate) struct ExecContext {
    coroutine: Option<FiberCoroutine>,
    /// Backing stack. Declared after the coroutine so the coroutine drops
    /// (and unwinds) first.
    #[allow(dead_code)]
    stack: Box<DefaultStack>,
    /// Address of the trampoline's `Yielder`, published on first entry.
    /// The worker installs it into TLS before every resume so fiber code
    /// can suspend from arbitrary call depth.
    yielder_slot: Arc<AtomicUsize>,
    class: StackClass,
}

// Safety: the context is only resumed by the worker that currently owns it
// (taken from the entity under its lock); migration between workers passes
// through that lock with the coroutine suspended.
unsafe impl Send for ExecContext {}

impl ExecContext {
    fn new(class: StackClass, stack_size: usize) -> std::io::Result<Self> {
        let mut stack = Box::new(DefaultStack::new(stack_size)?);
        // Extend the stack borrow to 'static for the coroutine type.
        // Safety: `coroutine` is dropped before `stack` (field order), and
        // the stack box never moves its heap allocation.
        let stack_ref = unsafe {
            std::mem::transmute::<&mut DefaultStack, &'static mut DefaultStack>(stack.as_mut())
        };
        let yielder_slot = Arc::new(AtomicUsize::new(0));
        let slot = Arc::clone(&yielder_slot);
        let coroutine = Coroutine::with_stack(stack_ref, move |yielder, mut input: ResumeArg| {
            slot.store(
                yielder as *const Yielder<ResumeArg, SwitchAction> as usize,
                Ordering::Release,
            );
            loop {
                if let ResumeArg::Run(meta_addr) = input {
                    let meta = unsafe { &*(meta_addr as *const FiberEntity) };
                    if let Some(body) = meta.take_body() {
                        let result =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                        if result.is_err() {
                            kerror!("fiber body panicked; fiber finished abnormally");
                        }
                    }
                }
                input = yielder.suspend(SwitchAction::Finished);
            }
        });
        Ok(ExecContext {
            coroutine: Some(coroutine),
            stack,
            yielder_slot,
            class,
        })
    }

    #[inline]
    pub(crate) fn class(&self) -> StackClass {
        self.class
    }

    #[inline]
    pub(crate) fn yielder_slot(&self) -> &Arc<AtomicUsize> {
        &self.yielder_slot
    }

    /// Resume the trampoline; returns the fiber's post-switch request.
    pub(crate) fn resume(&mut self, arg: ResumeArg) -> SwitchAction {
        match self.coroutine.as_mut() {
            Some(co) => match co.resume(arg) {
                CoroutineResult::Yield(action) => action,
                // The trampoline loops forever; a return means it unwound.
                CoroutineResult::Return(()) => SwitchAction::Finished,
            },
            None => SwitchAction::Finished,
        }
    }
}

/// Suspend the calling fiber, handing `action` to its worker.
///
/// Must only be called from inside a coroutine-backed fiber; the worker
/// re-installs the yielder before every resume.
pub(crate) fn suspend(action: SwitchAction) -> ResumeArg {
    let slot = tls::yielder_slot().expect("suspend called outside fiber context");
    let ptr = slot.load(Ordering::Acquire) as *const Yielder<ResumeArg, SwitchAction>;
    debug_assert!(!ptr.is_null());
    // Safety: the yielder lives on the coroutine stack and is valid for the
    // whole time the coroutine is running or suspended.
    let yielder = unsafe { &*ptr };
    yielder.suspend(action)
}

struct PoolClass {
    free: Mutex<Vec<ExecContext>>,
    stack_size: usize,
    cap: usize,
}

impl PoolClass {
    fn new(stack_size: usize, cap: usize) -> Self {
        PoolClass {
            free: Mutex::new(Vec::new()),
            stack_size,
            cap,
        }
    }
}

/// Pool of idle execution contexts, one bucket per stack class.
pub(crate) struct StackPool {
    small: PoolClass,
    normal: PoolClass,
    large: PoolClass,
}

impl StackPool {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        use crate::config::defaults;
        StackPool {
            small: PoolClass::new(config.stack_size_small, defaults::STACK_POOL_CAP_SMALL),
            normal: PoolClass::new(config.stack_size_normal, defaults::STACK_POOL_CAP_NORMAL),
            large: PoolClass::new(config.stack_size_large, defaults::STACK_POOL_CAP_LARGE),
        }
    }

    fn class(&self, class: StackClass) -> Option<&PoolClass> {
        match class {
            StackClass::Inline => None,
            StackClass::Small => Some(&self.small),
            StackClass::Normal => Some(&self.normal),
            StackClass::Large => Some(&self.large),
        }
    }

    /// Take a pooled context or build a fresh one.
    ///
    /// Returns `None` for the Inline class and on allocation failure; the
    /// caller falls back to running the fiber on the worker's own stack,
    /// trading concurrency for liveness.
    pub(crate) fn acquire(&self, class: StackClass) -> Option<ExecContext> {
        let pool = self.class(class)?;
        if let Some(ctx) = pool.free.lock().expect("stack pool poisoned").pop() {
            return Some(ctx);
        }
        match ExecContext::new(class, pool.stack_size) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                kerror!("stack allocation failed for {:?}: {}", class, e);
                None
            }
        }
    }

    /// Return an idle context; drops it when the class pool is full.
    pub(crate) fn release(&self, ctx: ExecContext) {
        if let Some(pool) = self.class(ctx.class()) {
            let mut free = pool.free.lock().expect("stack pool poisoned");
            if free.len() < pool.cap {
                free.push(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_roundtrip() {
        let config = RuntimeConfig::new();
        let pool = StackPool::new(&config);
        let ctx = pool.acquire(StackClass::Small).expect("stack");
        assert_eq!(ctx.class(), StackClass::Small);
        pool.release(ctx);
        // Second acquire reuses the pooled context.
        let again = pool.acquire(StackClass::Small).expect("stack");
        assert_eq!(again.class(), StackClass::Small);
    }

    #[test]
    fn test_inline_has_no_context() {
        let config = RuntimeConfig::new();
        let pool = StackPool::new(&config);
        assert!(pool.acquire(StackClass::Inline).is_none());
    }
}
