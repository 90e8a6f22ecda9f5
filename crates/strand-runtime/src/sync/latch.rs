//! Count-down latch
//!
//! The event value is the remaining count; `count_down` to zero releases
//! every waiter at once.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use strand_core::error::{FiberError, FiberResult};

use crate::clock;
use crate::event::WaitableEvent;
use crate::runtime::{Runtime, RuntimeInner};

pub struct Latch {
    rt: Arc<RuntimeInner>,
    event: Arc<WaitableEvent>,
}

impl Latch {
    pub fn new(rt: &Runtime, count: u32) -> Self {
        Latch {
            rt: Arc::clone(rt.inner()),
            event: WaitableEvent::new(count),
        }
    }

    /// Decrement the count by `n` (saturating at zero); releases all
    /// waiters when it reaches zero.
    pub fn count_down(&self, n: u32) {
        if n == 0 {
            return;
        }
        loop {
            let current = self.event.value().load(Ordering::Relaxed);
            if current == 0 {
                return;
            }
            let next = current.saturating_sub(n);
            if self
                .event
                .value()
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if next == 0 {
                    self.event.wake_all(&self.rt);
                }
                return;
            }
        }
    }

    /// Raise the count by `n`. Only valid while the latch has not fired;
    /// re-arming a fired latch would race its released waiters.
    pub fn add(&self, n: u32) -> FiberResult<()> {
        loop {
            let current = self.event.value().load(Ordering::Relaxed);
            if current == 0 {
                return Err(FiberError::InvalidArgument);
            }
            if self
                .event
                .value()
                .compare_exchange_weak(
                    current,
                    current.saturating_add(n),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// True when the count already reached zero.
    pub fn try_wait(&self) -> bool {
        self.event.value().load(Ordering::Acquire) == 0
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) -> FiberResult<()> {
        loop {
            let current = self.event.value().load(Ordering::Acquire);
            if current == 0 {
                return Ok(());
            }
            match self.event.wait(&self.rt, current, None) {
                Ok(())
                | Err(FiberError::WouldBlock)
                | Err(FiberError::Interrupted)
                | Err(FiberError::Stopping) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until the count reaches zero or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> FiberResult<()> {
        let deadline = clock::deadline_us(timeout);
        loop {
            let current = self.event.value().load(Ordering::Acquire);
            if current == 0 {
                return Ok(());
            }
            match self.event.wait(&self.rt, current, Some(deadline)) {
                Ok(())
                | Err(FiberError::WouldBlock)
                | Err(FiberError::Interrupted)
                | Err(FiberError::Stopping) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
