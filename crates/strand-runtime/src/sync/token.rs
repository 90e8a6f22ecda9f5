//! Cancellable token handles
//!
//! A token is a generational id over a lockable cell, the pattern an RPC
//! layer uses to race responses against cancellation: whoever holds the
//! lock may mutate the guarded call state; destroying the token bumps the
//! cell's version so every outstanding copy of the id goes stale at once,
//! and wakes joiners waiting for the token's end of life.
//!
//! Cell value states, with `B` the version a `create_token` handed out:
//! `B` valid and unlocked, `B+1` valid and locked, anything else stale.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use strand_core::error::{FiberError, FiberResult};

use crate::event::WaitableEvent;
use crate::runtime::Runtime;

/// Opaque token handle: `version << 32 | slot`, never zero while valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TokenId(u64);

impl TokenId {
    pub const INVALID: TokenId = TokenId(0);

    #[inline]
    const fn from_parts(slot: u32, version: u32) -> Self {
        TokenId(((version as u64) << 32) | slot as u64)
    }

    #[inline]
    const fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[inline]
    const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "TokenId(INVALID)")
        } else {
            write!(f, "TokenId({}v{})", self.slot(), self.version())
        }
    }
}

/// One token cell; recycled across generations like a fiber entity.
pub(crate) struct TokenCell {
    event: Arc<WaitableEvent>,
}

impl Default for TokenCell {
    fn default() -> Self {
        TokenCell {
            event: WaitableEvent::new(1),
        }
    }
}

impl Runtime {
    /// Mint a fresh token in the unlocked state.
    pub fn create_token(&self) -> FiberResult<TokenId> {
        let inner = self.inner();
        let Some((slot, cell)) = inner.tokens.acquire() else {
            return Err(FiberError::ResourceExhausted);
        };
        let mut base = cell.event.value().load(Ordering::Relaxed);
        if base == 0 {
            // Wrapped; re-anchor away from the invalid sentinel.
            base = 1;
            cell.event.value().store(base, Ordering::Relaxed);
        }
        Ok(TokenId::from_parts(slot, base))
    }

    /// Acquire the token's lock, waiting while another holder has it.
    /// Fails with `InvalidArgument` once the token is destroyed.
    pub fn token_lock(&self, id: TokenId) -> FiberResult<()> {
        let inner = self.inner();
        let Some(cell) = (!id.is_invalid())
            .then(|| inner.tokens.get(id.slot()))
            .flatten()
        else {
            return Err(FiberError::InvalidArgument);
        };
        loop {
            let v = cell.event.value().load(Ordering::Acquire);
            if v == id.version() {
                if cell
                    .event
                    .value()
                    .compare_exchange_weak(
                        v,
                        v.wrapping_add(1),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
            } else if v == id.version().wrapping_add(1) {
                match cell.event.wait(inner, v, None) {
                    Ok(())
                    | Err(FiberError::WouldBlock)
                    | Err(FiberError::Interrupted)
                    | Err(FiberError::Stopping) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                return Err(FiberError::InvalidArgument);
            }
        }
    }

    /// Release the token's lock; contenders re-race for it.
    pub fn token_unlock(&self, id: TokenId) -> FiberResult<()> {
        let inner = self.inner();
        let Some(cell) = (!id.is_invalid())
            .then(|| inner.tokens.get(id.slot()))
            .flatten()
        else {
            return Err(FiberError::InvalidArgument);
        };
        let locked = id.version().wrapping_add(1);
        if cell
            .event
            .value()
            .compare_exchange(locked, id.version(), Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return Err(FiberError::InvalidArgument);
        }
        // Wake everyone: lockers re-race, joiners re-check and keep
        // waiting. A single wake could land on a joiner and strand a
        // locker.
        cell.event.wake_all(inner);
        Ok(())
    }

    /// Release the lock and destroy the token in one step. Joiners wake;
    /// every outstanding id copy becomes stale.
    pub fn token_unlock_and_destroy(&self, id: TokenId) -> FiberResult<()> {
        self.token_destroy_from(id, id.version().wrapping_add(1))
    }

    /// Destroy an unlocked token.
    pub fn token_destroy(&self, id: TokenId) -> FiberResult<()> {
        self.token_destroy_from(id, id.version())
    }

    fn token_destroy_from(&self, id: TokenId, expected: u32) -> FiberResult<()> {
        let inner = self.inner();
        let Some(cell) = (!id.is_invalid())
            .then(|| inner.tokens.get(id.slot()))
            .flatten()
        else {
            return Err(FiberError::InvalidArgument);
        };
        // The next generation's base version; skip the sentinel-producing 0.
        let mut next = id.version().wrapping_add(2);
        if next == 0 {
            next = 1;
        }
        if cell
            .event
            .value()
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(FiberError::InvalidArgument);
        }
        cell.event.wake_all(inner);
        inner.tokens.release(id.slot());
        Ok(())
    }

    /// Block until the token is destroyed. Returns immediately for ids
    /// that are already stale.
    pub fn token_join(&self, id: TokenId) -> FiberResult<()> {
        let inner = self.inner();
        let Some(cell) = (!id.is_invalid())
            .then(|| inner.tokens.get(id.slot()))
            .flatten()
        else {
            return Err(FiberError::InvalidArgument);
        };
        loop {
            let v = cell.event.value().load(Ordering::Acquire);
            if v != id.version() && v != id.version().wrapping_add(1) {
                return Ok(());
            }
            match cell.event.wait(inner, v, None) {
                Ok(())
                | Err(FiberError::WouldBlock)
                | Err(FiberError::Interrupted)
                | Err(FiberError::Stopping) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AOrd};
    use std::time::Duration;

    #[test]
    fn test_lock_unlock_destroy() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let id = rt.create_token().unwrap();
        rt.token_lock(id).unwrap();
        rt.token_unlock(id).unwrap();
        rt.token_destroy(id).unwrap();
        // Every further operation sees a stale version.
        assert_eq!(rt.token_lock(id), Err(FiberError::InvalidArgument));
        assert_eq!(rt.token_destroy(id), Err(FiberError::InvalidArgument));
        rt.stop();
    }

    #[test]
    fn test_unlock_without_lock_rejected() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let id = rt.create_token().unwrap();
        assert_eq!(rt.token_unlock(id), Err(FiberError::InvalidArgument));
        rt.token_destroy(id).unwrap();
        rt.stop();
    }

    #[test]
    fn test_recycled_slot_new_version() {
        let rt = Runtime::with_concurrency(1).unwrap();
        let first = rt.create_token().unwrap();
        rt.token_destroy(first).unwrap();
        let second = rt.create_token().unwrap();
        assert_ne!(first, second);
        rt.token_destroy(second).unwrap();
        rt.stop();
    }

    #[test]
    fn test_join_blocks_until_destroy() {
        let rt = Runtime::with_concurrency(2).unwrap();
        let id = rt.create_token().unwrap();
        let destroyed = Arc::new(AtomicBool::new(false));

        let rt2 = rt.clone();
        let destroyed2 = Arc::clone(&destroyed);
        let joiner = rt
            .spawn(move || {
                rt2.token_join(id).unwrap();
                assert!(destroyed2.load(AOrd::SeqCst));
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        rt.token_lock(id).unwrap();
        destroyed.store(true, AOrd::SeqCst);
        rt.token_unlock_and_destroy(id).unwrap();
        rt.join(joiner).unwrap();
        rt.stop();
    }

    #[test]
    fn test_lock_contention_serializes() {
        let rt = Runtime::with_concurrency(2).unwrap();
        let id = rt.create_token().unwrap();
        rt.token_lock(id).unwrap();

        let rt2 = rt.clone();
        let locked_elsewhere = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&locked_elsewhere);
        let tid = rt
            .spawn(move || {
                rt2.token_lock(id).unwrap();
                flag.store(true, AOrd::SeqCst);
                rt2.token_unlock(id).unwrap();
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(!locked_elsewhere.load(AOrd::SeqCst));
        rt.token_unlock(id).unwrap();
        rt.join(tid).unwrap();
        assert!(locked_elsewhere.load(AOrd::SeqCst));
        rt.token_destroy(id).unwrap();
        rt.stop();
    }
}
