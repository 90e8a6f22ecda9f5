//! Grow-only slot arena with stable addresses
//!
//! Slots are handed out from a LIFO free list (cache-friendly reuse) or by
//! extending a high-water mark into lazily-initialized fixed-size segments.
//! A slot's address never changes and segments are never freed before the
//! arena itself, so a `&T` obtained from `get` stays valid for the arena's
//! lifetime; generational versions stored inside `T` make stale references
//! detectable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use strand_core::spinlock::SpinLock;

/// Slots per segment. Segments are allocated whole on first touch.
const SEGMENT_SLOTS: u32 = 64;

pub struct SlotArena<T> {
    segments: Box<[OnceLock<Box<[T]>>]>,
    /// High-water mark of fresh (never recycled) slots.
    next_fresh: AtomicU32,
    /// LIFO stack of recycled slots.
    free: SpinLock<Vec<u32>>,
    max_slots: u32,
    live: AtomicU32,
}

impl<T: Default> SlotArena<T> {
    pub fn with_capacity(max_slots: u32) -> Self {
        let nsegments = max_slots.div_ceil(SEGMENT_SLOTS) as usize;
        let segments = (0..nsegments).map(|_| OnceLock::new()).collect();
        SlotArena {
            segments,
            next_fresh: AtomicU32::new(0),
            free: SpinLock::new(Vec::new()),
            max_slots,
            live: AtomicU32::new(0),
        }
    }

    fn segment(&self, index: usize) -> &[T] {
        self.segments[index]
            .get_or_init(|| (0..SEGMENT_SLOTS).map(|_| T::default()).collect())
    }

    /// Borrow the record in `slot`. Returns `None` for slots past the
    /// high-water mark, i.e. ids that were never handed out.
    #[inline]
    pub fn get(&self, slot: u32) -> Option<&T> {
        if slot >= self.next_fresh.load(Ordering::Acquire) {
            return None;
        }
        let seg = self.segment((slot / SEGMENT_SLOTS) as usize);
        Some(&seg[(slot % SEGMENT_SLOTS) as usize])
    }

    /// Take a slot, preferring recently released ones.
    pub fn acquire(&self) -> Option<(u32, &T)> {
        if let Some(slot) = self.free.lock().pop() {
            self.live.fetch_add(1, Ordering::Relaxed);
            let seg = self.segment((slot / SEGMENT_SLOTS) as usize);
            return Some((slot, &seg[(slot % SEGMENT_SLOTS) as usize]));
        }
        loop {
            let slot = self.next_fresh.load(Ordering::Relaxed);
            if slot >= self.max_slots {
                return None;
            }
            // Touch the segment before publishing the new high-water mark so
            // a concurrent get() never observes an uninitialized segment.
            let seg = self.segment((slot / SEGMENT_SLOTS) as usize);
            if self
                .next_fresh
                .compare_exchange_weak(slot, slot + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.live.fetch_add(1, Ordering::Relaxed);
                return Some((slot, &seg[(slot % SEGMENT_SLOTS) as usize]));
            }
        }
    }

    /// Return a slot for reuse. The record itself is not reset; callers
    /// version-tag their records before releasing.
    pub fn release(&self, slot: u32) {
        debug_assert!(slot < self.next_fresh.load(Ordering::Acquire));
        self.free.lock().push(slot);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.max_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Rec {
        v: AtomicU64,
    }

    #[test]
    fn test_acquire_sequential() {
        let arena: SlotArena<Rec> = SlotArena::with_capacity(128);
        let (a, _) = arena.acquire().unwrap();
        let (b, _) = arena.acquire().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(arena.live(), 2);
    }

    #[test]
    fn test_release_reuses_lifo() {
        let arena: SlotArena<Rec> = SlotArena::with_capacity(128);
        let (a, _) = arena.acquire().unwrap();
        let (_b, _) = arena.acquire().unwrap();
        arena.release(a);
        let (c, _) = arena.acquire().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let arena: SlotArena<Rec> = SlotArena::with_capacity(2);
        assert!(arena.acquire().is_some());
        assert!(arena.acquire().is_some());
        assert!(arena.acquire().is_none());
    }

    #[test]
    fn test_get_never_allocated() {
        let arena: SlotArena<Rec> = SlotArena::with_capacity(128);
        assert!(arena.get(0).is_none());
        let (a, rec) = arena.acquire().unwrap();
        rec.v.store(7, Ordering::Relaxed);
        assert_eq!(arena.get(a).unwrap().v.load(Ordering::Relaxed), 7);
        assert!(arena.get(a + 1).is_none());
    }

    #[test]
    fn test_addresses_stable_across_growth() {
        let arena: SlotArena<Rec> = SlotArena::with_capacity(1024);
        let (a, rec) = arena.acquire().unwrap();
        let addr = rec as *const Rec;
        // Force several more segments into existence.
        for _ in 0..700 {
            arena.acquire().unwrap();
        }
        assert_eq!(arena.get(a).unwrap() as *const Rec, addr);
    }

    #[test]
    fn test_concurrent_acquire_unique() {
        let arena: Arc<SlotArena<Rec>> = Arc::new(SlotArena::with_capacity(16_384));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || (0..1000).map(|_| arena.acquire().unwrap().0).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
