//! Worker parking and the futex-equivalent wait word
//!
//! `FutexWord` is the single low-level blocking primitive: the timer thread
//! sleeps on one, non-fiber event waiters block on one, and `ParkingLot`
//! builds idle-worker parking on top of one.
//!
//! A `ParkingLot` holds a generation word: submitters bump it by 2 per
//! signal (bit 0 is the stop flag) and wake sleepers; a worker samples the
//! word *before* its final scan for work and passes the sample to `wait`,
//! which refuses to sleep if the word has moved on. That closes the race
//! between "saw no work" and "went to sleep".

use std::sync::atomic::Ordering;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexWord;
    } else {
        mod fallback;
        pub use fallback::FutexWord;
    }
}

/// Snapshot of a parking lot's generation word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LotState(u32);

impl LotState {
    #[inline]
    pub fn stopped(self) -> bool {
        self.0 & 1 != 0
    }
}

/// One parking spot shared by a subset of workers.
pub struct ParkingLot {
    pending: FutexWord,
}

impl ParkingLot {
    pub const fn new() -> Self {
        ParkingLot {
            pending: FutexWord::new(0),
        }
    }

    /// Announce up to `n` new tasks; wakes at most `n` parked workers.
    /// Returns how many were actually woken.
    pub fn signal(&self, n: u32) -> usize {
        if n == 0 {
            return 0;
        }
        self.pending.value().fetch_add(n << 1, Ordering::SeqCst);
        self.pending.wake(n)
    }

    /// Sample the generation word.
    #[inline]
    pub fn state(&self) -> LotState {
        LotState(self.pending.value().load(Ordering::SeqCst))
    }

    /// Sleep while the word still equals `seen`.
    pub fn wait(&self, seen: LotState) {
        self.pending.wait(seen.0, None);
    }

    /// Set the stop bit and wake everyone.
    pub fn stop(&self) {
        self.pending.value().fetch_or(1, Ordering::SeqCst);
        self.pending.wake(u32::MAX);
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}
