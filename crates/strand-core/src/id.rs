//! Generational identifiers
//!
//! A `FiberId` packs a 32-bit arena slot and a 32-bit version into one
//! opaque 64-bit value. Slots are recycled; every reuse bumps the version,
//! so an id referring to a finished fiber stops matching and operations on
//! it fail instead of touching the new occupant.

use core::fmt;

/// Unique identifier for one execution of a fiber.
///
/// The zero value is reserved as the invalid sentinel: versions are managed
/// so that they never reach 0, hence a valid id is never 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber.
    pub const INVALID: FiberId = FiberId(0);

    /// Pack a slot and a version into an id.
    #[inline]
    pub const fn from_parts(slot: u32, version: u32) -> Self {
        FiberId(((version as u64) << 32) | slot as u64)
    }

    /// Rebuild an id from its raw representation.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FiberId(raw)
    }

    /// The raw 64-bit representation.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Arena slot this id refers to.
    #[inline]
    pub const fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Version encoded in this id.
    #[inline]
    pub const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::INVALID
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "FiberId(INVALID)")
        } else {
            write!(f, "FiberId({}v{})", self.slot(), self.version())
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a scheduled timer task.
///
/// Same slot/version packing as [`FiberId`]. Versions advance by 2 per full
/// schedule/run cycle and skip 0, so 0 doubles as the invalid sentinel
/// returned when the timer thread is stopping.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TimerId(u64);

impl TimerId {
    /// Sentinel returned when scheduling fails.
    pub const INVALID: TimerId = TimerId(0);

    #[inline]
    pub const fn from_parts(slot: u32, version: u32) -> Self {
        TimerId(((version as u64) << 32) | slot as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        TimerId(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[inline]
    pub const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl Default for TimerId {
    fn default() -> Self {
        TimerId::INVALID
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "TimerId(INVALID)")
        } else {
            write!(f, "TimerId({}v{})", self.slot(), self.version())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_roundtrip() {
        let id = FiberId::from_parts(42, 7);
        assert_eq!(id.slot(), 42);
        assert_eq!(id.version(), 7);
        assert_eq!(FiberId::from_raw(id.as_raw()), id);
        assert!(!id.is_invalid());
    }

    #[test]
    fn test_fiber_id_invalid() {
        assert!(FiberId::INVALID.is_invalid());
        assert!(FiberId::from_parts(0, 0).is_invalid());
        // A nonzero version makes slot 0 valid.
        assert!(!FiberId::from_parts(0, 1).is_invalid());
    }

    #[test]
    fn test_version_distinguishes_reuse() {
        let first = FiberId::from_parts(3, 1);
        let reused = FiberId::from_parts(3, 2);
        assert_ne!(first, reused);
        assert_eq!(first.slot(), reused.slot());
    }

    #[test]
    fn test_timer_id_roundtrip() {
        let id = TimerId::from_parts(9, 2);
        assert_eq!(id.slot(), 9);
        assert_eq!(id.version(), 2);
        assert!(TimerId::INVALID.is_invalid());
    }
}
