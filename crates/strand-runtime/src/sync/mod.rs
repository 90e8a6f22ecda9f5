//! Synchronization primitives built on the waitable event.

pub mod condvar;
pub mod latch;
pub mod mutex;
pub mod token;

pub use condvar::FiberCondvar;
pub use latch::Latch;
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use token::TokenId;
