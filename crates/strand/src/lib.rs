//! # strand - M:N fiber runtime
//!
//! A large pool of lightweight, cooperatively-scheduled fibers multiplexed
//! onto a small pool of OS worker threads, with fiber-aware synchronization
//! primitives and a dedicated timer thread for deadline wakeups.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{Runtime, RuntimeConfig, Latch};
//! use std::sync::Arc;
//!
//! fn main() {
//!     let rt = Runtime::new(RuntimeConfig::from_env()).unwrap();
//!     rt.start().unwrap();
//!
//!     let latch = Arc::new(Latch::new(&rt, 8));
//!     for i in 0..8 {
//!         let latch = Arc::clone(&latch);
//!         rt.spawn(move || {
//!             println!("hello from fiber {}", i);
//!             strand::yield_now();
//!             latch.count_down(1);
//!         })
//!         .unwrap();
//!     }
//!     latch.wait().unwrap();
//!     rt.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       User code                           │
//! │        spawn() / join() / sleep_for() / FiberMutex        │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Scheduler group                       │
//! │       work stealing, parking lots, wake signaling         │
//! └───────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │   Timer   │
//!    │  thread   │      │  thread   │      │  thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │       Fiber entities, pooled stacks, waitable events      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every blocking operation bottoms out in one primitive: a waitable event
//! (an atomic value cell plus a FIFO waiter list). Fibers suspend
//! cooperatively on it; plain OS threads park on a futex word, so the same
//! mutexes and latches work from both sides of the runtime boundary.

// Core types
pub use strand_core::{FiberError, FiberId, FiberResult, LogLevel, TimerId};

// Logging macros and helpers
pub use strand_core::kprint::{init as init_logging, set_log_level};
pub use strand_core::{kdebug, kerror, kinfo, ktrace, kwarn};

// Environment helpers
pub use strand_core::{env_get, env_get_bool};

// Runtime surface
pub use strand_runtime::{
    current_fiber_id, flags, in_fiber, sleep_for, sleep_us, yield_now, FiberAttr, FiberCondvar,
    FiberMutex, FiberMutexGuard, FiberStats, KeyDestructor, KeyTablePool, Latch, LocalKey, Runtime,
    RuntimeConfig, StackClass, TokenId, WorkerStartFn,
};
