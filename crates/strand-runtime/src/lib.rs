//! strand-runtime: the M:N fiber scheduler
//!
//! Worker threads run cooperatively-scheduled fibers from work-stealing
//! deques; a waitable-event primitive underpins every blocking operation;
//! a dedicated timer thread drives deadlines and sleeps. See the `strand`
//! facade crate for the assembled public API.

pub(crate) mod arena;
pub mod attr;
pub mod clock;
pub mod config;
pub(crate) mod event;
pub(crate) mod fastrand;
pub mod fls;
pub(crate) mod meta;
pub(crate) mod parking;
pub mod runtime;
pub(crate) mod sched;
pub(crate) mod stack;
pub mod sync;
pub mod timer;
pub(crate) mod tls;

pub use attr::{flags, FiberAttr, StackClass};
pub use config::RuntimeConfig;
pub use fls::{KeyDestructor, KeyTablePool, LocalKey};
pub use meta::FiberStats;
pub use runtime::{current_fiber_id, in_fiber, sleep_for, sleep_us, yield_now, Runtime};
pub use sched::WorkerStartFn;
pub use sync::{FiberCondvar, FiberMutex, FiberMutexGuard, Latch, TokenId};
pub use timer::{UNSCHEDULE_NOT_FOUND, UNSCHEDULE_REMOVED, UNSCHEDULE_RUNNING};
