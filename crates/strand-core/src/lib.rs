//! Core types and utilities for the strand fiber runtime
//!
//! This crate is platform-agnostic and dependency-light: generational ids,
//! the error taxonomy, an internal spinlock, kernel-style log macros and
//! environment helpers. The scheduler itself lives in `strand-runtime`.

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod spinlock;

pub use env::{env_get, env_get_bool};
pub use error::{FiberError, FiberResult};
pub use id::{FiberId, TimerId};
pub use kprint::LogLevel;
pub use spinlock::{SpinLock, SpinLockGuard};
