//! Worker scheduling: the group, the worker loop and work stealing.

pub(crate) mod group;
pub(crate) mod worker;

pub use group::WorkerStartFn;
