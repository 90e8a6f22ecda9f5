//! Runtime configuration
//!
//! Library defaults with `STRAND_*` environment overrides.

use strand_core::env::env_get;
use strand_core::error::{FiberError, FiberResult};

/// Hard ceiling on worker threads per runtime.
pub const MAX_CONCURRENCY: usize = 1024;

/// Number of parking lots a scheduler group spreads its idle workers over.
pub const PARKING_LOT_COUNT: usize = 4;

pub mod defaults {
    /// Worker threads.
    pub const CONCURRENCY: usize = 8;
    /// Live fibers per runtime.
    pub const MAX_FIBERS: u32 = 65_536;
    /// Capacity of each worker's cross-thread submission queue.
    pub const REMOTE_QUEUE_CAPACITY: usize = 2048;
    /// Timer task buckets (sharded by submitting thread).
    pub const TIMER_BUCKETS: usize = 13;
    /// Stack bytes per class.
    pub const STACK_SIZE_SMALL: usize = 32 * 1024;
    pub const STACK_SIZE_NORMAL: usize = 1024 * 1024;
    pub const STACK_SIZE_LARGE: usize = 8 * 1024 * 1024;
    /// Pooled idle stacks kept per class.
    pub const STACK_POOL_CAP_SMALL: usize = 64;
    pub const STACK_POOL_CAP_NORMAL: usize = 64;
    pub const STACK_POOL_CAP_LARGE: usize = 8;
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads started by `Runtime::start`.
    pub concurrency: usize,
    /// Maximum live fibers.
    pub max_fibers: u32,
    /// Capacity of each worker's remote submission queue.
    pub remote_queue_capacity: usize,
    /// Number of timer buckets.
    pub timer_buckets: usize,
    /// Stack bytes for the Small class.
    pub stack_size_small: usize,
    /// Stack bytes for the Normal class.
    pub stack_size_normal: usize,
    /// Stack bytes for the Large class.
    pub stack_size_large: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment override.
    pub fn new() -> Self {
        Self {
            concurrency: defaults::CONCURRENCY,
            max_fibers: defaults::MAX_FIBERS,
            remote_queue_capacity: defaults::REMOTE_QUEUE_CAPACITY,
            timer_buckets: defaults::TIMER_BUCKETS,
            stack_size_small: defaults::STACK_SIZE_SMALL,
            stack_size_normal: defaults::STACK_SIZE_NORMAL,
            stack_size_large: defaults::STACK_SIZE_LARGE,
        }
    }

    /// Defaults with environment overrides applied.
    ///
    /// Recognized variables (all optional):
    /// - `STRAND_CONCURRENCY` - worker thread count
    /// - `STRAND_MAX_FIBERS` - live fiber ceiling
    /// - `STRAND_REMOTE_QUEUE_CAPACITY` - per-worker remote queue slots
    /// - `STRAND_TIMER_BUCKETS` - timer shard count
    /// - `STRAND_STACK_SMALL` / `STRAND_STACK_NORMAL` / `STRAND_STACK_LARGE`
    pub fn from_env() -> Self {
        Self {
            concurrency: env_get("STRAND_CONCURRENCY", defaults::CONCURRENCY),
            max_fibers: env_get("STRAND_MAX_FIBERS", defaults::MAX_FIBERS),
            remote_queue_capacity: env_get(
                "STRAND_REMOTE_QUEUE_CAPACITY",
                defaults::REMOTE_QUEUE_CAPACITY,
            ),
            timer_buckets: env_get("STRAND_TIMER_BUCKETS", defaults::TIMER_BUCKETS),
            stack_size_small: env_get("STRAND_STACK_SMALL", defaults::STACK_SIZE_SMALL),
            stack_size_normal: env_get("STRAND_STACK_NORMAL", defaults::STACK_SIZE_NORMAL),
            stack_size_large: env_get("STRAND_STACK_LARGE", defaults::STACK_SIZE_LARGE),
        }
    }

    pub fn validate(&self) -> FiberResult<()> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(FiberError::InvalidArgument);
        }
        if self.max_fibers == 0 {
            return Err(FiberError::InvalidArgument);
        }
        if self.timer_buckets == 0 || self.timer_buckets > 1024 {
            return Err(FiberError::InvalidArgument);
        }
        if self.remote_queue_capacity < 2 {
            return Err(FiberError::InvalidArgument);
        }
        Ok(())
    }

    /// Builder-style override of the worker count.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Builder-style override of the fiber ceiling.
    pub fn max_fibers(mut self, n: u32) -> Self {
        self.max_fibers = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(RuntimeConfig::new().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let cfg = RuntimeConfig::new().concurrency(0);
        assert_eq!(cfg.validate(), Err(FiberError::InvalidArgument));
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = RuntimeConfig::new().concurrency(2).max_fibers(128);
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.max_fibers, 128);
        assert!(cfg.validate().is_ok());
    }
}
