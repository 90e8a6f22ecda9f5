//! Kernel-style leveled logging for the runtime
//!
//! The scheduler cannot log through an ordinary logging framework: a
//! framework that takes locks or blocks would re-enter the very primitives
//! being traced. These macros write a single formatted line straight to
//! stderr under the stderr lock, tagged with the worker and fiber the
//! calling thread is currently running.
//!
//! # Environment variables
//!
//! - `STRAND_LOG_LEVEL=<off|error|warn|info|debug|trace>` (default: warn)
//! - `STRAND_FLUSH_EPRINT=1` - flush stderr after every line

use std::io::Write;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "E",
            LogLevel::Warn => "W",
            LogLevel::Info => "I",
            LogLevel::Debug => "D",
            LogLevel::Trace => "T",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    // u32::MAX means "not a worker thread" / "no fiber running".
    static CTX_WORKER: Cell<u32> = const { Cell::new(u32::MAX) };
    static CTX_FIBER: Cell<u64> = const { Cell::new(0) };
}

/// Initialize from environment variables. Called lazily on first log.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("STRAND_FLUSH_EPRINT") {
        let on = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(on, Ordering::Relaxed);
    }
    if let Ok(val) = std::env::var("STRAND_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Set log level programmatically (overrides the environment).
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Check if a log level is enabled. Use to skip expensive formatting.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Tag subsequent logs on this thread as coming from worker `id`.
pub fn set_worker_context(id: u32) {
    CTX_WORKER.with(|c| c.set(id));
}

/// Tag subsequent logs on this thread as running fiber `raw_id` (0 clears).
pub fn set_fiber_context(raw_id: u64) {
    CTX_FIBER.with(|c| c.set(raw_id));
}

pub fn clear_worker_context() {
    CTX_WORKER.with(|c| c.set(u32::MAX));
    CTX_FIBER.with(|c| c.set(0));
}

/// Internal: format one line with the level tag and thread context.
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let worker = CTX_WORKER.with(|c| c.get());
    let fiber = CTX_FIBER.with(|c| c.get());
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = match (worker, fiber) {
        (u32::MAX, _) => write!(handle, "[{}] ", level.tag()),
        (w, 0) => write!(handle, "[{} w{}] ", level.tag(), w),
        (w, f) => write!(handle, "[{} w{} f{}] ", level.tag(), w, f),
    };
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8_saturates() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        kerror!("e {}", 1);
        kwarn!("w");
        kinfo!("i");
        kdebug!("d");
        ktrace!("t");
    }

    #[test]
    fn test_context_set_clear() {
        set_worker_context(3);
        set_fiber_context(42);
        clear_worker_context();
        // No panic and context is reset; output itself is manual-only.
    }
}
