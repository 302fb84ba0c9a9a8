//! Thin shims over OS scheduling and CPU-mode facilities used by the engine
//! and worker threads.

use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Priority used for engine threads when real-time scheduling is off, in the
/// crossplatform range `[0, 100]`.
const NORMAL_THREAD_PRIORITY: u8 = 50;

/// Number of logical CPU cores. Useful for choosing a worker thread count.
pub fn logical_core_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Requests real-time (or normal) scheduling priority for the current thread.
///
/// Failure is logged and otherwise ignored: the engine is still correct at
/// normal priority, just more prone to scheduling jitter.
pub fn set_thread_real_time(real_time: bool) {
    let priority = if real_time {
        ThreadPriority::Max
    } else {
        ThreadPriority::Crossplatform(NORMAL_THREAD_PRIORITY.try_into().unwrap())
    };

    if let Err(e) = set_current_thread_priority(priority) {
        log::warn!("Failed to set thread priority (real_time = {}): {:?}", real_time, e);
    }
}

/// Runs `f` with the CPU in flush-to-zero / denormals-are-zero mode.
///
/// Denormal operands can make floating-point arithmetic orders of magnitude
/// slower, which shows up as random stalls at audio rate.
pub(crate) fn with_denormals_flushed<T>(f: impl FnOnce() -> T) -> T {
    // SAFETY: only alters this thread's floating-point control flags, and
    // restores them when the closure returns.
    unsafe { no_denormals::no_denormals(f) }
}
