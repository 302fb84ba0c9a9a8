use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Process-wide engine configuration.
///
/// Every field may be changed at any time from any thread; the engine loop
/// observes changes at its next iteration boundary, so a write never lands in
/// the middle of a sample step. Reads and writes are lock-free.
pub struct EngineSettings {
    /// The nominal DSP rate, stored as `f32` bits.
    ///
    /// Default is `44100.0`.
    sample_rate: AtomicU32,

    /// Number of threads participating in module stepping, including the
    /// engine loop thread itself. Clamped to at least 1.
    ///
    /// Default is `1`.
    thread_count: AtomicUsize,

    /// Whether the engine loop and worker threads request an elevated
    /// real-time scheduling priority.
    ///
    /// Default is `false`.
    real_time: AtomicBool,

    /// Whether module `process` calls are timed and folded into each
    /// module's CPU-time average.
    ///
    /// Default is `false`.
    cpu_meter: AtomicBool,
}

impl EngineSettings {
    pub fn new() -> Self {
        Self {
            sample_rate: AtomicU32::new(44100.0f32.to_bits()),
            thread_count: AtomicUsize::new(1),
            real_time: AtomicBool::new(false),
            cpu_meter: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    pub fn set_sample_rate(&self, sample_rate: f32) {
        assert!(sample_rate > 0.0);
        self.sample_rate.store(sample_rate.to_bits(), Ordering::Relaxed);
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Relaxed)
    }

    pub fn set_thread_count(&self, thread_count: usize) {
        self.thread_count.store(thread_count.max(1), Ordering::Relaxed);
    }

    pub fn real_time(&self) -> bool {
        self.real_time.load(Ordering::Relaxed)
    }

    pub fn set_real_time(&self, real_time: bool) {
        self.real_time.store(real_time, Ordering::Relaxed);
    }

    pub fn cpu_meter(&self) -> bool {
        self.cpu_meter.load(Ordering::Relaxed)
    }

    pub fn set_cpu_meter(&self, cpu_meter: bool) {
        self.cpu_meter.store(cpu_meter, Ordering::Relaxed);
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::new()
    }
}
