use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use super::barrier::HybridBarrier;
use super::EngineCore;
use crate::module::{ProcessArgs, SharedModule};
use crate::platform;

/// Time constant of the per-module CPU-time average, in seconds.
const CPU_TAU: f32 = 2.0;

/// State shared between the engine loop thread and the worker threads for
/// the duration of a step. Everything here is lock-free; mutual exclusion on
/// the modules themselves comes from the work-stealing index and the barrier
/// pair.
pub(crate) struct StepShared {
    /// Snapshot of the module list, republished under the control mutex
    /// whenever the list changes. Stepping threads load it at each step.
    pub modules: ArcSwap<Vec<SharedModule>>,
    /// Next module position to be claimed by a stepping thread.
    pub module_index: AtomicUsize,
    /// Start-of-step rendezvous.
    pub engine_barrier: HybridBarrier,
    /// End-of-step rendezvous.
    pub worker_barrier: HybridBarrier,
    /// The applied sample rate and period as `f32` bits. The settings value
    /// may run ahead of these until the loop's next reload window.
    sample_rate: AtomicU32,
    sample_time: AtomicU32,
}

impl StepShared {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            modules: ArcSwap::from_pointee(Vec::new()),
            module_index: AtomicUsize::new(0),
            engine_barrier: HybridBarrier::new(),
            worker_barrier: HybridBarrier::new(),
            sample_rate: AtomicU32::new(sample_rate.to_bits()),
            sample_time: AtomicU32::new((1.0 / sample_rate).to_bits()),
        }
    }

    pub fn publish_sample_rate(&self, sample_rate: f32, sample_time: f32) {
        self.sample_rate.store(sample_rate.to_bits(), Ordering::SeqCst);
        self.sample_time.store(sample_time.to_bits(), Ordering::SeqCst);
    }

    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.sample_rate.load(Ordering::SeqCst))
    }

    pub fn sample_time(&self) -> f32 {
        f32::from_bits(self.sample_time.load(Ordering::SeqCst))
    }
}

/// A dedicated stepping thread. Worker `id`s start at 1; the engine loop
/// thread participates in stepping as thread 0.
pub(crate) struct EngineWorker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineWorker {
    pub fn start(id: usize, core: Arc<EngineCore>, real_time: bool) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running2 = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name(format!("modrack-worker-{}", id))
            .spawn(move || {
                platform::set_thread_real_time(real_time);
                platform::with_denormals_flushed(|| worker_run(&core, &running2, id));
            })
            .expect("failed to spawn engine worker thread");

        Self { running, thread: Some(thread) }
    }

    /// Flags the worker to exit at its next start-of-step rendezvous. The
    /// caller must still release the engine barrier once so the worker
    /// observes the flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Engine worker thread panicked");
            }
        }
    }
}

fn worker_run(core: &EngineCore, running: &AtomicBool, thread_id: usize) {
    log::debug!("Engine worker {} started", thread_id);
    loop {
        core.shared.engine_barrier.wait();
        if !running.load(Ordering::SeqCst) {
            log::debug!("Engine worker {} stopping", thread_id);
            return;
        }
        step_modules(core, thread_id);
        core.shared.worker_barrier.wait();
    }
}

/// Steps modules until the shared index runs past the end of the list.
/// Every stepping thread (the engine loop included) runs this same loop
/// between the two barriers; the fetch-add hands each module to exactly one
/// thread.
pub(crate) fn step_modules(core: &EngineCore, _thread_id: usize) {
    let shared = &core.shared;
    let modules = shared.modules.load();
    let args = ProcessArgs {
        sample_rate: shared.sample_rate(),
        sample_time: shared.sample_time(),
    };
    let cpu_meter = core.settings.cpu_meter();

    loop {
        let i = shared.module_index.fetch_add(1, Ordering::SeqCst);
        if i >= modules.len() {
            break;
        }

        let mut module = modules[i].borrow_mut();
        let module = &mut *module;

        if !module.bypass {
            if cpu_meter {
                let start = Instant::now();
                module.process(&args);
                let elapsed = start.elapsed().as_secs_f32();
                module.cpu_time += (elapsed - module.cpu_time) * args.sample_time / CPU_TAU;
            } else {
                module.process(&args);
            }
        }

        // Port lights animate even while the module is bypassed.
        for input in &mut module.inputs {
            input.process(args.sample_time);
        }
        for output in &mut module.outputs {
            output.process(args.sample_time);
        }
    }
}
