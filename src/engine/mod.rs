//! The sample-stepping kernel: engine state, the step kernel, the pacing
//! loop, and the locked mutation API.
//!
//! One engine loop thread paces the DSP graph against wall-clock time and
//! steps it in batches of [`MUTEX_STEPS`] samples while holding the control
//! mutex. `thread_count - 1` worker threads join in on every step through a
//! pair of hybrid barriers, pulling modules off a shared atomic index.
//! External callers mutate the graph through methods that take a VIP guard
//! (so the loop parks between batches) and then the control mutex.

mod barrier;
mod vip;
mod worker;

use fnv::FnvHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cable::Cable;
use crate::module::{ExpanderSide, SharedModule};
use crate::param_handle::ParamHandle;
use crate::platform;
use crate::settings::EngineSettings;

use vip::VipMutex;
use worker::{EngineWorker, StepShared};

/// Samples stepped per control-mutex acquisition. Amortizes lock overhead
/// across ~2.9 ms of audio at 44.1 kHz while bounding how long a queued
/// mutation can wait.
const MUTEX_STEPS: usize = 128;

/// Decay rate (per second) of parameter smoothing; the time constant is
/// roughly one graphics frame.
const SMOOTH_LAMBDA: f32 = 60.0;

/// How much faster than wall clock the loop is pulled back when it runs
/// ahead, and how far ahead (in seconds) it may get before sleeping.
const AHEAD_FACTOR: f64 = 2.0;
const AHEAD_MAX: f64 = 1.0;

pub(crate) struct EngineCore {
    /// The control mutex. Mutations hold it briefly; the engine loop holds
    /// it for a whole batch of steps.
    state: Mutex<EngineState>,
    vip: VipMutex,
    pub(crate) shared: StepShared,
    pub(crate) settings: EngineSettings,
    paused: AtomicBool,
    running: AtomicBool,
}

struct EngineState {
    modules: Vec<SharedModule>,
    /// Module id → position in `modules`. Rebuilt on every add/remove;
    /// authoritative for expander and cable resolution.
    module_index_by_id: FnvHashMap<i64, usize>,
    cables: Vec<Cable>,
    param_handles: Vec<Arc<ParamHandle>>,
    next_module_id: i64,
    next_cable_id: i64,
    /// The applied sample rate; `settings` may run ahead until the loop's
    /// next reload window.
    sample_rate: f32,
    sample_time: f32,
    /// At most one parameter smooths at a time.
    smooth_module: Option<SharedModule>,
    smooth_param_id: usize,
    smooth_value: f32,
    thread_count: usize,
    real_time: bool,
    workers: Vec<EngineWorker>,
}

/// The rack engine. Owns the module and cable graph, the engine loop
/// thread, and the worker pool.
///
/// Construct with [`Engine::new`], configure via [`Engine::settings`], then
/// [`start`](Engine::start) and eventually [`stop`](Engine::stop). All
/// modules, cables, and param handles must be removed before the engine is
/// dropped.
pub struct Engine {
    core: Arc<EngineCore>,
    loop_thread: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new() -> Self {
        let settings = EngineSettings::new();
        let sample_rate = settings.sample_rate();

        let core = Arc::new(EngineCore {
            state: Mutex::new(EngineState {
                modules: Vec::new(),
                module_index_by_id: FnvHashMap::default(),
                cables: Vec::new(),
                param_handles: Vec::new(),
                next_module_id: 0,
                next_cable_id: 0,
                sample_rate,
                sample_time: 1.0 / sample_rate,
                smooth_module: None,
                smooth_param_id: 0,
                smooth_value: 0.0,
                thread_count: 1,
                real_time: false,
                workers: Vec::new(),
            }),
            vip: VipMutex::new(),
            shared: StepShared::new(sample_rate),
            settings,
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });

        Self { core, loop_thread: None }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.core.settings
    }

    /// Spawns the engine loop thread.
    pub fn start(&mut self) {
        assert!(self.loop_thread.is_none(), "Engine already started");
        self.core.running.store(true, Ordering::SeqCst);

        let core = Arc::clone(&self.core);
        let thread = std::thread::Builder::new()
            .name("modrack-engine".into())
            .spawn(move || {
                platform::with_denormals_flushed(|| engine_loop(&core));
            })
            .expect("failed to spawn engine loop thread");
        self.loop_thread = Some(thread);
        log::info!("Engine started");
    }

    /// Stops the engine loop and joins it. The loop stops and joins all
    /// worker threads on its way out.
    pub fn stop(&mut self) {
        self.core.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.loop_thread.take() {
            if thread.join().is_err() {
                log::error!("Engine loop thread panicked");
            }
        }
        log::info!("Engine stopped");
    }

    /// While paused the loop performs no stepping but still services config
    /// reloads and queued mutations.
    pub fn set_paused(&self, paused: bool) {
        let _vip = self.core.vip.lock();
        let _state = self.core.state.lock().unwrap();
        self.core.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::SeqCst)
    }

    /// The sample rate the step kernel is currently running at.
    pub fn sample_rate(&self) -> f32 {
        self.core.shared.sample_rate()
    }

    pub fn sample_time(&self) -> f32 {
        self.core.shared.sample_time()
    }

    /// Parks all stepping threads on a condvar at their next rendezvous
    /// instead of spinning, until stepping resumes. Call when the host knows
    /// the engine will sit idle (e.g. paused, or the audio callback has gone
    /// away) so spinning workers stop eating whole cores.
    pub fn yield_workers(&self) {
        self.core.shared.engine_barrier.request_yield();
        self.core.shared.worker_barrier.request_yield();
    }

    pub fn module_count(&self) -> usize {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();
        state.modules.len()
    }

    pub fn cable_count(&self) -> usize {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();
        state.cables.len()
    }

    /// Registers a module. Assigns an id if the module has none; a manual id
    /// must not collide with a registered module. Binds any param handles
    /// already targeting the module's id.
    pub fn add_module(&self, module: SharedModule) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();
        let state = &mut *state;

        assert!(
            !state.modules.iter().any(|m| Arc::ptr_eq(m, &module)),
            "Module is already added to the engine"
        );

        let id = {
            let mut m = module.borrow_mut();
            if m.id < 0 {
                m.id = state.next_module_id;
                state.next_module_id += 1;
            } else {
                assert!(
                    !state.module_index_by_id.contains_key(&m.id),
                    "Module id {} is already taken",
                    m.id
                );
                state.next_module_id = state.next_module_id.max(m.id + 1);
            }
            m.id
        };

        state.module_index_by_id.insert(id, state.modules.len());
        state.modules.push(Arc::clone(&module));
        publish_modules(&self.core, state);

        module.borrow_mut().on_add();
        log::debug!("Added module {}", id);

        for handle in &state.param_handles {
            if handle.module_id() == id {
                handle.bind(Some(Arc::clone(&module)));
            }
        }
    }

    /// Unregisters a module. The module must have no cables attached. Param
    /// handles targeting it are unbound (their ids survive), expander links
    /// pointing at it are cleared, and an in-flight smooth on one of its
    /// params is abandoned.
    pub fn remove_module(&self, module: &SharedModule) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();
        let state = &mut *state;

        let position = state
            .modules
            .iter()
            .position(|m| Arc::ptr_eq(m, module))
            .expect("Module is not added to the engine");
        let id = module.borrow().id;

        if let Some(smooth_module) = &state.smooth_module {
            if Arc::ptr_eq(smooth_module, module) {
                state.smooth_module = None;
                state.smooth_param_id = 0;
            }
        }

        for cable in &state.cables {
            assert!(
                cable.output_module != id && cable.input_module != id,
                "Module {} still has cables attached",
                id
            );
        }

        for handle in &state.param_handles {
            if handle.module_id() == id {
                handle.bind(None);
            }
        }

        for other in &state.modules {
            if Arc::ptr_eq(other, module) {
                continue;
            }
            let mut other = other.borrow_mut();
            let other = &mut *other;
            for expander in [&mut other.left_expander, &mut other.right_expander] {
                if expander.module_id == id {
                    expander.module_id = -1;
                    expander.module_index = None;
                }
            }
        }

        module.borrow_mut().on_remove();

        state.modules.remove(position);
        rebuild_module_index(state);
        refresh_cable_indices(state);
        publish_modules(&self.core, state);
        log::debug!("Removed module {}", id);
    }

    pub fn get_module(&self, module_id: i64) -> Option<SharedModule> {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();
        state.module_index_by_id.get(&module_id).map(|&i| Arc::clone(&state.modules[i]))
    }

    pub fn reset_module(&self, module: &SharedModule) {
        let _vip = self.core.vip.lock();
        let _state = self.core.state.lock().unwrap();
        module.borrow_mut().on_reset();
    }

    pub fn randomize_module(&self, module: &SharedModule) {
        let _vip = self.core.vip.lock();
        let _state = self.core.state.lock().unwrap();
        module.borrow_mut().on_randomize();
    }

    /// Bypassing collapses every output to 0 channels (zeroing its voltages)
    /// and clears the CPU-time average; un-bypassing restores mono outputs.
    pub fn bypass_module(&self, module: &SharedModule, bypass: bool) {
        let _vip = self.core.vip.lock();
        let _state = self.core.state.lock().unwrap();
        let mut m = module.borrow_mut();
        if bypass {
            for output in &mut m.outputs {
                output.set_channels(0);
            }
            m.cpu_time = 0.0;
        } else {
            for output in &mut m.outputs {
                output.set_channels(1);
            }
        }
        m.bypass = bypass;
    }

    /// Links (or with `neighbor_id < 0` unlinks) a module's expander slot.
    pub fn set_expander_module(
        &self,
        module: &SharedModule,
        side: ExpanderSide,
        neighbor_id: i64,
    ) {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();
        let mut m = module.borrow_mut();
        let expander = match side {
            ExpanderSide::Left => &mut m.left_expander,
            ExpanderSide::Right => &mut m.right_expander,
        };
        expander.module_id = neighbor_id;
        expander.module_index = if neighbor_id >= 0 {
            state.module_index_by_id.get(&neighbor_id).copied()
        } else {
            None
        };
    }

    /// Registers a cable. Both endpoint modules must be registered, and no
    /// other cable may target the same input port. Returns the cable's id.
    pub fn add_cable(&self, mut cable: Cable) -> i64 {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();
        let state = &mut *state;

        let output_index = *state
            .module_index_by_id
            .get(&cable.output_module)
            .expect("Cable output module is not added to the engine");
        let input_index = *state
            .module_index_by_id
            .get(&cable.input_module)
            .expect("Cable input module is not added to the engine");
        assert!(cable.output_id < state.modules[output_index].borrow().outputs().len());
        assert!(cable.input_id < state.modules[input_index].borrow().inputs().len());

        for other in &state.cables {
            assert!(
                !(other.input_module == cable.input_module && other.input_id == cable.input_id),
                "Input port is already used by cable {}",
                other.id
            );
        }

        if cable.id < 0 {
            cable.id = state.next_cable_id;
            state.next_cable_id += 1;
        } else {
            assert!(
                !state.cables.iter().any(|c| c.id == cable.id),
                "Cable id {} is already taken",
                cable.id
            );
            state.next_cable_id = state.next_cable_id.max(cable.id + 1);
        }

        cable.output_index = output_index;
        cable.input_index = input_index;
        let id = cable.id;
        state.cables.push(cable);
        update_connected(state);
        log::debug!("Added cable {}", id);
        id
    }

    /// Unregisters a cable by id, zeroing the input port it fed.
    pub fn remove_cable(&self, cable_id: i64) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();
        let state = &mut *state;

        let position = state
            .cables
            .iter()
            .position(|c| c.id == cable_id)
            .expect("Cable is not added to the engine");

        let cable = state.cables.remove(position);
        state.modules[cable.input_index].borrow_mut().inputs[cable.input_id].set_channels(0);
        update_connected(state);
        log::debug!("Removed cable {}", cable_id);
    }

    /// Sets a param immediately, cancelling smoothing if this param was the
    /// smoothing target.
    pub fn set_param(&self, module: &SharedModule, param_id: usize, value: f32) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();

        let is_smoothing_target = match &state.smooth_module {
            Some(m) => Arc::ptr_eq(m, module) && state.smooth_param_id == param_id,
            None => false,
        };
        if is_smoothing_target {
            state.smooth_module = None;
            state.smooth_param_id = 0;
        }

        module.borrow_mut().params[param_id].value = value;
    }

    pub fn get_param(&self, module: &SharedModule, param_id: usize) -> f32 {
        let _vip = self.core.vip.lock();
        let _state = self.core.state.lock().unwrap();
        module.borrow().params[param_id].value
    }

    /// Installs `(module, param_id)` as the smoothing target; the param
    /// decays toward `value` one step per sample frame. A previously
    /// smoothing param snaps to its target first so it is not abandoned
    /// mid-curve.
    pub fn set_smooth_param(&self, module: &SharedModule, param_id: usize, value: f32) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();
        let state = &mut *state;

        if let Some(previous) = &state.smooth_module {
            if !(Arc::ptr_eq(previous, module) && state.smooth_param_id == param_id) {
                previous.borrow_mut().params[state.smooth_param_id].value = state.smooth_value;
            }
        }

        state.smooth_param_id = param_id;
        state.smooth_value = value;
        state.smooth_module = Some(Arc::clone(module));
    }

    /// The value the param is heading toward if it is the smoothing target,
    /// else its live value.
    pub fn get_smooth_param(&self, module: &SharedModule, param_id: usize) -> f32 {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();

        if let Some(smooth_module) = &state.smooth_module {
            if Arc::ptr_eq(smooth_module, module) && state.smooth_param_id == param_id {
                return state.smooth_value;
            }
        }
        module.borrow().params[param_id].value
    }

    /// Registers a blank param handle.
    pub fn add_param_handle(&self, handle: Arc<ParamHandle>) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();

        assert!(
            !state.param_handles.iter().any(|h| Arc::ptr_eq(h, &handle)),
            "ParamHandle is already added to the engine"
        );
        assert!(handle.module_id() < 0, "New ParamHandles must be blank");
        state.param_handles.push(handle);
    }

    pub fn remove_param_handle(&self, handle: &Arc<ParamHandle>) {
        let _vip = self.core.vip.lock();
        let mut state = self.core.state.lock().unwrap();

        handle.bind(None);
        let position = state
            .param_handles
            .iter()
            .position(|h| Arc::ptr_eq(h, handle))
            .expect("ParamHandle is not added to the engine");
        state.param_handles.remove(position);
    }

    /// The registered handle targeting `(module_id, param_id)`, if any.
    pub fn get_param_handle(&self, module_id: i64, param_id: usize) -> Option<Arc<ParamHandle>> {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();

        state
            .param_handles
            .iter()
            .find(|h| h.module_id() == module_id && h.param_id() == param_id)
            .map(Arc::clone)
    }

    /// Retargets a handle. With `overwrite`, any other handle on the same
    /// target is reset; without, the incoming handle is reset instead.
    pub fn update_param_handle(
        &self,
        handle: &Arc<ParamHandle>,
        module_id: i64,
        param_id: usize,
        overwrite: bool,
    ) {
        let _vip = self.core.vip.lock();
        let state = self.core.state.lock().unwrap();

        handle.set_target(module_id, param_id);
        handle.bind(None);

        let present = state.param_handles.iter().any(|h| Arc::ptr_eq(h, handle));
        if present && module_id >= 0 {
            for other in &state.param_handles {
                if Arc::ptr_eq(other, handle) {
                    continue;
                }
                if other.module_id() == module_id && other.param_id() == param_id {
                    if overwrite {
                        other.reset();
                    } else {
                        handle.reset();
                    }
                }
            }

            // Rebind unless the handle itself was just reset.
            if let Some(&index) = state.module_index_by_id.get(&handle.module_id()) {
                handle.bind(Some(Arc::clone(&state.modules[index])));
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.loop_thread.is_some() {
            self.stop();
        }

        // Skip the residual-state checks while unwinding: they are contract
        // asserts, not cleanup, and a double panic would abort.
        if std::thread::panicking() {
            return;
        }

        // The host must tear the rack down before dropping the engine.
        let state = match self.core.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert!(state.cables.is_empty(), "Engine dropped with cables still registered");
        assert!(state.modules.is_empty(), "Engine dropped with modules still registered");
        assert!(
            state.param_handles.is_empty(),
            "Engine dropped with param handles still registered"
        );
    }
}

fn publish_modules(core: &EngineCore, state: &EngineState) {
    core.shared.modules.store(Arc::new(state.modules.clone()));
}

fn rebuild_module_index(state: &mut EngineState) {
    state.module_index_by_id.clear();
    for (index, module) in state.modules.iter().enumerate() {
        state.module_index_by_id.insert(module.borrow().id(), index);
    }
}

/// Re-resolves every cable's cached endpoint positions. Callable only while
/// every endpoint id is still registered, which `remove_module`'s no-cables
/// assert guarantees.
fn refresh_cable_indices(state: &mut EngineState) {
    for cable in &mut state.cables {
        cable.output_index = state.module_index_by_id[&cable.output_module];
        cable.input_index = state.module_index_by_id[&cable.input_module];
    }
}

/// Recomputes every port's `active` flag from the cable list.
fn update_connected(state: &mut EngineState) {
    for module in &state.modules {
        let mut m = module.borrow_mut();
        for input in &mut m.inputs {
            input.active = false;
        }
        for output in &mut m.outputs {
            output.active = false;
        }
    }
    for cable in &state.cables {
        state.modules[cable.output_index].borrow_mut().outputs[cable.output_id].active = true;
        state.modules[cable.input_index].borrow_mut().inputs[cable.input_id].active = true;
    }
}

/// Re-resolves every module's expander links against the module index. Runs
/// under the control mutex before each step batch.
fn resolve_expanders(state: &mut EngineState) {
    for module in &state.modules {
        let mut m = module.borrow_mut();
        let m = &mut *m;
        for expander in [&mut m.left_expander, &mut m.right_expander] {
            if expander.module_id >= 0 {
                expander.module_index = state.module_index_by_id.get(&expander.module_id).copied();
            } else {
                expander.module_index = None;
            }
        }
    }
}

/// Advances the whole graph by one sample frame.
fn step(core: &EngineCore, state: &mut EngineState) {
    // Param smoothing: one exponential step toward the target, snapping once
    // float granularity stalls the decay.
    if let Some(module) = state.smooth_module.clone() {
        let mut m = module.borrow_mut();
        let param = &mut m.params[state.smooth_param_id];
        let value = param.value;
        let new_value = value + (state.smooth_value - value) * SMOOTH_LAMBDA * state.sample_time;
        if new_value == value {
            param.value = state.smooth_value;
            drop(m);
            state.smooth_module = None;
            state.smooth_param_id = 0;
        } else {
            param.value = new_value;
        }
    }

    // Step modules along with the workers.
    core.shared.module_index.store(0, Ordering::SeqCst);
    core.shared.engine_barrier.wait();
    worker::step_modules(core, 0);
    core.shared.worker_barrier.wait();

    // Propagate cables in insertion order.
    for cable in &state.cables {
        if cable.output_index == cable.input_index {
            let mut m = state.modules[cable.output_index].borrow_mut();
            let (channels, voltages) = m.outputs[cable.output_id].read();
            m.inputs[cable.input_id].write_from(channels, &voltages);
        } else {
            let (channels, voltages) =
                state.modules[cable.output_index].borrow().outputs[cable.output_id].read();
            state.modules[cable.input_index].borrow_mut().inputs[cable.input_id]
                .write_from(channels, &voltages);
        }
    }

    // Deliver expander messages requested this frame: the producer buffer
    // trades places with the facing consumer buffer on the neighbor, which
    // reads it next frame.
    for i in 0..state.modules.len() {
        flip_expander_message(state, i, ExpanderSide::Left);
        flip_expander_message(state, i, ExpanderSide::Right);
    }
}

fn flip_expander_message(state: &mut EngineState, index: usize, side: ExpanderSide) {
    let requested = {
        let m = state.modules[index].borrow();
        match side {
            ExpanderSide::Left => m.left_expander.message_flip_requested,
            ExpanderSide::Right => m.right_expander.message_flip_requested,
        }
    };
    if !requested {
        return;
    }

    let mut m = state.modules[index].borrow_mut();
    let expander = match side {
        ExpanderSide::Left => &mut m.left_expander,
        ExpanderSide::Right => &mut m.right_expander,
    };
    expander.message_flip_requested = false;

    match expander.module_index {
        Some(neighbor) if neighbor != index => {
            let mut n = state.modules[neighbor].borrow_mut();
            let facing = match side {
                ExpanderSide::Left => &mut n.right_expander,
                ExpanderSide::Right => &mut n.left_expander,
            };
            std::mem::swap(&mut expander.producer_message, &mut facing.consumer_message);
        }
        // No resolved neighbor: the message has nowhere to go.
        _ => {}
    }
}

/// Stops, joins, and respawns the worker pool for the current thread count,
/// and reapplies the loop thread's scheduling priority. Must run between
/// step batches, while every stepping thread is parked at the engine
/// barrier.
fn relaunch_workers(core: &Arc<EngineCore>, state: &mut EngineState) {
    assert!(state.thread_count >= 1);
    log::info!(
        "Relaunching engine workers: thread_count = {}, real_time = {}",
        state.thread_count,
        state.real_time
    );

    // Flag all workers, then release the engine barrier once so they observe
    // the flag and exit.
    for worker in &state.workers {
        worker.stop();
    }
    core.shared.engine_barrier.wait();
    for worker in &mut state.workers {
        worker.join();
    }
    state.workers.clear();

    platform::set_thread_real_time(state.real_time);

    // Safe to retotal: no thread is inside either barrier now.
    core.shared.engine_barrier.set_total(state.thread_count);
    core.shared.worker_barrier.set_total(state.thread_count);

    for id in 1..state.thread_count {
        state.workers.push(EngineWorker::start(id, Arc::clone(core), state.real_time));
    }
}

fn engine_loop(core: &Arc<EngineCore>) {
    // Seconds of audio the loop has produced beyond wall-clock time.
    let mut ahead_time = 0.0f64;
    let mut last_time = Instant::now();

    while core.running.load(Ordering::SeqCst) {
        // Park here whenever an external caller holds a VIP guard, so queued
        // mutations get the control mutex before the next batch.
        core.vip.wait();

        let step_time;
        {
            let mut state = core.state.lock().unwrap();
            let state = &mut *state;

            let sample_rate = core.settings.sample_rate();
            if state.sample_rate != sample_rate {
                log::info!("Engine sample rate changed to {} Hz", sample_rate);
                state.sample_rate = sample_rate;
                state.sample_time = 1.0 / sample_rate;
                core.shared.publish_sample_rate(state.sample_rate, state.sample_time);
                for module in &state.modules {
                    module.borrow_mut().on_sample_rate_change(sample_rate);
                }
                ahead_time = 0.0;
            }

            let thread_count = core.settings.thread_count();
            let real_time = core.settings.real_time();
            if state.thread_count != thread_count || state.real_time != real_time {
                state.thread_count = thread_count;
                state.real_time = real_time;
                relaunch_workers(core, state);
            }

            if !core.paused.load(Ordering::SeqCst) {
                resolve_expanders(state);
                for _ in 0..MUTEX_STEPS {
                    step(core, state);
                }
            }

            step_time = MUTEX_STEPS as f64 * state.sample_time as f64;
        }

        // Pull the clock back toward wall time at AHEAD_FACTOR, and sleep a
        // batch once more than AHEAD_MAX seconds ahead, so the loop does not
        // peg a core when nothing downstream blocks it.
        ahead_time += step_time;
        let now = Instant::now();
        ahead_time -= AHEAD_FACTOR * now.duration_since(last_time).as_secs_f64();
        last_time = now;
        ahead_time = ahead_time.max(0.0);
        if ahead_time > AHEAD_MAX {
            std::thread::sleep(Duration::from_secs_f64(step_time));
        }
    }

    // Teardown: shrink to a single stepping thread, which stops and joins
    // all workers.
    let mut state = core.state.lock().unwrap();
    state.thread_count = 1;
    relaunch_workers(core, &mut state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleDsp, ModuleIo, ProcessArgs};

    struct NullDsp;

    impl ModuleDsp for NullDsp {
        fn process(&mut self, _args: &ProcessArgs, _io: &mut ModuleIo<'_>) {}
    }

    fn test_module(num_params: usize, num_inputs: usize, num_outputs: usize) -> SharedModule {
        Module::new(num_params, num_inputs, num_outputs, Box::new(NullDsp)).into_shared()
    }

    fn drain(engine: &Engine) {
        // Tear the rack down so Drop's residual-state asserts pass.
        while let Some(module) = {
            let state = engine.core.state.lock().unwrap();
            state.modules.first().cloned()
        } {
            engine.remove_module(&module);
        }
    }

    #[test]
    fn module_ids_are_unique_and_monotonic() {
        let engine = Engine::new();
        let a = test_module(0, 0, 0);
        let b = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        engine.add_module(Arc::clone(&b));
        assert_eq!(a.borrow().id(), 0);
        assert_eq!(b.borrow().id(), 1);

        // A manual id bumps the allocator past itself.
        let c = Module::new(0, 0, 0, Box::new(NullDsp)).with_id(10).into_shared();
        engine.add_module(Arc::clone(&c));
        let d = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&d));
        assert_eq!(d.borrow().id(), 11);

        drain(&engine);
    }

    #[test]
    fn remove_returns_engine_to_prior_state() {
        let engine = Engine::new();
        let a = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        assert_eq!(engine.module_count(), 1);
        engine.remove_module(&a);
        assert_eq!(engine.module_count(), 0);
        assert!(engine.get_module(0).is_none());

        // Id counters do not decrement.
        let b = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&b));
        assert_eq!(b.borrow().id(), 1);
        drain(&engine);
    }

    #[test]
    #[should_panic(expected = "already added")]
    fn double_add_panics() {
        let engine = Engine::new();
        let a = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        engine.add_module(Arc::clone(&a));
    }

    #[test]
    #[should_panic(expected = "already taken")]
    fn duplicate_manual_id_panics() {
        let engine = Engine::new();
        let a = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        let b = Module::new(0, 0, 0, Box::new(NullDsp)).with_id(0).into_shared();
        engine.add_module(b);
    }

    #[test]
    fn bypass_round_trip_restores_outputs() {
        let engine = Engine::new();
        let m = test_module(0, 0, 2);
        engine.add_module(Arc::clone(&m));
        m.borrow_mut().outputs[0].set_voltage(0, 5.0);

        engine.bypass_module(&m, true);
        {
            let m = m.borrow();
            assert!(m.bypassed());
            for output in m.outputs() {
                assert_eq!(output.channels(), 0);
                assert_eq!(output.voltage(0), 0.0);
            }
            assert_eq!(m.cpu_time(), 0.0);
        }

        engine.bypass_module(&m, false);
        {
            let m = m.borrow();
            assert!(!m.bypassed());
            for output in m.outputs() {
                assert_eq!(output.channels(), 1);
            }
        }
        drain(&engine);
    }

    #[test]
    fn cable_add_remove_refreshes_port_state() {
        let engine = Engine::new();
        let source = test_module(0, 0, 1);
        let sink = test_module(0, 1, 0);
        engine.add_module(Arc::clone(&source));
        engine.add_module(Arc::clone(&sink));

        let source_id = source.borrow().id();
        let sink_id = sink.borrow().id();
        let cable_id = engine.add_cable(Cable::new(source_id, 0, sink_id, 0));
        assert!(source.borrow().outputs()[0].is_active());
        assert!(sink.borrow().inputs()[0].is_active());

        engine.remove_cable(cable_id);
        assert!(!source.borrow().outputs()[0].is_active());
        assert!(!sink.borrow().inputs()[0].is_active());
        assert_eq!(sink.borrow().inputs()[0].channels(), 0);
        drain(&engine);
    }

    #[test]
    #[should_panic(expected = "already used")]
    fn duplicate_input_endpoint_panics() {
        let engine = Engine::new();
        let source = test_module(0, 0, 1);
        let sink = test_module(0, 1, 0);
        engine.add_module(Arc::clone(&source));
        engine.add_module(Arc::clone(&sink));
        let source_id = source.borrow().id();
        let sink_id = sink.borrow().id();
        engine.add_cable(Cable::new(source_id, 0, sink_id, 0));
        engine.add_cable(Cable::new(source_id, 0, sink_id, 0));
    }

    #[test]
    #[should_panic(expected = "cables attached")]
    fn remove_module_with_cable_panics() {
        let engine = Engine::new();
        let source = test_module(0, 0, 1);
        let sink = test_module(0, 1, 0);
        engine.add_module(Arc::clone(&source));
        engine.add_module(Arc::clone(&sink));
        let source_id = source.borrow().id();
        let sink_id = sink.borrow().id();
        engine.add_cable(Cable::new(source_id, 0, sink_id, 0));
        engine.remove_module(&source);
    }

    #[test]
    fn remove_module_clears_expander_links_and_smoothing() {
        let engine = Engine::new();
        let a = test_module(1, 0, 0);
        let b = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        engine.add_module(Arc::clone(&b));

        engine.set_expander_module(&b, ExpanderSide::Left, a.borrow().id());
        assert!(b.borrow().left_expander().connected());

        engine.set_smooth_param(&a, 0, 1.0);
        engine.remove_module(&a);

        let b_ref = b.borrow();
        assert_eq!(b_ref.left_expander().module_id(), -1);
        assert!(!b_ref.left_expander().connected());
        drop(b_ref);

        {
            let state = engine.core.state.lock().unwrap();
            assert!(state.smooth_module.is_none());
        }
        drain(&engine);
    }

    #[test]
    fn set_param_cancels_smoothing_of_same_param() {
        let engine = Engine::new();
        let m = test_module(2, 0, 0);
        engine.add_module(Arc::clone(&m));

        engine.set_smooth_param(&m, 0, 1.0);
        assert_eq!(engine.get_smooth_param(&m, 0), 1.0);
        // The live value has not moved; only the target is installed.
        assert_eq!(engine.get_param(&m, 0), 0.0);

        engine.set_param(&m, 0, 0.25);
        {
            let state = engine.core.state.lock().unwrap();
            assert!(state.smooth_module.is_none());
        }
        assert_eq!(engine.get_param(&m, 0), 0.25);
        assert_eq!(engine.get_smooth_param(&m, 0), 0.25);
        drain(&engine);
    }

    #[test]
    fn retargeting_smoothing_snaps_previous_param() {
        let engine = Engine::new();
        let m = test_module(2, 0, 0);
        engine.add_module(Arc::clone(&m));

        engine.set_smooth_param(&m, 0, 1.0);
        engine.set_smooth_param(&m, 1, 0.5);
        // Param 0 was abandoned mid-curve and must land on its target.
        assert_eq!(engine.get_param(&m, 0), 1.0);
        assert_eq!(engine.get_smooth_param(&m, 1), 0.5);
        drain(&engine);
    }

    #[test]
    fn param_handles_rebind_and_overwrite() {
        let engine = Engine::new();
        let m = test_module(1, 0, 0);
        engine.add_module(Arc::clone(&m));
        let id = m.borrow().id();

        let h1 = Arc::new(ParamHandle::new());
        let h2 = Arc::new(ParamHandle::new());
        engine.add_param_handle(Arc::clone(&h1));
        engine.add_param_handle(Arc::clone(&h2));

        engine.update_param_handle(&h1, id, 0, true);
        assert!(h1.module().is_some());

        // Overwrite steals the target from h1.
        engine.update_param_handle(&h2, id, 0, true);
        assert_eq!(h1.module_id(), -1);
        assert!(h1.module().is_none());
        assert_eq!(h2.module_id(), id);
        assert!(h2.module().is_some());

        // Without overwrite, the incoming handle loses instead.
        engine.update_param_handle(&h1, id, 0, false);
        assert_eq!(h1.module_id(), -1);
        assert_eq!(h2.module_id(), id);

        assert!(engine.get_param_handle(id, 0).is_some());

        // Removing the module unbinds but keeps the ids; re-adding rebinds.
        engine.remove_module(&m);
        assert!(h2.module().is_none());
        assert_eq!(h2.module_id(), id);
        let m2 = Module::new(1, 0, 0, Box::new(NullDsp)).with_id(id).into_shared();
        engine.add_module(Arc::clone(&m2));
        assert!(h2.module().is_some());

        engine.remove_param_handle(&h1);
        engine.remove_param_handle(&h2);
        drain(&engine);
    }

    #[test]
    fn expander_resolution_follows_registration() {
        let engine = Engine::new();
        let a = test_module(0, 0, 0);
        let b = test_module(0, 0, 0);
        engine.add_module(Arc::clone(&a));
        engine.add_module(Arc::clone(&b));

        // Linking to an id that is not registered resolves to nothing.
        engine.set_expander_module(&a, ExpanderSide::Right, 99);
        assert_eq!(a.borrow().right_expander().module_id(), 99);
        assert!(!a.borrow().right_expander().connected());

        engine.set_expander_module(&a, ExpanderSide::Right, b.borrow().id());
        assert!(a.borrow().right_expander().connected());

        engine.set_expander_module(&a, ExpanderSide::Right, -1);
        assert_eq!(a.borrow().right_expander().module_id(), -1);
        assert!(!a.borrow().right_expander().connected());
        drain(&engine);
    }
}
