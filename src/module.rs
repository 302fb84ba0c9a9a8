use atomic_refcell::AtomicRefCell;
use std::any::Any;
use std::sync::Arc;

use crate::port::Port;

/// A module shared between the mutation API, the engine loop, and the worker
/// threads. The engine's stepping protocol guarantees exclusive access during
/// `process`; the `AtomicRefCell` turns any violation of that protocol into a
/// panic instead of undefined behavior.
pub type SharedModule = Arc<AtomicRefCell<Module>>;

/// A single automatable value owned by a module.
#[derive(Clone, Copy, Debug, Default)]
pub struct Param {
    pub value: f32,
}

/// Per-sample timing handed to [`ModuleDsp::process`].
#[derive(Clone, Copy, Debug)]
pub struct ProcessArgs {
    pub sample_rate: f32,
    pub sample_time: f32,
}

/// Which neighbor slot of a module an expander link refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpanderSide {
    Left,
    Right,
}

/// A link to an adjacent module, carrying double-buffered opaque messages.
///
/// A module writes into its own `producer_message` during `process` and calls
/// [`request_message_flip`](Expander::request_message_flip). At the end of the
/// frame the engine hands the buffer across to the neighbor's facing
/// expander, where the neighbor finds it in `consumer_message` on the next
/// frame. No per-frame allocation or locking is involved; the two buffers
/// simply trade places.
pub struct Expander {
    pub(crate) module_id: i64,
    /// Resolved position of the neighbor in the engine's module list. Kept
    /// fresh by the engine before every step batch.
    pub(crate) module_index: Option<usize>,
    pub producer_message: Option<Box<dyn Any + Send + Sync>>,
    pub consumer_message: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) message_flip_requested: bool,
}

impl Expander {
    fn new() -> Self {
        Self {
            module_id: -1,
            module_index: None,
            producer_message: None,
            consumer_message: None,
            message_flip_requested: false,
        }
    }

    /// The id of the linked module, or -1 if no module is linked.
    pub fn module_id(&self) -> i64 {
        self.module_id
    }

    /// Whether the linked module is currently registered with the engine.
    pub fn connected(&self) -> bool {
        self.module_index.is_some()
    }

    /// Asks the engine to deliver `producer_message` to the neighbor at the
    /// end of the current frame.
    pub fn request_message_flip(&mut self) {
        self.message_flip_requested = true;
    }
}

/// Everything a module may touch while one of its hooks runs: its own
/// params, ports, and expander links. Modules never see the engine or other
/// modules directly.
pub struct ModuleIo<'a> {
    pub params: &'a mut [Param],
    pub inputs: &'a mut [Port],
    pub outputs: &'a mut [Port],
    pub left_expander: &'a mut Expander,
    pub right_expander: &'a mut Expander,
}

/// The DSP payload of a module.
///
/// `process` runs once per sample on whichever engine thread picked the
/// module up, so it must be real-time safe: no allocation, no locking, no
/// blocking, and no calls back into the engine. Hooks always run with
/// exclusive access to the module; `Sync` is required because modules live
/// in checked shared cells that hop between threads.
pub trait ModuleDsp: Send + Sync {
    fn process(&mut self, args: &ProcessArgs, io: &mut ModuleIo<'_>);

    fn on_add(&mut self, _io: &mut ModuleIo<'_>) {}
    fn on_remove(&mut self, _io: &mut ModuleIo<'_>) {}
    fn on_reset(&mut self, _io: &mut ModuleIo<'_>) {}
    fn on_randomize(&mut self, _io: &mut ModuleIo<'_>) {}
    fn on_sample_rate_change(&mut self, _sample_rate: f32, _io: &mut ModuleIo<'_>) {}
}

/// A rack module: engine-owned bookkeeping plus the collaborator DSP.
pub struct Module {
    pub(crate) id: i64,
    pub(crate) bypass: bool,
    /// Exponential moving average of `process` wall time in seconds, updated
    /// only while the CPU meter is enabled.
    pub(crate) cpu_time: f32,
    pub(crate) params: Vec<Param>,
    pub(crate) inputs: Vec<Port>,
    pub(crate) outputs: Vec<Port>,
    pub(crate) left_expander: Expander,
    pub(crate) right_expander: Expander,
    dsp: Box<dyn ModuleDsp>,
}

impl Module {
    /// Creates a module with the given port/param counts and DSP payload.
    /// The id is unassigned (-1) until the module is added to an engine.
    pub fn new(
        num_params: usize,
        num_inputs: usize,
        num_outputs: usize,
        dsp: Box<dyn ModuleDsp>,
    ) -> Self {
        Self {
            id: -1,
            bypass: false,
            cpu_time: 0.0,
            params: vec![Param::default(); num_params],
            inputs: vec![Port::new(); num_inputs],
            outputs: vec![Port::new(); num_outputs],
            left_expander: Expander::new(),
            right_expander: Expander::new(),
            dsp,
        }
    }

    /// Pre-assigns an id, e.g. when restoring a patch. The engine asserts
    /// that manual ids do not collide.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn into_shared(self) -> SharedModule {
        Arc::new(AtomicRefCell::new(self))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn bypassed(&self) -> bool {
        self.bypass
    }

    pub fn cpu_time(&self) -> f32 {
        self.cpu_time
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    pub fn left_expander(&self) -> &Expander {
        &self.left_expander
    }

    pub fn right_expander(&self) -> &Expander {
        &self.right_expander
    }

    pub fn left_expander_mut(&mut self) -> &mut Expander {
        &mut self.left_expander
    }

    pub fn right_expander_mut(&mut self) -> &mut Expander {
        &mut self.right_expander
    }

    /// Lends the module's own state to a DSP hook.
    fn with_io<R>(&mut self, f: impl FnOnce(&mut dyn ModuleDsp, &mut ModuleIo<'_>) -> R) -> R {
        let mut io = ModuleIo {
            params: &mut self.params,
            inputs: &mut self.inputs,
            outputs: &mut self.outputs,
            left_expander: &mut self.left_expander,
            right_expander: &mut self.right_expander,
        };
        f(self.dsp.as_mut(), &mut io)
    }

    pub(crate) fn process(&mut self, args: &ProcessArgs) {
        self.with_io(|dsp, io| dsp.process(args, io));
    }

    pub(crate) fn on_add(&mut self) {
        self.with_io(|dsp, io| dsp.on_add(io));
    }

    pub(crate) fn on_remove(&mut self) {
        self.with_io(|dsp, io| dsp.on_remove(io));
    }

    pub(crate) fn on_reset(&mut self) {
        self.with_io(|dsp, io| dsp.on_reset(io));
    }

    pub(crate) fn on_randomize(&mut self) {
        self.with_io(|dsp, io| dsp.on_randomize(io));
    }

    pub(crate) fn on_sample_rate_change(&mut self, sample_rate: f32) {
        self.with_io(|dsp, io| dsp.on_sample_rate_change(sample_rate, io));
    }
}
