//! A real-time audio engine for a modular-synthesis rack.
//!
//! The engine owns a graph of signal-processing modules connected by cables
//! and advances it one sample at a time on a pool of cooperating threads,
//! pacing itself against wall-clock time. Modules, cables, and parameter
//! mappings can be added, removed, and reconfigured from any thread while
//! the engine runs; mutations are interleaved with processing at batch
//! boundaries with bounded latency.

mod cable;
mod engine;
mod module;
mod param_handle;
mod platform;
mod port;
mod settings;

pub use cable::Cable;
pub use engine::Engine;
pub use module::{
    Expander, ExpanderSide, Module, ModuleDsp, ModuleIo, Param, ProcessArgs, SharedModule,
};
pub use param_handle::ParamHandle;
pub use platform::{logical_core_count, set_thread_real_time};
pub use port::{Port, PORT_MAX_CHANNELS};
pub use settings::EngineSettings;
