use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::module::SharedModule;

/// An external token referencing a `(module id, param id)` pair, e.g. a MIDI
/// mapping. The engine keeps the cached module binding in sync as modules
/// come and go; the ids survive the target module being absent so the handle
/// can rebind if a module with the same id is added again.
pub struct ParamHandle {
    module_id: AtomicI64,
    param_id: AtomicUsize,
    module: Mutex<Option<SharedModule>>,
}

impl ParamHandle {
    /// Creates a blank handle targeting nothing (`module_id() == -1`).
    pub fn new() -> Self {
        Self { module_id: AtomicI64::new(-1), param_id: AtomicUsize::new(0), module: Mutex::new(None) }
    }

    pub fn module_id(&self) -> i64 {
        self.module_id.load(Ordering::SeqCst)
    }

    pub fn param_id(&self) -> usize {
        self.param_id.load(Ordering::SeqCst)
    }

    /// The module this handle is currently bound to, if its target is
    /// registered with the engine.
    pub fn module(&self) -> Option<SharedModule> {
        self.module.lock().unwrap().clone()
    }

    /// Clears the handle's target.
    pub fn reset(&self) {
        self.set_target(-1, 0);
        self.bind(None);
    }

    pub(crate) fn set_target(&self, module_id: i64, param_id: usize) {
        self.module_id.store(module_id, Ordering::SeqCst);
        self.param_id.store(param_id, Ordering::SeqCst);
    }

    pub(crate) fn bind(&self, module: Option<SharedModule>) {
        *self.module.lock().unwrap() = module;
    }
}

impl Default for ParamHandle {
    fn default() -> Self {
        Self::new()
    }
}
