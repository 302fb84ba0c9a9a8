/// A directed connection carrying voltages from one module's output port to
/// another module's input port, evaluated once per sample after all modules
/// have processed.
///
/// Endpoints are module ids; the engine resolves and caches list positions
/// when the cable is added and keeps them fresh across module removals.
pub struct Cable {
    pub(crate) id: i64,
    pub(crate) output_module: i64,
    pub(crate) output_id: usize,
    pub(crate) input_module: i64,
    pub(crate) input_id: usize,
    pub(crate) output_index: usize,
    pub(crate) input_index: usize,
}

impl Cable {
    /// Creates a cable with an unassigned id (-1). The engine assigns one
    /// when the cable is added.
    pub fn new(output_module: i64, output_id: usize, input_module: i64, input_id: usize) -> Self {
        Self {
            id: -1,
            output_module,
            output_id,
            input_module,
            input_id,
            output_index: 0,
            input_index: 0,
        }
    }

    /// Pre-assigns an id, e.g. when restoring a patch.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn output_module(&self) -> i64 {
        self.output_module
    }

    pub fn output_id(&self) -> usize {
        self.output_id
    }

    pub fn input_module(&self) -> i64 {
        self.input_module
    }

    pub fn input_id(&self) -> usize {
        self.input_id
    }
}
