use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lazygrad::backend::spec::{
    BackendResult, Function, Instruction, PortableBackend, Program, ProgramBuilder, TensorLiteral,
    ValueId,
};

/// Test-only wrapper that forwards to a real backend while counting submissions and keeping
/// the latest program.
pub struct RecordingBackend<B: PortableBackend> {
    inner: Arc<B>,
    runs: AtomicUsize,
    last_program: Mutex<Option<Program>>,
}

impl<B: PortableBackend> RecordingBackend<B> {
    pub fn new(inner: Arc<B>) -> Self {
        RecordingBackend {
            inner,
            runs: AtomicUsize::new(0),
            last_program: Mutex::new(None),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn recorded_program(&self) -> Option<Program> {
        self.last_program
            .lock()
            .expect("backend mutex poisoned")
            .clone()
    }

    pub fn recorded_entry_function_or_panic(&self) -> Function {
        let program = self
            .recorded_program()
            .expect("backend should record emitted program");
        program
            .entry_function()
            .expect("captured function present")
            .clone()
    }
}

impl<B: PortableBackend> PortableBackend for RecordingBackend<B> {
    type TensorHandle = B::TensorHandle;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        self.inner.execute_instruction(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_program.lock().expect("backend mutex poisoned") = Some(program.clone());
        self.inner.run_program(program, entry_inputs)
    }

    fn gradients(
        &self,
        builder: &mut ProgramBuilder,
        of: ValueId,
        wrt: &[ValueId],
    ) -> BackendResult<HashMap<ValueId, ValueId>> {
        self.inner.gradients(builder, of, wrt)
    }
}
