//! Process VM: executes one AIL program against its own heap.

pub mod continuations;
mod env;
mod ops;

pub use continuations::Continuation;

use crate::closure::Closure;
use crate::heap::{Heap, HeapObject};
use crate::natives::{AsyncJob, NativeContext, NativeError, NativeOutput, NativeRegistry, NativeResult};
use crate::runtime::{OutputSink, RuntimeConfig};
use crate::values::Value;
use aurora_compiler::compiler::ail::{Argument, Instruction, LabelTable, Opcode, Program};
use aurora_compiler::compiler::ast::Handle;
use aurora_compiler::{FsSources, ModuleLoader, SourceProvider};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unbound variable: {0}")]
    UnboundVariable(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("arithmetic error: {0}")]
    ArithmeticError(String),
    #[error("native I/O error: {0}")]
    NativeIo(String),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
    #[error("undefined label @{0}")]
    UndefinedLabel(String),
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),
    #[error("fork failed: {0}")]
    Fork(String),
    #[error("invalid program: {0}")]
    InvalidProgram(String),
    #[error("program counter {0} is out of range")]
    ProgramCounterOutOfRange(usize),
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error("{source} (in @{label} at instruction {pc})")]
    At { label: String, pc: usize, source: Box<VmError> },
}

impl VmError {
    /// Attach the closure label and instruction index. Already-located
    /// errors are returned unchanged.
    pub fn with_context(self, label: &str, pc: usize) -> Self {
        match self {
            located @ VmError::At { .. } => located,
            other => VmError::At { label: label.to_string(), pc, source: Box::new(other) },
        }
    }

    /// The error without location wrappers.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::At { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Waiting for an asynchronous native call to complete.
    Sleeping,
    /// Yielded by `pause`; resumes on its next tick.
    Suspended,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn is_terminated(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub closure: Option<Handle>,
    pub return_address: usize,
}

pub struct Process {
    pid: u64,
    program: Arc<Program>,
    labels: Arc<LabelTable>,
    pc: usize,
    operand_stack: Vec<Value>,
    call_stack: Vec<StackFrame>,
    current: Option<Handle>,
    heap: Heap,
    state: ProcessState,
    steps: u64,
    peak_call_depth: usize,
    config: RuntimeConfig,
    natives: Arc<NativeRegistry>,
    spawned: Vec<Process>,
    pending: Option<AsyncJob>,
    next_gc: usize,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("pc", &self.pc)
            .field("state", &self.state)
            .field("steps", &self.steps)
            .field("stack_depth", &self.operand_stack.len())
            .field("call_depth", &self.call_stack.len())
            .finish()
    }
}

impl Process {
    pub fn new(
        pid: u64,
        program: Arc<Program>,
        config: RuntimeConfig,
        natives: Arc<NativeRegistry>,
    ) -> Result<Self, VmError> {
        let labels = LabelTable::analyse(&program.instructions)
            .map_err(|e| VmError::InvalidProgram(e.to_string()))?;
        let heap = Heap::with_statics(&program.statics);
        let next_gc = config.gc_threshold.unwrap_or(usize::MAX);
        Ok(Self {
            pid,
            program,
            labels: Arc::new(labels),
            pc: 0,
            operand_stack: Vec::new(),
            call_stack: Vec::new(),
            current: None,
            heap,
            state: ProcessState::Running,
            steps: 0,
            peak_call_depth: 0,
            config,
            natives,
            spawned: Vec::new(),
            pending: None,
            next_gc,
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: u64) {
        self.pid = pid;
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn fail(&mut self) {
        self.state = ProcessState::Failed;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn peak_call_depth(&self) -> usize {
        self.peak_call_depth
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn operand_stack(&self) -> &[Value] {
        &self.operand_stack
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Children created by `fork` since the last call.
    pub fn take_spawned(&mut self) -> Vec<Process> {
        std::mem::take(&mut self.spawned)
    }

    /// The async native job the process is sleeping on, if any.
    pub fn take_pending(&mut self) -> Option<AsyncJob> {
        self.pending.take()
    }

    // ── Heap helpers for native functions ──

    /// String content of a value that refers to a heap string.
    pub fn string_value(&self, value: &Value) -> Option<&str> {
        self.heap.string(value.as_handle()?)
    }

    pub fn new_string(&mut self, content: impl Into<String>) -> Value {
        Value::Handle(self.heap.allocate(HeapObject::Str(content.into()), self.current))
    }

    pub fn display_value(&self, value: &Value) -> String {
        self.heap.display_value(value)
    }

    /// Run a full collection now. Returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots: Vec<Handle> = self
            .operand_stack
            .iter()
            .filter_map(Value::as_handle)
            .chain(self.call_stack.iter().filter_map(|f| f.closure))
            .chain(self.current)
            .collect();
        let freed = self.heap.collect(roots);
        debug!(pid = self.pid, freed, live = self.heap.dynamic_count(), "garbage collected");
        freed
    }

    fn maybe_collect(&mut self) {
        let Some(threshold) = self.config.gc_threshold else { return };
        if self.heap.dynamic_count() > self.next_gc {
            self.collect_garbage();
            self.next_gc = threshold.max(self.heap.dynamic_count() * 2);
        }
    }

    // ── Execution ──

    /// Execute exactly one instruction.
    pub fn execute(&mut self, sink: &mut dyn OutputSink) -> Result<(), VmError> {
        match self.state {
            ProcessState::Running => {}
            ProcessState::Suspended => self.state = ProcessState::Running,
            _ => return Ok(()),
        }
        if let Some(limit) = self.config.max_steps {
            if self.steps >= limit {
                self.state = ProcessState::Failed;
                return Err(VmError::InstructionLimitExceeded(limit));
            }
        }

        let pc = self.pc;
        let program = Arc::clone(&self.program);
        let Some(inst) = program.instructions.get(pc) else {
            self.state = ProcessState::Failed;
            return Err(VmError::ProgramCounterOutOfRange(pc));
        };
        self.steps += 1;
        if self.config.trace_instructions {
            trace!(pid = self.pid, pc, instruction = %inst, "exec");
        }

        if let Err(err) = self.dispatch(inst, sink) {
            self.state = ProcessState::Failed;
            return Err(err.with_context(&self.current_label(), pc));
        }
        self.peak_call_depth = self.peak_call_depth.max(self.call_stack.len());
        self.maybe_collect();
        Ok(())
    }

    fn current_label(&self) -> String {
        self.current
            .and_then(|h| self.heap.closure(h))
            .map(|c| c.label.clone())
            .unwrap_or_else(|| "<entry>".to_string())
    }

    fn dispatch(&mut self, inst: &Instruction, sink: &mut dyn OutputSink) -> Result<(), VmError> {
        let (opcode, argument) = match inst {
            Instruction::Comment { .. } | Instruction::Label { .. } => {
                self.step();
                return Ok(());
            }
            Instruction::Op { opcode, argument } => (*opcode, argument.as_ref()),
        };

        match opcode {
            Opcode::Store => {
                let name = variable(opcode, argument)?;
                let value = self.pop()?;
                self.store(name, value)?;
                self.step();
            }
            Opcode::Load | Opcode::Push => {
                let value = match argument {
                    Some(Argument::Variable(name)) => self.dereference(name)?,
                    Some(arg) => Value::from_argument(arg).ok_or_else(|| missing(opcode))?,
                    None => return Err(missing(opcode)),
                };
                // a label pushed by `define` stays a label until it is loaded
                let value = match (opcode, value) {
                    (Opcode::Load, Value::Label(label)) => Value::Handle(self.make_closure(&label)?),
                    (_, v) => v,
                };
                self.push(value);
                self.step();
            }
            Opcode::LoadClosure => {
                let label = label(opcode, argument)?;
                let handle = self.make_closure(label)?;
                self.push(Value::Handle(handle));
                self.step();
            }
            Opcode::Pop => {
                self.pop()?;
                self.step();
            }
            Opcode::Swap => {
                let len = self.operand_stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow);
                }
                self.operand_stack.swap(len - 1, len - 2);
                self.step();
            }
            Opcode::Set => {
                let name = variable(opcode, argument)?;
                // the target may live in another closure, so close over
                // the environment the lambda was written in right now
                let value = match self.pop()? {
                    Value::Label(label) => Value::Handle(self.make_closure(&label)?),
                    other => other,
                };
                self.set_variable(name, value)?;
                self.step();
            }
            Opcode::Call | Opcode::TailCall => {
                let target = argument.ok_or_else(|| missing(opcode))?;
                self.call(target, opcode == Opcode::TailCall, sink)?;
            }
            Opcode::Return => self.do_return()?,
            Opcode::CaptureCc => {
                let name = variable(opcode, argument)?;
                self.capture_continuation(name)?;
            }
            Opcode::IfTrue | Opcode::IfFalse => {
                let target = label(opcode, argument)?;
                let cond = self.pop()?;
                if cond.is_truthy() == (opcode == Opcode::IfTrue) {
                    self.jump(target)?;
                } else {
                    self.step();
                }
            }
            Opcode::Goto => {
                let target = label(opcode, argument)?;
                self.jump(target)?;
            }
            Opcode::Fork => {
                let handle = match argument {
                    Some(Argument::Handle(h)) => *h,
                    _ => return Err(VmError::TypeError("fork expects a handle argument".into())),
                };
                self.fork(handle)?;
                self.step();
            }
            Opcode::Nop => self.step(),
            Opcode::Pause => {
                self.state = ProcessState::Suspended;
                self.step();
            }
            Opcode::Halt => self.state = ProcessState::Stopped,
            primitive => {
                self.operate(primitive, sink)?;
                self.step();
            }
        }
        Ok(())
    }

    // ── Registers and stacks ──

    fn step(&mut self) {
        self.pc += 1;
    }

    fn jump(&mut self, label: &str) -> Result<(), VmError> {
        self.pc = self.labels.get(label).ok_or_else(|| VmError::UndefinedLabel(label.to_string()))?;
        Ok(())
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.operand_stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, VmError> {
        self.operand_stack.pop().ok_or(VmError::StackUnderflow)
    }

    // ── Calls ──

    fn call(&mut self, target: &Argument, tail: bool, sink: &mut dyn OutputSink) -> Result<(), VmError> {
        let value = match target {
            Argument::Variable(name) => {
                if let Some((library, function)) = self.native_target(name) {
                    return self.call_native(&library, &function, tail);
                }
                self.dereference(name)?
            }
            other => Value::from_argument(other)
                .ok_or_else(|| VmError::TypeError(format!("{} is not callable", other)))?,
        };

        match value {
            Value::Label(label) => {
                let activation = self.make_closure(&label)?;
                self.enter(activation, tail);
                Ok(())
            }
            Value::Keyword(keyword) => {
                let opcode = Opcode::for_primitive(&keyword)
                    .ok_or_else(|| VmError::TypeError(format!("{} is not callable", keyword)))?;
                self.operate(opcode, sink)?;
                if matches!(opcode, Opcode::Display | Opcode::Newline) {
                    self.push(Value::Boolean(false));
                }
                self.finish_call(tail)
            }
            Value::Handle(handle) => match self.heap.get(handle) {
                Some(HeapObject::Closure(closure)) => {
                    let activation = Closure::new(&closure.label, closure.address, Some(handle), closure.environment());
                    let activation = self.heap.allocate(HeapObject::Closure(activation), self.current);
                    self.enter(activation, tail);
                    Ok(())
                }
                Some(HeapObject::Continuation(k)) => {
                    let k = k.clone();
                    self.resume_continuation(k)
                }
                Some(other) => Err(VmError::TypeError(format!("{} is not callable", other.type_name()))),
                None => Err(VmError::InvalidHandle(handle)),
            },
            other => Err(VmError::TypeError(format!("{} {} is not callable", other.type_name(), other))),
        }
    }

    fn enter(&mut self, activation: Handle, tail: bool) {
        if !tail {
            self.call_stack.push(StackFrame { closure: self.current, return_address: self.pc + 1 });
        }
        let address = self.heap.closure(activation).map(|c| c.address).unwrap_or(self.pc);
        self.current = Some(activation);
        self.pc = address;
    }

    /// After a primitive or native produced its value: a call continues
    /// with the next instruction, a tail call returns from the caller.
    fn finish_call(&mut self, tail: bool) -> Result<(), VmError> {
        if tail {
            self.do_return()
        } else {
            self.step();
            Ok(())
        }
    }

    fn do_return(&mut self) -> Result<(), VmError> {
        match self.call_stack.pop() {
            Some(frame) => {
                self.current = frame.closure;
                self.pc = frame.return_address;
            }
            None => self.state = ProcessState::Stopped,
        }
        Ok(())
    }

    /// `Lib.fn` where `Lib` is declared with `native` and registered.
    fn native_target(&self, name: &str) -> Option<(String, String)> {
        let (library, function) = name.split_once('.')?;
        if !self.program.natives.contains(library) {
            return None;
        }
        self.natives.lookup(library, function)?;
        Some((library.to_string(), function.to_string()))
    }

    fn call_native(&mut self, library: &str, function: &str, tail: bool) -> Result<(), VmError> {
        let natives = Arc::clone(&self.natives);
        let native = natives
            .lookup(library, function)
            .ok_or_else(|| NativeError::Unknown(format!("{}.{}", library, function)))?;
        let mut args = Vec::with_capacity(native.arity());
        for _ in 0..native.arity() {
            args.push(self.pop()?);
        }
        args.reverse();

        let ctx = NativeContext { pid: self.pid, library, function };
        let result = native.invoke(args, self, &ctx).map_err(|e| match e {
            NativeError::Io(message) => VmError::NativeIo(message),
            other => VmError::Native(other),
        })?;
        match result {
            NativeResult::Value(value) => {
                self.push(value);
                self.finish_call(tail)
            }
            NativeResult::Pending(job) => {
                if !tail {
                    self.call_stack.push(StackFrame { closure: self.current, return_address: self.pc + 1 });
                }
                debug!(pid = self.pid, native = %format!("{}.{}", library, function), "sleeping on native call");
                self.pending = Some(job);
                self.state = ProcessState::Sleeping;
                Ok(())
            }
        }
    }

    /// Deliver the result of an asynchronous native call and wake up.
    pub fn complete_native(&mut self, result: Result<NativeOutput, NativeError>) -> Result<(), VmError> {
        let value = match result {
            Ok(NativeOutput::Number(n)) => Value::Number(n),
            Ok(NativeOutput::Boolean(b)) => Value::Boolean(b),
            Ok(NativeOutput::Text(text)) => self.new_string(text),
            Ok(NativeOutput::Nothing) => Value::Boolean(false),
            Err(err) => {
                tracing::error!(pid = self.pid, error = %err, "native call failed");
                Value::Boolean(false)
            }
        };
        self.push(value);
        self.do_return()?;
        if self.state == ProcessState::Sleeping {
            self.state = ProcessState::Running;
        }
        Ok(())
    }

    // ── Fork ──

    fn fork(&mut self, handle: Handle) -> Result<(), VmError> {
        let program = match self.heap.get(handle) {
            Some(HeapObject::List(_)) => {
                let source = self
                    .heap
                    .render_source(&Value::Handle(handle))
                    .ok_or_else(|| VmError::Fork("quoted code has no source form".into()))?;
                aurora_compiler::compile(&source).map_err(|e| VmError::Fork(e.to_string()))?
            }
            Some(HeapObject::Str(path)) => {
                let loader = ModuleLoader::new(FsSources::new(self.config.search_path.clone()));
                let resolved = loader
                    .provider()
                    .resolve(Path::new(""), path)
                    .unwrap_or_else(|| Path::new(path).to_path_buf());
                loader.load(&resolved).map_err(|e| VmError::Fork(e.to_string()))?.program
            }
            Some(other) => return Err(VmError::TypeError(format!("cannot fork a {}", other.type_name()))),
            None => return Err(VmError::InvalidHandle(handle)),
        };
        let child = Process::new(0, Arc::new(program), self.config.clone(), Arc::clone(&self.natives))?;
        debug!(parent = self.pid, "forked child process");
        self.spawned.push(child);
        Ok(())
    }
}

fn missing(opcode: Opcode) -> VmError {
    VmError::InvalidProgram(format!("{} is missing its argument", opcode))
}

fn variable(opcode: Opcode, argument: Option<&Argument>) -> Result<&str, VmError> {
    match argument {
        Some(Argument::Variable(name)) => Ok(name),
        Some(other) => Err(VmError::InvalidProgram(format!("{} expects a variable, got {}", opcode, other))),
        None => Err(missing(opcode)),
    }
}

fn label(opcode: Opcode, argument: Option<&Argument>) -> Result<&str, VmError> {
    match argument {
        Some(Argument::Label(name)) => Ok(name),
        Some(other) => Err(VmError::InvalidProgram(format!("{} expects a label, got {}", opcode, other))),
        None => Err(missing(opcode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BufferSink;

    fn process(text: &str) -> Process {
        let program = Program::from_ail_text(text).unwrap();
        Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(NativeRegistry::with_builtins()))
            .unwrap()
    }

    fn run(p: &mut Process, sink: &mut BufferSink) -> Result<(), VmError> {
        while !p.state().is_terminated() {
            p.execute(sink)?;
        }
        Ok(())
    }

    #[test]
    fn test_store_load_display() {
        let mut p = process("call @&0\nhalt\n@&0\npush 41\nstore x\nload x\npush 1\nadd\ndisplay\npush #f\nreturn\n");
        let mut sink = BufferSink::new();
        run(&mut p, &mut sink).unwrap();
        assert_eq!(sink.contents(), "42");
        assert_eq!(p.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_errors_carry_location() {
        let mut p = process("call @&0\nhalt\n@&0\nload nowhere\nreturn\n");
        let err = run(&mut p, &mut BufferSink::new()).unwrap_err();
        match &err {
            VmError::At { label, pc, .. } => {
                assert_eq!(label, "&0");
                assert_eq!(*pc, 3);
            }
            other => panic!("expected located error, got {:?}", other),
        }
        assert!(matches!(err.root(), VmError::UnboundVariable(name) if name == "nowhere"));
        assert_eq!(p.state(), ProcessState::Failed);
    }

    #[test]
    fn test_pause_yields_once() {
        let mut p = process("pause\nnop\nhalt\n");
        let mut sink = BufferSink::new();
        p.execute(&mut sink).unwrap();
        assert_eq!(p.state(), ProcessState::Suspended);
        p.execute(&mut sink).unwrap();
        assert_eq!(p.state(), ProcessState::Running);
        p.execute(&mut sink).unwrap();
        assert_eq!(p.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_pop_on_empty_stack_underflows() {
        let mut p = process("pop\n");
        let err = p.execute(&mut BufferSink::new()).unwrap_err();
        assert!(matches!(err.root(), VmError::StackUnderflow));
    }

    #[test]
    fn test_goto_to_missing_label() {
        let mut p = process("goto @nowhere\n");
        let err = p.execute(&mut BufferSink::new()).unwrap_err();
        assert!(matches!(err.root(), VmError::UndefinedLabel(l) if l == "nowhere"));
    }

    #[test]
    fn test_duplicate_labels_rejected_at_load() {
        let program = Program::from_ail_text("@a\n@a\n").unwrap();
        let err = Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(NativeRegistry::new()))
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidProgram(_)));
    }

    struct FailingIo;

    impl crate::natives::NativeFunction for FailingIo {
        fn arity(&self) -> usize {
            0
        }

        fn invoke(&self, _: Vec<Value>, _: &mut Process, _: &NativeContext) -> Result<NativeResult, NativeError> {
            Err(NativeError::Io("disk on fire".into()))
        }
    }

    #[test]
    fn test_sync_native_io_error_is_reported() {
        let mut program = Program::from_ail_text("call Disk.spin\nhalt\n").unwrap();
        program.natives.insert("Disk".into());
        let mut registry = NativeRegistry::new();
        registry.register("Disk", crate::natives::NativeLibrary::new().with("spin", FailingIo));
        let mut p = Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(registry)).unwrap();
        let err = p.execute(&mut BufferSink::new()).unwrap_err();
        assert!(matches!(err.root(), VmError::NativeIo(m) if m == "disk on fire"));
    }

    #[test]
    fn test_keyword_call_applies_primitive() {
        let mut p = process("push 3\npush 4\ncall +\ndisplay\nhalt\n");
        let mut sink = BufferSink::new();
        run(&mut p, &mut sink).unwrap();
        assert_eq!(sink.contents(), "7");
    }
}
