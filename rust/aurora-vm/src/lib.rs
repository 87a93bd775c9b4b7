//! Aurora VM: process virtual machine for AIL bytecode.

pub mod closure;
pub mod heap;
pub mod natives;
pub mod runtime;
pub mod values;
pub mod vm;

pub use natives::{NativeError, NativeFunction, NativeRegistry};
pub use runtime::{run_program, BufferSink, OutputSink, RunReport, Runtime, RuntimeConfig, StdoutSink};
pub use values::Value;
pub use vm::{Process, ProcessState, VmError};
