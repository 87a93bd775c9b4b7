//! First-class continuations for `call/cc`.
//!
//! A continuation is a structural copy of the process registers at the
//! point of capture. The closure it refers to is shared, not copied, so
//! variables changed after the capture stay changed when it is resumed.

use super::{Process, StackFrame, VmError};
use crate::heap::HeapObject;
use crate::values::Value;
use aurora_compiler::compiler::ast::Handle;

#[derive(Debug, Clone)]
pub struct Continuation {
    pub closure: Option<Handle>,
    pub operand_stack: Vec<Value>,
    pub call_stack: Vec<StackFrame>,
    /// Where execution picks up: the label right after the `call/cc` call.
    pub resume_label: String,
}

impl Process {
    /// `capturecc k`: snapshot the registers and bind the continuation to
    /// `k`, which also names the resume label.
    pub(crate) fn capture_continuation(&mut self, name: &str) -> Result<(), VmError> {
        let continuation = Continuation {
            closure: self.current,
            operand_stack: self.operand_stack.clone(),
            call_stack: self.call_stack.clone(),
            resume_label: name.to_string(),
        };
        let handle = self.heap.allocate(HeapObject::Continuation(continuation), self.current);
        self.store(name, Value::Handle(handle))?;
        self.step();
        Ok(())
    }

    /// Invoke a continuation with the value on top of the stack. Can be
    /// done any number of times.
    pub(crate) fn resume_continuation(&mut self, k: Continuation) -> Result<(), VmError> {
        let value = self.pop()?;
        let address = self
            .labels
            .get(&k.resume_label)
            .ok_or_else(|| VmError::UndefinedLabel(k.resume_label.clone()))?;
        self.operand_stack = k.operand_stack;
        self.call_stack = k.call_stack;
        self.current = k.closure;
        self.push(value);
        self.pc = address;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::natives::NativeRegistry;
    use crate::runtime::{BufferSink, RuntimeConfig};
    use crate::vm::{Process, ProcessState};
    use aurora_compiler::compiler::ail::Program;
    use std::sync::Arc;

    #[test]
    fn test_escape_skips_rest_of_thunk() {
        // (display (call/cc (lambda (k) (k 1) 2)))
        let text = "call @&0\nhalt\n\
                    @&0\ncapturecc _c\nload _c\ncall @&1\n@_c\ndisplay\npush #f\nreturn\n\
                    @&1\nstore k\npush 1\ncall k\npop\npush 2\nreturn\n";
        let program = Program::from_ail_text(text).unwrap();
        let mut p =
            Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(NativeRegistry::new())).unwrap();
        let mut sink = BufferSink::new();
        while !p.state().is_terminated() {
            p.execute(&mut sink).unwrap();
        }
        assert_eq!(sink.contents(), "1");
        assert_eq!(p.state(), ProcessState::Stopped);
        // only the entry lambda's return value is left
        assert_eq!(p.operand_stack(), &[crate::values::Value::Boolean(false)]);
    }
}
