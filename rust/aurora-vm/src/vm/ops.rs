//! Stack primitives: arithmetic, comparison, logic, lists and output.

use super::{Process, VmError};
use crate::heap::HeapObject;
use crate::runtime::OutputSink;
use crate::values::Value;
use aurora_compiler::compiler::ail::Opcode;

impl Process {
    /// Apply a primitive opcode to the operand stack. Does not move the
    /// program counter.
    pub(crate) fn operate(&mut self, opcode: Opcode, sink: &mut dyn OutputSink) -> Result<(), VmError> {
        match opcode {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Ge
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Lt => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = numeric(opcode, number(opcode, &a)?, number(opcode, &b)?)?;
                self.push(result);
            }
            Opcode::Eqn => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = self.values_equal(&a, &b);
                self.push(Value::Boolean(equal));
            }
            Opcode::And | Opcode::Or => {
                let b = self.pop()?.is_truthy();
                let a = self.pop()?.is_truthy();
                self.push(Value::Boolean(if opcode == Opcode::And { a && b } else { a || b }));
            }
            Opcode::Not => {
                let a = self.pop()?;
                self.push(Value::Boolean(!a.is_truthy()));
            }
            Opcode::Car => {
                let list = self.pop()?;
                let head = self.list_items(opcode, &list)?.first().cloned();
                self.push(head.ok_or_else(|| VmError::TypeError("car of an empty list".into()))?);
            }
            Opcode::Cdr => {
                let list = self.pop()?;
                let items = self.list_items(opcode, &list)?;
                let Some((_, rest)) = items.split_first() else {
                    return Err(VmError::TypeError("cdr of an empty list".into()));
                };
                let rest = rest.to_vec();
                let handle = self.heap.allocate(HeapObject::List(rest), self.current);
                self.push(Value::Handle(handle));
            }
            Opcode::Cons => {
                let list = self.pop()?;
                let head = self.pop()?;
                let mut items = Vec::with_capacity(self.list_items(opcode, &list)?.len() + 1);
                items.push(head);
                items.extend_from_slice(self.list_items(opcode, &list)?);
                let handle = self.heap.allocate(HeapObject::List(items), self.current);
                self.push(Value::Handle(handle));
            }
            Opcode::Display => {
                let value = self.pop()?;
                sink.write_str(&self.heap.display_value(&value));
            }
            Opcode::Newline => sink.write_str("\n"),
            other => {
                return Err(VmError::InvalidProgram(format!("{} is not a stack primitive", other)));
            }
        }
        Ok(())
    }

    fn list_items(&self, opcode: Opcode, value: &Value) -> Result<&[Value], VmError> {
        let not_a_list = || VmError::TypeError(format!("{} expects a list, got {}", opcode, value.type_name()));
        let handle = value.as_handle().ok_or_else(not_a_list)?;
        match self.heap.get(handle) {
            Some(HeapObject::List(items)) => Ok(items),
            Some(_) => Err(not_a_list()),
            None => Err(VmError::InvalidHandle(handle)),
        }
    }

    /// Numbers by value, strings and lists by content, everything else by
    /// identity.
    pub(crate) fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Handle(x), Value::Handle(y)) if x == y => true,
            (Value::Handle(x), Value::Handle(y)) => match (self.heap.get(*x), self.heap.get(*y)) {
                (Some(HeapObject::Str(s)), Some(HeapObject::Str(t))) => s == t,
                (Some(HeapObject::List(l)), Some(HeapObject::List(m))) => {
                    l.len() == m.len() && l.iter().zip(m).all(|(p, q)| self.values_equal(p, q))
                }
                _ => false,
            },
            _ => a == b,
        }
    }
}

fn number(opcode: Opcode, value: &Value) -> Result<f64, VmError> {
    value
        .as_number()
        .ok_or_else(|| VmError::TypeError(format!("{} expects numbers, got {} {}", opcode, value.type_name(), value)))
}

fn numeric(opcode: Opcode, a: f64, b: f64) -> Result<Value, VmError> {
    Ok(match opcode {
        Opcode::Add => Value::Number(a + b),
        Opcode::Sub => Value::Number(a - b),
        Opcode::Mul => Value::Number(a * b),
        Opcode::Div | Opcode::Mod => {
            if b.abs() < f64::EPSILON {
                return Err(VmError::ArithmeticError(format!("{} by zero", opcode)));
            }
            Value::Number(if opcode == Opcode::Div { a / b } else { a % b })
        }
        Opcode::Pow => Value::Number(a.powf(b)),
        Opcode::Ge => Value::Boolean(a >= b),
        Opcode::Le => Value::Boolean(a <= b),
        Opcode::Gt => Value::Boolean(a > b),
        Opcode::Lt => Value::Boolean(a < b),
        other => return Err(VmError::InvalidProgram(format!("{} is not numeric", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::NativeRegistry;
    use crate::runtime::{BufferSink, RuntimeConfig};
    use aurora_compiler::compiler::ail::Program;
    use std::sync::Arc;

    fn process() -> Process {
        Process::new(1, Arc::new(Program::default()), RuntimeConfig::default(), Arc::new(NativeRegistry::new()))
            .unwrap()
    }

    fn apply(p: &mut Process, opcode: Opcode, args: &[Value]) -> Result<Value, VmError> {
        for a in args {
            p.push(a.clone());
        }
        p.operate(opcode, &mut BufferSink::new())?;
        p.pop()
    }

    #[test]
    fn test_operand_order() {
        let mut p = process();
        assert_eq!(apply(&mut p, Opcode::Sub, &[Value::Number(10.0), Value::Number(3.0)]).unwrap(), Value::Number(7.0));
        assert_eq!(apply(&mut p, Opcode::Lt, &[Value::Number(1.0), Value::Number(2.0)]).unwrap(), Value::Boolean(true));
        assert_eq!(apply(&mut p, Opcode::Pow, &[Value::Number(2.0), Value::Number(10.0)]).unwrap(), Value::Number(1024.0));
    }

    #[test]
    fn test_division_by_zero() {
        let mut p = process();
        let err = apply(&mut p, Opcode::Div, &[Value::Number(1.0), Value::Number(0.0)]).unwrap_err();
        assert!(matches!(err, VmError::ArithmeticError(_)));
        let err = apply(&mut p, Opcode::Mod, &[Value::Number(1.0), Value::Number(0.0)]).unwrap_err();
        assert!(matches!(err, VmError::ArithmeticError(_)));
    }

    #[test]
    fn test_type_mismatch() {
        let mut p = process();
        let err = apply(&mut p, Opcode::Add, &[Value::Number(1.0), Value::Boolean(true)]).unwrap_err();
        assert!(matches!(err, VmError::TypeError(_)));
    }

    #[test]
    fn test_list_primitives() {
        let mut p = process();
        let empty = p.heap.allocate(HeapObject::List(vec![]), None);
        let one = apply(&mut p, Opcode::Cons, &[Value::Number(2.0), Value::Handle(empty)]).unwrap();
        let two = apply(&mut p, Opcode::Cons, &[Value::Number(1.0), one.clone()]).unwrap();
        assert_eq!(p.display_value(&two), "(1 2)");
        assert_eq!(apply(&mut p, Opcode::Car, &[two.clone()]).unwrap(), Value::Number(1.0));
        let rest = apply(&mut p, Opcode::Cdr, &[two]).unwrap();
        assert!(p.values_equal(&rest, &one));
        assert!(matches!(apply(&mut p, Opcode::Car, &[Value::Handle(empty)]), Err(VmError::TypeError(_))));
        assert!(matches!(apply(&mut p, Opcode::Cdr, &[Value::Number(1.0)]), Err(VmError::TypeError(_))));
    }

    #[test]
    fn test_string_equality_by_content() {
        let mut p = process();
        let a = p.new_string("abc");
        let b = p.new_string("abc");
        let c = p.new_string("abd");
        assert!(p.values_equal(&a, &b));
        assert!(!p.values_equal(&a, &c));
        assert!(p.values_equal(&Value::Symbol("x".into()), &Value::Symbol("x".into())));
    }

    #[test]
    fn test_display_writes_to_sink() {
        let mut p = process();
        let mut sink = BufferSink::new();
        let s = p.new_string("hi");
        p.push(s);
        p.operate(Opcode::Display, &mut sink).unwrap();
        p.operate(Opcode::Newline, &mut sink).unwrap();
        assert_eq!(sink.contents(), "hi\n");
    }
}
