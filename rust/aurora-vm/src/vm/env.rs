//! Variable lookup and closure creation.
//!
//! A closure sees its own bindings first, then the snapshot of its creation
//! environment. The snapshot can go stale when an enclosing binding is
//! changed with `set!`, so lookups also consult the nearest ancestor that
//! binds the name and let a dirty ancestor binding win.

use super::{Process, VmError};
use crate::closure::Closure;
use crate::heap::HeapObject;
use crate::values::Value;
use aurora_compiler::compiler::ast::Handle;
use std::collections::HashMap;

impl Process {
    fn closure_ref(&self, handle: Handle) -> Result<&Closure, VmError> {
        self.heap.closure(handle).ok_or(VmError::InvalidHandle(handle))
    }

    fn closure_mut(&mut self, handle: Handle) -> Result<&mut Closure, VmError> {
        self.heap.closure_mut(handle).ok_or(VmError::InvalidHandle(handle))
    }

    /// Nearest closure from `start` upwards whose own bindings include `name`.
    fn binding_ancestor(&self, start: Option<Handle>, name: &str) -> Option<Handle> {
        let mut cursor = start;
        while let Some(handle) = cursor {
            let closure = self.heap.closure(handle)?;
            if closure.bound.contains_key(name) {
                return Some(handle);
            }
            cursor = closure.parent;
        }
        None
    }

    pub(crate) fn dereference(&self, name: &str) -> Result<Value, VmError> {
        let unbound = || VmError::UnboundVariable(name.to_string());
        let current = self.closure_ref(self.current.ok_or_else(unbound)?)?;
        if let Some(value) = current.bound.get(name) {
            return Ok(value.clone());
        }

        let local = current.free.get(name);
        let ancestor = self
            .binding_ancestor(current.parent, name)
            .and_then(|h| self.heap.closure(h))
            .and_then(|c| c.bound.get(name).map(|v| (v, c.is_dirty(name))));

        match (local, ancestor) {
            (Some(local), Some((theirs, dirty))) => {
                if local != theirs && dirty {
                    Ok(theirs.clone())
                } else {
                    Ok(local.clone())
                }
            }
            (Some(local), None) => Ok(local.clone()),
            (None, Some((theirs, _))) => Ok(theirs.clone()),
            (None, None) => Err(unbound()),
        }
    }

    /// `define`: bind in the current closure.
    pub(crate) fn store(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let current = self
            .current
            .ok_or_else(|| VmError::InvalidProgram(format!("store of {} outside any closure", name)))?;
        self.closure_mut(current)?.bind(name, value);
        Ok(())
    }

    /// `set!`: update an existing binding and mark it dirty.
    pub(crate) fn set_variable(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let unbound = || VmError::UnboundVariable(name.to_string());
        let current = self.current.ok_or_else(unbound)?;

        let closure = self.closure_mut(current)?;
        if closure.bound.contains_key(name) {
            closure.set_bound(name, value);
            return Ok(());
        }
        let mut found = false;
        if closure.free.contains_key(name) {
            closure.set_free(name, value.clone());
            found = true;
        }
        let parent = closure.parent;

        if let Some(ancestor) = self.binding_ancestor(parent, name) {
            self.closure_mut(ancestor)?.set_bound(name, value);
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(unbound())
        }
    }

    /// The closure a new closure for `label` should hang off: the innermost
    /// live activation of its lexically enclosing lambda, found by walking up
    /// from the current closure. Blocks with no recorded enclosing lambda
    /// (the entry lambda, call trampolines) hang off the current closure.
    fn lexical_parent(&self, label: &str) -> Result<Option<Handle>, VmError> {
        let Some(enclosing) = self.program.enclosing.get(label) else {
            return Ok(self.current);
        };
        let mut cursor = self.current;
        while let Some(handle) = cursor {
            let closure = self.closure_ref(handle)?;
            if closure.label == *enclosing {
                return Ok(Some(handle));
            }
            cursor = closure.parent;
        }
        Err(VmError::InvalidProgram(format!(
            "no live activation of @{} to close @{} over",
            enclosing, label
        )))
    }

    /// Allocate a closure for the code at `label`, capturing a flattened
    /// copy of its parent's environment.
    pub(crate) fn make_closure(&mut self, label: &str) -> Result<Handle, VmError> {
        let address = self.labels.get(label).ok_or_else(|| VmError::UndefinedLabel(label.to_string()))?;
        let parent = self.lexical_parent(label)?;
        let free = match parent {
            Some(handle) => self.closure_ref(handle)?.environment(),
            None => HashMap::new(),
        };
        let closure = Closure::new(label, address, parent, free);
        Ok(self.heap.allocate(HeapObject::Closure(closure), self.current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::NativeRegistry;
    use crate::runtime::RuntimeConfig;
    use aurora_compiler::compiler::ail::Program;
    use std::sync::Arc;

    fn process() -> Process {
        let program = Program::from_ail_text("@outer\nreturn\n@inner\nreturn\n").unwrap();
        Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(NativeRegistry::new())).unwrap()
    }

    /// outer binds `x`; inner captured it as a snapshot.
    fn nested(p: &mut Process) -> (Handle, Handle) {
        let outer = p.make_closure("outer").unwrap();
        p.current = Some(outer);
        p.store("x", Value::Number(1.0)).unwrap();
        let inner = p.make_closure("inner").unwrap();
        p.current = Some(inner);
        (outer, inner)
    }

    #[test]
    fn test_snapshot_visible_in_inner() {
        let mut p = process();
        let (_, inner) = nested(&mut p);
        assert_eq!(p.heap.closure(inner).unwrap().free["x"], Value::Number(1.0));
        assert_eq!(p.dereference("x").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_dirty_ancestor_wins_over_stale_snapshot() {
        let mut p = process();
        let (outer, _) = nested(&mut p);
        p.heap.closure_mut(outer).unwrap().set_bound("x", Value::Number(2.0));
        assert_eq!(p.dereference("x").unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_clean_ancestor_loses_to_snapshot() {
        let mut p = process();
        let (outer, _) = nested(&mut p);
        // a plain rebinding to the same value keeps the flag clear
        p.heap.closure_mut(outer).unwrap().bind("x", Value::Number(1.0));
        p.heap.closure_mut(outer).unwrap().bound.insert("x".into(), Value::Number(5.0));
        assert_eq!(p.dereference("x").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_set_updates_snapshot_and_ancestor() {
        let mut p = process();
        let (outer, inner) = nested(&mut p);
        p.set_variable("x", Value::Number(9.0)).unwrap();
        assert_eq!(p.heap.closure(inner).unwrap().free["x"], Value::Number(9.0));
        assert_eq!(p.heap.closure(outer).unwrap().bound["x"], Value::Number(9.0));
        assert!(p.heap.closure(outer).unwrap().is_dirty("x"));
    }

    #[test]
    fn test_unbound_errors() {
        let mut p = process();
        nested(&mut p);
        assert!(matches!(p.dereference("y"), Err(VmError::UnboundVariable(n)) if n == "y"));
        assert!(matches!(p.set_variable("y", Value::Number(0.0)), Err(VmError::UnboundVariable(_))));
    }

    #[test]
    fn test_closing_outside_enclosing_activation_fails() {
        let mut program = Program::from_ail_text("@outer\nreturn\n@inner\nreturn\n@other\nreturn\n").unwrap();
        program.enclosing.insert("inner".into(), "outer".into());
        let mut p =
            Process::new(1, Arc::new(program), RuntimeConfig::default(), Arc::new(NativeRegistry::new())).unwrap();
        let other = p.make_closure("other").unwrap();
        p.current = Some(other);
        assert!(matches!(p.make_closure("inner"), Err(VmError::InvalidProgram(_))));

        let outer = p.make_closure("outer").unwrap();
        p.current = Some(outer);
        let inner = p.make_closure("inner").unwrap();
        assert_eq!(p.heap.closure(inner).unwrap().parent, Some(outer));
    }

    #[test]
    fn test_unknown_label() {
        let mut p = process();
        assert!(matches!(p.make_closure("nope"), Err(VmError::UndefinedLabel(_))));
    }
}
