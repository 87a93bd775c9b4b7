//! Closures: a code address plus the environment it runs in.

use crate::values::Value;
use aurora_compiler::compiler::ast::Handle;
use std::collections::{HashMap, HashSet};

/// One closure object, and also one activation of a procedure.
///
/// `bound` holds the variables this closure defines (parameters and inner
/// `define`s). `free` is a flattened snapshot of the environment it was
/// created in. A variable written through `set!` is marked dirty so readers
/// holding an older snapshot can tell the binding has moved on.
#[derive(Debug, Clone, Default)]
pub struct Closure {
    pub label: String,
    pub address: usize,
    pub parent: Option<Handle>,
    pub bound: HashMap<String, Value>,
    pub free: HashMap<String, Value>,
    pub dirty: HashSet<String>,
}

impl Closure {
    pub fn new(label: &str, address: usize, parent: Option<Handle>, free: HashMap<String, Value>) -> Self {
        Self { label: label.to_string(), address, parent, free, ..Self::default() }
    }

    /// Bind a variable here. Rebinding to a different value marks it dirty.
    pub fn bind(&mut self, name: &str, value: Value) {
        if let Some(old) = self.bound.insert(name.to_string(), value) {
            if self.bound.get(name) != Some(&old) {
                self.dirty.insert(name.to_string());
            }
        }
    }

    pub fn set_bound(&mut self, name: &str, value: Value) {
        self.bound.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
    }

    pub fn set_free(&mut self, name: &str, value: Value) {
        self.free.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    /// Flattened copy of everything visible here; bound names shadow free ones.
    pub fn environment(&self) -> HashMap<String, Value> {
        let mut env = self.free.clone();
        env.extend(self.bound.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Every value this closure keeps alive.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.bound.values().chain(self.free.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_bind_is_clean() {
        let mut c = Closure::new("&1", 4, None, HashMap::new());
        c.bind("&1.x", Value::Number(1.0));
        assert!(!c.is_dirty("&1.x"));
        c.bind("&1.x", Value::Number(1.0));
        assert!(!c.is_dirty("&1.x"));
        c.bind("&1.x", Value::Number(2.0));
        assert!(c.is_dirty("&1.x"));
    }

    #[test]
    fn test_environment_prefers_bound() {
        let mut free = HashMap::new();
        free.insert("a".to_string(), Value::Number(1.0));
        free.insert("b".to_string(), Value::Number(2.0));
        let mut c = Closure::new("&1", 0, None, free);
        c.bind("a", Value::Number(10.0));
        let env = c.environment();
        assert_eq!(env["a"], Value::Number(10.0));
        assert_eq!(env["b"], Value::Number(2.0));
    }
}
