//! Handle-indexed object store with mark-and-sweep collection.
//!
//! Static objects from the compiled program sit at the handles the compiler
//! gave them and are never collected. Everything allocated at run time goes
//! after them (or into a slot freed by a previous collection).

use crate::closure::Closure;
use crate::values::Value;
use crate::vm::continuations::Continuation;
use aurora_compiler::compiler::ail::StaticObject;
use aurora_compiler::compiler::ast::{format_number, Handle};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum HeapObject {
    Str(String),
    List(Vec<Value>),
    Closure(Closure),
    Continuation(Continuation),
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "string",
            HeapObject::List(_) => "list",
            HeapObject::Closure(_) => "closure",
            HeapObject::Continuation(_) => "continuation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    Live,
    Marked,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub is_static: bool,
    pub read_only: bool,
    pub status: ObjectStatus,
    /// The closure that was current when the object was allocated.
    pub referrer: Option<Handle>,
}

#[derive(Debug, Clone)]
struct Slot {
    object: HeapObject,
    meta: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    dynamic: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap holding a program's static objects at their compiled handles.
    pub fn with_statics(statics: &BTreeMap<Handle, StaticObject>) -> Self {
        let mut heap = Self::new();
        for (handle, object) in statics {
            let object = match object {
                StaticObject::Str(s) => HeapObject::Str(s.clone()),
                StaticObject::List(items) => HeapObject::List(items.iter().filter_map(Value::from_argument).collect()),
            };
            if heap.slots.len() <= handle.0 {
                heap.slots.resize_with(handle.0 + 1, || None);
            }
            heap.slots[handle.0] = Some(Slot {
                object,
                meta: Metadata { is_static: true, read_only: true, status: ObjectStatus::Live, referrer: None },
            });
        }
        heap
    }

    pub fn allocate(&mut self, object: HeapObject, referrer: Option<Handle>) -> Handle {
        let slot = Slot {
            object,
            meta: Metadata { is_static: false, read_only: false, status: ObjectStatus::Live, referrer },
        };
        self.dynamic += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                Handle(index)
            }
            None => {
                self.slots.push(Some(slot));
                Handle(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&HeapObject> {
        self.slots.get(handle.0)?.as_ref().map(|s| &s.object)
    }

    /// Mutable access; read-only objects refuse.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(handle.0)?.as_mut()?;
        if slot.meta.read_only {
            return None;
        }
        Some(&mut slot.object)
    }

    pub fn metadata(&self, handle: Handle) -> Option<&Metadata> {
        self.slots.get(handle.0)?.as_ref().map(|s| &s.meta)
    }

    pub fn closure(&self, handle: Handle) -> Option<&Closure> {
        match self.get(handle)? {
            HeapObject::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn closure_mut(&mut self, handle: Handle) -> Option<&mut Closure> {
        match self.get_mut(handle)? {
            HeapObject::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn string(&self, handle: Handle) -> Option<&str> {
        match self.get(handle)? {
            HeapObject::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn list(&self, handle: Handle) -> Option<&[Value]> {
        match self.get(handle)? {
            HeapObject::List(items) => Some(items),
            _ => None,
        }
    }

    /// Number of live objects allocated at run time.
    pub fn dynamic_count(&self) -> usize {
        self.dynamic
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // ── Printing ──

    /// The text `display` prints for a value.
    pub fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Handle(h) => match self.get(*h) {
                Some(HeapObject::Str(s)) => s.clone(),
                Some(HeapObject::List(items)) => {
                    let parts: Vec<String> = items.iter().map(|v| self.display_value(v)).collect();
                    format!("({})", parts.join(" "))
                }
                Some(HeapObject::Closure(c)) => format!("#<procedure @{}>", c.label),
                Some(HeapObject::Continuation(_)) => "#<continuation>".into(),
                None => format!("#<invalid {}>", h),
            },
            other => other.to_string(),
        }
    }

    /// Source text for a quoted code list; `None` if it holds something
    /// that has no source form.
    pub fn render_source(&self, value: &Value) -> Option<String> {
        match value {
            Value::Number(n) => Some(format_number(*n)),
            Value::Boolean(b) => Some(if *b { "#t".into() } else { "#f".into() }),
            Value::Symbol(s) | Value::Keyword(s) => Some(s.clone()),
            Value::Label(_) => None,
            Value::Handle(h) => match self.get(*h)? {
                HeapObject::Str(s) => Some(format!("{:?}", s)),
                HeapObject::List(items) => {
                    let parts = items.iter().map(|v| self.render_source(v)).collect::<Option<Vec<_>>>()?;
                    Some(format!("({})", parts.join(" ")))
                }
                _ => None,
            },
        }
    }

    // ── Collection ──

    /// Mark everything reachable from `roots` and the statics, then free
    /// the rest. Returns the number of objects freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Handle>) -> usize {
        let mut pending: Vec<Handle> = roots.into_iter().collect();
        pending.extend(
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.as_ref().is_some_and(|s| s.meta.is_static))
                .map(|(i, _)| Handle(i)),
        );

        while let Some(handle) = pending.pop() {
            let Some(Some(slot)) = self.slots.get_mut(handle.0) else { continue };
            if slot.meta.status == ObjectStatus::Marked {
                continue;
            }
            slot.meta.status = ObjectStatus::Marked;
            match &slot.object {
                HeapObject::Str(_) => {}
                HeapObject::List(items) => pending.extend(items.iter().filter_map(Value::as_handle)),
                HeapObject::Closure(c) => {
                    pending.extend(c.parent);
                    pending.extend(c.values().filter_map(Value::as_handle));
                }
                HeapObject::Continuation(k) => {
                    pending.extend(k.closure);
                    pending.extend(k.operand_stack.iter().filter_map(Value::as_handle));
                    pending.extend(k.call_stack.iter().filter_map(|f| f.closure));
                }
            }
        }

        let mut freed = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            let Some(slot) = entry else { continue };
            match slot.meta.status {
                ObjectStatus::Marked => slot.meta.status = ObjectStatus::Live,
                ObjectStatus::Live if !slot.meta.is_static => {
                    *entry = None;
                    self.free.push(index);
                    freed += 1;
                }
                ObjectStatus::Live => {}
            }
        }
        self.dynamic -= freed;
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_compiler::compiler::ail::Argument;
    use std::collections::HashMap;

    fn statics() -> BTreeMap<Handle, StaticObject> {
        let mut s = BTreeMap::new();
        s.insert(Handle(3), StaticObject::Str("hi".into()));
        s.insert(
            Handle(5),
            StaticObject::List(vec![Argument::Number(1.0), Argument::Handle(Handle(3)), Argument::Symbol("x".into())]),
        );
        s
    }

    #[test]
    fn test_statics_keep_their_handles() {
        let heap = Heap::with_statics(&statics());
        assert_eq!(heap.string(Handle(3)), Some("hi"));
        assert_eq!(heap.list(Handle(5)).map(|l| l.len()), Some(3));
        assert!(heap.metadata(Handle(5)).unwrap().is_static);
        assert!(heap.get(Handle(4)).is_none());
    }

    #[test]
    fn test_allocation_goes_after_statics() {
        let mut heap = Heap::with_statics(&statics());
        let h = heap.allocate(HeapObject::Str("new".into()), None);
        assert_eq!(h, Handle(6));
        assert_eq!(heap.dynamic_count(), 1);
    }

    #[test]
    fn test_statics_are_read_only() {
        let mut heap = Heap::with_statics(&statics());
        assert!(heap.get_mut(Handle(3)).is_none());
    }

    #[test]
    fn test_display_nested_list() {
        let heap = Heap::with_statics(&statics());
        assert_eq!(heap.display_value(&Value::Handle(Handle(5))), "(1 hi x)");
        assert_eq!(heap.render_source(&Value::Handle(Handle(5))).unwrap(), "(1 \"hi\" x)");
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let kept_list = heap.allocate(HeapObject::Str("kept".into()), None);
        let mut bound = Closure::new("&1", 0, None, HashMap::new());
        bound.bind("s", Value::Handle(kept_list));
        let root = heap.allocate(HeapObject::Closure(bound), None);
        let child = heap.allocate(HeapObject::Closure(Closure::new("&2", 0, Some(root), HashMap::new())), None);
        let garbage = heap.allocate(HeapObject::List(vec![Value::Number(1.0)]), None);

        let freed = heap.collect([child]);
        assert_eq!(freed, 1);
        assert!(heap.get(garbage).is_none());
        assert!(heap.get(root).is_some());
        assert_eq!(heap.string(kept_list), Some("kept"));

        // freed slot is reused
        let reused = heap.allocate(HeapObject::Str("again".into()), None);
        assert_eq!(reused, garbage);
    }

    #[test]
    fn test_collect_keeps_statics() {
        let mut heap = Heap::with_statics(&statics());
        assert_eq!(heap.collect([]), 0);
        assert!(heap.get(Handle(3)).is_some());
    }
}
