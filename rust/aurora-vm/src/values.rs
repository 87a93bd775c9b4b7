//! Operand values for the Aurora process VM.

use aurora_compiler::compiler::ail::Argument;
use aurora_compiler::compiler::ast::{format_number, Handle};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value on the operand stack or bound to a variable.
///
/// Strings, lists, closures and continuations live on the heap and are
/// referred to by [`Value::Handle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Symbol(String),
    /// A primitive operator used as a first-class value.
    Keyword(String),
    Handle(Handle),
    /// A lambda's code label, not yet turned into a closure.
    Label(String),
}

impl Value {
    /// Everything except `#f` counts as true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "primitive",
            Value::Handle(_) => "object",
            Value::Label(_) => "procedure",
        }
    }

    /// The literal an instruction argument denotes. Variables have none.
    pub fn from_argument(arg: &Argument) -> Option<Value> {
        Some(match arg {
            Argument::Number(n) => Value::Number(*n),
            Argument::Boolean(b) => Value::Boolean(*b),
            Argument::Symbol(s) => Value::Symbol(s.clone()),
            Argument::Keyword(k) => Value::Keyword(k.clone()),
            Argument::Label(l) => Value::Label(l.clone()),
            Argument::Handle(h) => Value::Handle(*h),
            Argument::Variable(_) => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Boolean(true) => write!(f, "#t"),
            Value::Boolean(false) => write!(f, "#f"),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Keyword(k) => write!(f, "{}", k),
            Value::Handle(h) => write!(f, "{}", h),
            Value::Label(l) => write!(f, "#<procedure @{}>", l),
        }
    }
}
