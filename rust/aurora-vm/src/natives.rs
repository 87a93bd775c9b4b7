//! Native libraries callable from Aurora code as `Lib.fn`.
//!
//! A program declares the libraries it uses with `(native Lib)`. The VM pops
//! the function's arity worth of arguments (first argument first) and the
//! function either answers at once or hands back a job to run off-thread.

use crate::values::Value;
use crate::vm::Process;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("unknown native function: {0}")]
    Unknown(String),
    #[error("{function}: {message}")]
    BadArgument { function: String, message: String },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("native job panicked: {0}")]
    Panicked(String),
}

/// Plain result of an asynchronous native job, converted into a value on
/// the owning process when the job completes.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeOutput {
    Number(f64),
    Boolean(bool),
    Text(String),
    Nothing,
}

pub type AsyncJob = Box<dyn FnOnce() -> Result<NativeOutput, NativeError> + Send>;

pub enum NativeResult {
    Value(Value),
    Pending(AsyncJob),
}

pub struct NativeContext<'a> {
    pub pid: u64,
    pub library: &'a str,
    pub function: &'a str,
}

impl NativeContext<'_> {
    fn bad_argument(&self, message: impl Into<String>) -> NativeError {
        NativeError::BadArgument { function: format!("{}.{}", self.library, self.function), message: message.into() }
    }
}

pub trait NativeFunction: Send + Sync {
    fn arity(&self) -> usize;
    fn invoke(&self, args: Vec<Value>, process: &mut Process, ctx: &NativeContext) -> Result<NativeResult, NativeError>;
}

#[derive(Default, Clone)]
pub struct NativeLibrary {
    functions: HashMap<String, Arc<dyn NativeFunction>>,
}

impl NativeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, function: impl NativeFunction + 'static) -> Self {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Native libraries keyed by name.
#[derive(Default, Clone)]
pub struct NativeRegistry {
    libraries: HashMap<String, NativeLibrary>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `Math`, `String` and `File` libraries.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Math", math_library());
        registry.register("String", string_library());
        registry.register("File", file_library());
        registry
    }

    pub fn register(&mut self, name: &str, library: NativeLibrary) {
        self.libraries.insert(name.to_string(), library);
    }

    pub fn lookup(&self, library: &str, function: &str) -> Option<Arc<dyn NativeFunction>> {
        self.libraries.get(library)?.get(function)
    }

    pub fn libraries(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }
}

// ── Math ──

struct MathFn {
    arity: usize,
    apply: fn(&[f64]) -> f64,
}

impl NativeFunction for MathFn {
    fn arity(&self) -> usize {
        self.arity
    }

    fn invoke(&self, args: Vec<Value>, _process: &mut Process, ctx: &NativeContext) -> Result<NativeResult, NativeError> {
        let numbers = args
            .iter()
            .map(|a| a.as_number().ok_or_else(|| ctx.bad_argument(format!("expected a number, got {}", a.type_name()))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NativeResult::Value(Value::Number((self.apply)(&numbers))))
    }
}

fn math_library() -> NativeLibrary {
    NativeLibrary::new()
        .with("sqrt", MathFn { arity: 1, apply: |a| a[0].sqrt() })
        .with("floor", MathFn { arity: 1, apply: |a| a[0].floor() })
        .with("ceil", MathFn { arity: 1, apply: |a| a[0].ceil() })
        .with("abs", MathFn { arity: 1, apply: |a| a[0].abs() })
        .with("round", MathFn { arity: 1, apply: |a| a[0].round() })
        .with("min", MathFn { arity: 2, apply: |a| a[0].min(a[1]) })
        .with("max", MathFn { arity: 2, apply: |a| a[0].max(a[1]) })
}

// ── String ──

#[derive(Clone, Copy)]
enum StringOp {
    Length,
    Concat,
    Upcase,
    Downcase,
    FromNumber,
}

impl NativeFunction for StringOp {
    fn arity(&self) -> usize {
        match self {
            StringOp::Concat => 2,
            _ => 1,
        }
    }

    fn invoke(&self, args: Vec<Value>, process: &mut Process, ctx: &NativeContext) -> Result<NativeResult, NativeError> {
        let text = |i: usize| {
            process
                .string_value(&args[i])
                .map(str::to_string)
                .ok_or_else(|| ctx.bad_argument(format!("expected a string, got {}", args[i].type_name())))
        };
        let value = match self {
            StringOp::Length => Value::Number(text(0)?.chars().count() as f64),
            StringOp::Concat => {
                let joined = text(0)? + &text(1)?;
                process.new_string(joined)
            }
            StringOp::Upcase => {
                let s = text(0)?.to_uppercase();
                process.new_string(s)
            }
            StringOp::Downcase => {
                let s = text(0)?.to_lowercase();
                process.new_string(s)
            }
            StringOp::FromNumber => {
                let n = args[0].as_number().ok_or_else(|| ctx.bad_argument("expected a number"))?;
                process.new_string(Value::Number(n).to_string())
            }
        };
        Ok(NativeResult::Value(value))
    }
}

fn string_library() -> NativeLibrary {
    NativeLibrary::new()
        .with("length", StringOp::Length)
        .with("concat", StringOp::Concat)
        .with("upcase", StringOp::Upcase)
        .with("downcase", StringOp::Downcase)
        .with("fromNumber", StringOp::FromNumber)
}

// ── File ──

/// File access runs on a worker thread; the process sleeps meanwhile.
#[derive(Clone, Copy)]
enum FileOp {
    Read,
    Write,
}

impl NativeFunction for FileOp {
    fn arity(&self) -> usize {
        match self {
            FileOp::Read => 1,
            FileOp::Write => 2,
        }
    }

    fn invoke(&self, args: Vec<Value>, process: &mut Process, ctx: &NativeContext) -> Result<NativeResult, NativeError> {
        let path = process
            .string_value(&args[0])
            .map(str::to_string)
            .ok_or_else(|| ctx.bad_argument("expected a path string"))?;
        let job: AsyncJob = match self {
            FileOp::Read => Box::new(move || {
                std::fs::read_to_string(&path)
                    .map(NativeOutput::Text)
                    .map_err(|e| NativeError::Io(format!("{}: {}", path, e)))
            }),
            FileOp::Write => {
                let content = match process.string_value(&args[1]) {
                    Some(s) => s.to_string(),
                    None => process.display_value(&args[1]),
                };
                Box::new(move || {
                    std::fs::write(&path, content)
                        .map(|_| NativeOutput::Boolean(true))
                        .map_err(|e| NativeError::Io(format!("{}: {}", path, e)))
                })
            }
        };
        Ok(NativeResult::Pending(job))
    }
}

fn file_library() -> NativeLibrary {
    NativeLibrary::new().with("read", FileOp::Read).with("write", FileOp::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use aurora_compiler::compiler::ail::Program;

    fn process() -> Process {
        Process::new(1, Arc::new(Program::default()), RuntimeConfig::default(), Arc::new(NativeRegistry::new()))
            .unwrap()
    }

    fn invoke(p: &mut Process, library: &str, function: &str, args: Vec<Value>) -> Result<NativeResult, NativeError> {
        let registry = NativeRegistry::with_builtins();
        let native = registry.lookup(library, function).unwrap();
        assert_eq!(native.arity(), args.len());
        native.invoke(args, p, &NativeContext { pid: 1, library, function })
    }

    fn value(result: Result<NativeResult, NativeError>) -> Value {
        match result.unwrap() {
            NativeResult::Value(v) => v,
            NativeResult::Pending(_) => panic!("expected an immediate value"),
        }
    }

    #[test]
    fn test_math() {
        let mut p = process();
        assert_eq!(value(invoke(&mut p, "Math", "sqrt", vec![Value::Number(16.0)])), Value::Number(4.0));
        assert_eq!(
            value(invoke(&mut p, "Math", "max", vec![Value::Number(2.0), Value::Number(5.0)])),
            Value::Number(5.0)
        );
        let err = invoke(&mut p, "Math", "floor", vec![Value::Boolean(true)]).err().unwrap();
        assert!(matches!(err, NativeError::BadArgument { ref function, .. } if function == "Math.floor"));
    }

    #[test]
    fn test_strings() {
        let mut p = process();
        let a = p.new_string("Hello, ");
        let b = p.new_string("World");
        let joined = value(invoke(&mut p, "String", "concat", vec![a, b]));
        assert_eq!(p.string_value(&joined), Some("Hello, World"));
        let upper = value(invoke(&mut p, "String", "upcase", vec![joined.clone()]));
        assert_eq!(p.string_value(&upper), Some("HELLO, WORLD"));
        assert_eq!(value(invoke(&mut p, "String", "length", vec![joined])), Value::Number(12.0));
        let n = value(invoke(&mut p, "String", "fromNumber", vec![Value::Number(2.5)]));
        assert_eq!(p.string_value(&n), Some("2.5"));
    }

    #[test]
    fn test_file_read_is_async() {
        let mut p = process();
        let path = p.new_string("/definitely/not/here.txt");
        match invoke(&mut p, "File", "read", vec![path]).unwrap() {
            NativeResult::Pending(job) => assert!(matches!(job(), Err(NativeError::Io(_)))),
            NativeResult::Value(_) => panic!("file reads must not block the process"),
        }
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = NativeRegistry::with_builtins();
        assert!(registry.lookup("Math", "tan").is_none());
        assert!(registry.lookup("Net", "get").is_none());
        assert_eq!(registry.libraries().count(), 3);
    }
}
