//! AIL (Aurora Intermediate Language) data types.
//!
//! A program is a flat list of instructions. Each one is a comment, a label
//! definition or an opcode with at most one argument. The text form is one
//! instruction per line:
//!
//! ```text
//! ; comment
//! @label
//! mnemonic [argument]
//! ```

use crate::compiler::ast::{format_number, is_keyword, Handle};
use crate::compiler::lexer::looks_numeric;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AilError {
    #[error("duplicate label @{0}")]
    DuplicateLabel(String),
    #[error("unknown opcode '{text}' on line {line}")]
    UnknownOpcode { text: String, line: usize },
    #[error("opcode {opcode} on line {line} requires an argument")]
    MissingArgument { opcode: Opcode, line: usize },
}

/// Opcodes of the process VM.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    // Memory
    Store,
    Load,
    LoadClosure,
    Push,
    Pop,
    Swap,
    Set,

    // Control
    Call,
    TailCall,
    Return,
    CaptureCc,
    IfTrue,
    IfFalse,
    Goto,

    // Lists
    Car,
    Cdr,
    Cons,

    // Arithmetic and logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eqn,
    Ge,
    Le,
    Gt,
    Lt,
    Not,
    And,
    Or,

    // System
    Fork,
    Display,
    Newline,
    Nop,
    Pause,
    Halt,
}

impl Opcode {
    pub fn takes_argument(self) -> bool {
        matches!(
            self,
            Opcode::Store
                | Opcode::Load
                | Opcode::LoadClosure
                | Opcode::Push
                | Opcode::Set
                | Opcode::Call
                | Opcode::TailCall
                | Opcode::CaptureCc
                | Opcode::IfTrue
                | Opcode::IfFalse
                | Opcode::Goto
                | Opcode::Fork
        )
    }

    /// The opcode implementing a primitive keyword, for keywords that can be
    /// used as first-class values.
    pub fn for_primitive(keyword: &str) -> Option<Opcode> {
        Some(match keyword {
            "+" => Opcode::Add,
            "-" => Opcode::Sub,
            "*" => Opcode::Mul,
            "/" => Opcode::Div,
            "%" => Opcode::Mod,
            "pow" => Opcode::Pow,
            "=" => Opcode::Eqn,
            "<" => Opcode::Lt,
            ">" => Opcode::Gt,
            "<=" => Opcode::Le,
            ">=" => Opcode::Ge,
            "not" => Opcode::Not,
            "and" => Opcode::And,
            "or" => Opcode::Or,
            "car" => Opcode::Car,
            "cdr" => Opcode::Cdr,
            "cons" => Opcode::Cons,
            "display" => Opcode::Display,
            "newline" => Opcode::Newline,
            _ => return None,
        })
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Argument {
    Number(f64),
    Boolean(bool),
    /// Quoted symbol, without the leading `'`.
    Symbol(String),
    Keyword(String),
    Variable(String),
    /// Label name, without the leading `@`.
    Label(String),
    Handle(Handle),
}

impl Argument {
    /// Classify a textual operand.
    ///
    /// `&` followed only by digits is a handle; any other `&` token is a
    /// renamed variable such as `&3.x`.
    pub fn classify(token: &str) -> Argument {
        if let Some(digits) = token.strip_prefix('&') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = digits.parse::<usize>() {
                    return Argument::Handle(Handle(n));
                }
            }
            return Argument::Variable(token.to_string());
        }
        if let Some(label) = token.strip_prefix('@') {
            return Argument::Label(label.to_string());
        }
        if let Some(symbol) = token.strip_prefix('\'') {
            return Argument::Symbol(symbol.to_string());
        }
        match token {
            "#t" => Argument::Boolean(true),
            "#f" => Argument::Boolean(false),
            _ if looks_numeric(token) => match token.parse::<f64>() {
                Ok(n) => Argument::Number(n),
                Err(_) => Argument::Variable(token.to_string()),
            },
            _ if is_keyword(token) => Argument::Keyword(token.to_string()),
            _ => Argument::Variable(token.to_string()),
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Number(n) => write!(f, "{}", format_number(*n)),
            Argument::Boolean(true) => write!(f, "#t"),
            Argument::Boolean(false) => write!(f, "#f"),
            Argument::Symbol(s) => write!(f, "'{}", s),
            Argument::Keyword(k) => write!(f, "{}", k),
            Argument::Variable(v) => write!(f, "{}", v),
            Argument::Label(l) => write!(f, "@{}", l),
            Argument::Handle(h) => write!(f, "{}", h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Instruction {
    Comment { text: String },
    Label { name: String },
    Op { opcode: Opcode, argument: Option<Argument> },
}

impl Instruction {
    pub fn op(opcode: Opcode) -> Self {
        Instruction::Op { opcode, argument: None }
    }

    pub fn with(opcode: Opcode, argument: Argument) -> Self {
        Instruction::Op { opcode, argument: Some(argument) }
    }

    pub fn label(name: impl Into<String>) -> Self {
        Instruction::Label { name: name.into() }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Instruction::Comment { text: text.into() }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Instruction::Op { opcode, .. } => Some(*opcode),
            _ => None,
        }
    }

    /// Parse one line of AIL text. Blank lines yield `None`.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Option<Instruction>, AilError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if let Some(text) = line.strip_prefix(';') {
            return Ok(Some(Instruction::comment(text)));
        }
        if let Some(name) = line.strip_prefix('@') {
            return Ok(Some(Instruction::label(name.trim())));
        }
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, r)) => (m, r.trim()),
            None => (line, ""),
        };
        let opcode = Opcode::from_str(mnemonic)
            .map_err(|_| AilError::UnknownOpcode { text: mnemonic.to_string(), line: line_no })?;
        let argument = if rest.is_empty() { None } else { Some(Argument::classify(rest)) };
        if argument.is_none() && opcode.takes_argument() {
            return Err(AilError::MissingArgument { opcode, line: line_no });
        }
        Ok(Some(Instruction::Op { opcode, argument }))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Comment { text } => write!(f, ";{}", text),
            Instruction::Label { name } => write!(f, "@{}", name),
            Instruction::Op { opcode, argument: Some(arg) } => write!(f, "{} {}", opcode, arg),
            Instruction::Op { opcode, argument: None } => write!(f, "{}", opcode),
        }
    }
}

/// Compile-time constant referenced by handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StaticObject {
    Str(String),
    /// Quoted list; nested lists and strings are handles to other statics.
    List(Vec<Argument>),
}

/// A compiled module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub statics: BTreeMap<Handle, StaticObject>,
    /// Top-level variables, renamed → original.
    pub top_level: BTreeMap<String, String>,
    /// Lambda label → label of the lexically enclosing lambda.
    pub enclosing: BTreeMap<String, String>,
    pub natives: BTreeSet<String>,
    pub source_hash: String,
}

impl Program {
    pub fn from_instructions(instructions: Vec<Instruction>) -> Self {
        Self { instructions, ..Self::default() }
    }

    /// Parse a text listing. The text form carries no statics.
    pub fn from_ail_text(text: &str) -> Result<Self, AilError> {
        let mut instructions = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if let Some(inst) = Instruction::parse_line(line, i + 1)? {
                instructions.push(inst);
            }
        }
        Ok(Self::from_instructions(instructions))
    }

    pub fn to_ail_text(&self) -> String {
        let mut out = String::new();
        for inst in &self.instructions {
            out.push_str(&inst.to_string());
            out.push('\n');
        }
        out
    }

    /// Render a static object as source text, recursing into nested lists.
    pub fn render_static(&self, handle: Handle) -> Option<String> {
        match self.statics.get(&handle)? {
            StaticObject::Str(s) => Some(format!("{:?}", s)),
            StaticObject::List(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(match item {
                        Argument::Handle(h) => self.render_static(*h)?,
                        Argument::Symbol(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
                Some(format!("({})", parts.join(" ")))
            }
        }
    }
}

/// Label name → instruction index.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<String, usize>,
}

impl LabelTable {
    /// Record every label definition in one forward scan.
    pub fn analyse(instructions: &[Instruction]) -> Result<Self, AilError> {
        let mut labels = HashMap::new();
        for (index, inst) in instructions.iter().enumerate() {
            if let Instruction::Label { name } = inst {
                if labels.insert(name.clone(), index).is_some() {
                    return Err(AilError::DuplicateLabel(name.clone()));
                }
            }
        }
        Ok(Self { labels })
    }

    pub fn get(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
